//! Role, term and commit bookkeeping of a node

use crate::membership::MemberType;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// What a node currently does in its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Loading persisted state, not yet taking part
    Bootstrapping,
    /// Votes and accepts entries from the leader
    Follower,
    /// Campaigning for votes
    Candidate,
    /// Accepts proposals and replicates them
    Leader,
    /// Receives the log but never votes or campaigns
    Passive,
    /// Not a member of the current configuration
    Inactive,
}

impl RaftRole {
    /// The resting role for a member of the given type
    pub fn for_member_type(member_type: MemberType) -> Self {
        match member_type {
            MemberType::Active => RaftRole::Follower,
            MemberType::Passive => RaftRole::Passive,
            MemberType::Inactive => RaftRole::Inactive,
        }
    }

    /// Whether this role runs an election timer
    pub fn can_campaign(self) -> bool {
        matches!(self, RaftRole::Follower | RaftRole::Candidate)
    }
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Bootstrapping => write!(f, "Bootstrapping"),
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
            RaftRole::Passive => write!(f, "Passive"),
            RaftRole::Inactive => write!(f, "Inactive"),
        }
    }
}

/// Term and vote, stored by the [`MetaStore`](crate::MetaStore) before any
/// RPC that depends on them is answered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Highest term seen; never decreases
    pub current_term: Term,

    /// Whom this node voted for in `current_term`
    pub voted_for: Option<NodeId>,
}

/// State rebuilt after a restart
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest index known to be replicated on a quorum
    pub commit_index: LogIndex,
}

/// Role, term and commit bookkeeping of a node
#[derive(Debug)]
pub struct NodeState {
    pub role: RaftRole,

    pub id: NodeId,

    /// Leader of the current term, once known
    pub leader_id: Option<NodeId>,

    pub persistent: PersistentState,

    pub volatile: VolatileState,
}

impl NodeState {
    pub fn new(id: NodeId, persistent: PersistentState) -> Self {
        Self {
            role: RaftRole::Bootstrapping,
            id,
            leader_id: None,
            persistent,
            volatile: VolatileState::default(),
        }
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Adopt a newer term, clearing the vote; returns whether it changed
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            true
        } else {
            false
        }
    }

    /// Transition to a non-leading role suited to the member type
    pub fn become_follower(&mut self, member_type: MemberType, leader: Option<NodeId>) {
        self.role = RaftRole::for_member_type(member_type);
        self.leader_id = leader;
    }

    /// Start an election in the next term, voting for ourselves
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.persistent.current_term.increment();
        self.persistent.voted_for = Some(self.id);
        self.leader_id = None;
    }

    pub fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
    }

    /// Advance the commit index; it never moves backwards
    pub fn advance_commit(&mut self, index: LogIndex) -> bool {
        if index > self.volatile.commit_index {
            self.volatile.commit_index = index;
            true
        } else {
            false
        }
    }
}
