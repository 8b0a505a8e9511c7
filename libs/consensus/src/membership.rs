//! Cluster membership and quorum computation
//!
//! A [`Configuration`] names the members of a replication group. While a
//! configuration carries a non-empty `old_members` set the group is in joint
//! consensus: every decision needs a majority of the new set *and* of the old
//! set. [`ClusterMembership`] keeps the active configuration together with the
//! per-member replication progress the leader tracks.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// How a member participates in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberType {
    /// Votes in elections and counts toward commit quorums
    Active,
    /// Receives the replicated log but never votes
    Passive,
    /// Neither votes nor receives replication
    Inactive,
}

impl MemberType {
    pub fn is_voting(self) -> bool {
        matches!(self, MemberType::Active)
    }

    pub fn is_replicated(self) -> bool {
        matches!(self, MemberType::Active | MemberType::Passive)
    }
}

impl std::fmt::Display for MemberType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberType::Active => write!(f, "Active"),
            MemberType::Passive => write!(f, "Passive"),
            MemberType::Inactive => write!(f, "Inactive"),
        }
    }
}

/// A single member of a configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub member_type: MemberType,
    /// Wall-clock time (ms) of the last change to this member
    pub updated: i64,
}

impl Member {
    pub fn new(id: NodeId, member_type: MemberType) -> Self {
        Self {
            id,
            member_type,
            updated: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn active(id: NodeId) -> Self {
        Self::new(id, MemberType::Active)
    }

    pub fn passive(id: NodeId) -> Self {
        Self::new(id, MemberType::Passive)
    }
}

/// A membership configuration as stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Index of the log entry that introduced this configuration
    pub index: LogIndex,
    /// Term of the log entry that introduced this configuration
    pub term: Term,
    /// Wall-clock time (ms) at which the configuration was created
    pub time: i64,
    pub new_members: Vec<Member>,
    /// Non-empty only while in joint consensus
    pub old_members: Vec<Member>,
}

impl Configuration {
    /// The configuration a group starts from before anything was logged
    pub fn bootstrap(members: Vec<Member>) -> Self {
        Self {
            index: LogIndex::ZERO,
            term: Term(0),
            time: chrono::Utc::now().timestamp_millis(),
            new_members: members,
            old_members: Vec::new(),
        }
    }

    pub fn requires_joint_consensus(&self) -> bool {
        !self.old_members.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.new_members.len() + self.old_members.len()
    }

    /// The type a member has in this configuration
    ///
    /// The new set wins; a member only present in the old set keeps its old
    /// type until joint consensus ends.
    pub fn member_type(&self, id: NodeId) -> MemberType {
        self.new_members
            .iter()
            .chain(self.old_members.iter())
            .find(|m| m.id == id)
            .map(|m| m.member_type)
            .unwrap_or(MemberType::Inactive)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.new_members
            .iter()
            .chain(self.old_members.iter())
            .any(|m| m.id == id)
    }

    pub fn member_ids(&self) -> BTreeSet<NodeId> {
        self.new_members
            .iter()
            .chain(self.old_members.iter())
            .map(|m| m.id)
            .collect()
    }

    /// Whether `members` describes exactly this (non-joint) membership
    pub fn has_same_members(&self, members: &[Member]) -> bool {
        if self.requires_joint_consensus() {
            return false;
        }
        let current: BTreeMap<NodeId, MemberType> = self
            .new_members
            .iter()
            .map(|m| (m.id, m.member_type))
            .collect();
        let proposed: BTreeMap<NodeId, MemberType> =
            members.iter().map(|m| (m.id, m.member_type)).collect();
        current == proposed
    }
}

/// Progress of an in-flight snapshot transfer to one member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTransfer {
    pub index: LogIndex,
    pub offset: u64,
}

/// Leader-side bookkeeping for a remote member
#[derive(Debug, Clone)]
pub struct MemberContext {
    pub id: NodeId,
    /// Next log index to send
    pub next_index: LogIndex,
    /// Highest index known to be replicated on the member
    pub match_index: LogIndex,
    /// Whether the member granted its vote in the current election
    pub vote_granted: bool,
    /// Whether an AppendEntries/InstallSnapshot request is outstanding
    pub in_flight: bool,
    pub failure_count: u32,
    pub backoff_until: Option<Instant>,
    pub last_response: Option<Instant>,
    pub snapshot_transfer: Option<SnapshotTransfer>,
}

impl MemberContext {
    pub fn new(id: NodeId, next_index: LogIndex) -> Self {
        Self {
            id,
            next_index,
            match_index: LogIndex::ZERO,
            vote_granted: false,
            in_flight: false,
            failure_count: 0,
            backoff_until: None,
            last_response: None,
            snapshot_transfer: None,
        }
    }

    /// Reset replication progress, as done by a new leader
    pub fn reset(&mut self, next_index: LogIndex) {
        self.next_index = next_index;
        self.match_index = LogIndex::ZERO;
        self.in_flight = false;
        self.failure_count = 0;
        self.backoff_until = None;
        self.last_response = None;
        self.snapshot_transfer = None;
    }

    /// Whether a new request may be sent to this member now
    pub fn is_available(&self, now: Instant) -> bool {
        !self.in_flight && self.backoff_until.map_or(true, |until| now >= until)
    }

    pub fn record_failure(&mut self, now: Instant, backoff: Duration) {
        self.in_flight = false;
        self.failure_count = self.failure_count.saturating_add(1);
        self.backoff_until = Some(now + backoff);
    }

    pub fn record_response(&mut self, now: Instant) {
        self.in_flight = false;
        self.failure_count = 0;
        self.backoff_until = None;
        self.last_response = Some(now);
    }
}

/// The active configuration plus per-member progress
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    local: NodeId,
    configuration: Configuration,
    members: BTreeMap<NodeId, MemberContext>,
}

impl ClusterMembership {
    pub fn new(local: NodeId, configuration: Configuration) -> Self {
        let mut membership = Self {
            local,
            configuration: configuration.clone(),
            members: BTreeMap::new(),
        };
        membership.configure(configuration, LogIndex(1));
        membership
    }

    /// Replace the effective configuration
    ///
    /// Members absent from both sets lose their context; members that remain
    /// keep their progress even when their type changes; new members start at
    /// `next_index`.
    pub fn configure(&mut self, configuration: Configuration, next_index: LogIndex) {
        let local = self.local;
        let ids = configuration.member_ids();
        self.members.retain(|id, _| ids.contains(id) && *id != local);
        for id in ids {
            if id != local {
                self.members
                    .entry(id)
                    .or_insert_with(|| MemberContext::new(id, next_index));
            }
        }
        self.configuration = configuration;
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn local_member_type(&self) -> MemberType {
        self.configuration.member_type(self.local)
    }

    pub fn in_joint_consensus(&self) -> bool {
        self.configuration.requires_joint_consensus()
    }

    /// Whether `id` votes in the new or the old set
    pub fn is_voting_member(&self, id: NodeId) -> bool {
        self.configuration
            .new_members
            .iter()
            .chain(self.configuration.old_members.iter())
            .any(|m| m.id == id && m.member_type.is_voting())
    }

    /// Union of the voting members of both sets, including the local member
    pub fn voting_members(&self) -> Vec<NodeId> {
        let voters: BTreeSet<NodeId> = self
            .configuration
            .new_members
            .iter()
            .chain(self.configuration.old_members.iter())
            .filter(|m| m.member_type.is_voting())
            .map(|m| m.id)
            .collect();
        voters.into_iter().collect()
    }

    pub fn remote_voting_members(&self) -> Vec<NodeId> {
        self.voting_members()
            .into_iter()
            .filter(|id| *id != self.local)
            .collect()
    }

    /// Remote members that receive replication in either set
    pub fn replication_targets(&self) -> Vec<NodeId> {
        let targets: BTreeSet<NodeId> = self
            .configuration
            .new_members
            .iter()
            .chain(self.configuration.old_members.iter())
            .filter(|m| m.id != self.local && m.member_type.is_replicated())
            .map(|m| m.id)
            .collect();
        targets.into_iter().collect()
    }

    pub fn is_single_member_cluster(&self) -> bool {
        self.is_voting_member(self.local) && self.remote_voting_members().is_empty()
    }

    pub fn member(&self, id: NodeId) -> Option<&MemberContext> {
        self.members.get(&id)
    }

    pub fn member_mut(&mut self, id: NodeId) -> Option<&mut MemberContext> {
        self.members.get_mut(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberContext> {
        self.members.values()
    }

    pub fn reset_votes(&mut self) {
        for member in self.members.values_mut() {
            member.vote_granted = false;
        }
    }

    pub fn reset_progress(&mut self, next_index: LogIndex) {
        for member in self.members.values_mut() {
            member.reset(next_index);
        }
    }

    /// The greatest value acknowledged by a quorum
    ///
    /// For each set the values of its voting members are sorted in
    /// descending order and the value at position `n / 2` is taken; the local
    /// member contributes `local_value`. Under joint consensus the smaller of
    /// the two per-set results is returned. `None` when no set has voters.
    pub fn quorum_for<T, F>(&self, local_value: T, extractor: F) -> Option<T>
    where
        T: Ord + Copy,
        F: Fn(&MemberContext) -> T,
    {
        let new = self.quorum_for_set(&self.configuration.new_members, local_value, &extractor);
        let old = self.quorum_for_set(&self.configuration.old_members, local_value, &extractor);
        match (new, old) {
            (Some(new), Some(old)) => Some(new.min(old)),
            (new, old) => new.or(old),
        }
    }

    fn quorum_for_set<T, F>(&self, set: &[Member], local_value: T, extractor: &F) -> Option<T>
    where
        T: Ord + Copy,
        F: Fn(&MemberContext) -> T,
    {
        let mut values: Vec<T> = set
            .iter()
            .filter(|m| m.member_type.is_voting())
            .filter_map(|m| {
                if m.id == self.local {
                    Some(local_value)
                } else {
                    self.members.get(&m.id).map(extractor)
                }
            })
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_unstable_by(|a, b| b.cmp(a));
        Some(values[values.len() / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn active(ids: &[u64]) -> Vec<Member> {
        ids.iter().map(|&id| Member::active(NodeId(id))).collect()
    }

    fn membership(local: u64, ids: &[u64]) -> ClusterMembership {
        ClusterMembership::new(NodeId(local), Configuration::bootstrap(active(ids)))
    }

    fn set_match(membership: &mut ClusterMembership, id: u64, index: u64) {
        membership.member_mut(NodeId(id)).unwrap().match_index = LogIndex(index);
    }

    #[test]
    fn test_single_member_quorum_is_own_value() {
        let cluster = membership(1, &[1]);
        assert!(cluster.is_single_member_cluster());
        assert!(cluster.replication_targets().is_empty());
        assert_eq!(
            cluster.quorum_for(LogIndex(7), |m| m.match_index),
            Some(LogIndex(7))
        );
        assert_eq!(cluster.quorum_for(true, |m| m.vote_granted), Some(true));
    }

    #[test]
    fn test_three_member_quorum() {
        let mut cluster = membership(1, &[1, 2, 3]);
        set_match(&mut cluster, 2, 5);
        set_match(&mut cluster, 3, 2);
        assert_eq!(
            cluster.quorum_for(LogIndex(9), |m| m.match_index),
            Some(LogIndex(5))
        );

        // Votes: own vote alone is not a majority
        assert_eq!(cluster.quorum_for(true, |m| m.vote_granted), Some(false));
        cluster.member_mut(NodeId(3)).unwrap().vote_granted = true;
        assert_eq!(cluster.quorum_for(true, |m| m.vote_granted), Some(true));
    }

    #[test]
    fn test_joint_consensus_takes_minimum() {
        let mut cluster = membership(1, &[1, 2, 3]);
        let joint = Configuration {
            index: LogIndex(4),
            term: Term(1),
            time: 0,
            new_members: active(&[1, 4, 5]),
            old_members: active(&[1, 2, 3]),
        };
        cluster.configure(joint, LogIndex(4));
        assert!(cluster.in_joint_consensus());
        assert_eq!(cluster.replication_targets().len(), 4);

        set_match(&mut cluster, 2, 10);
        set_match(&mut cluster, 3, 10);
        set_match(&mut cluster, 4, 3);
        set_match(&mut cluster, 5, 0);

        // Old set agrees on 10, new set only on 3
        assert_eq!(
            cluster.quorum_for(LogIndex(10), |m| m.match_index),
            Some(LogIndex(3))
        );
    }

    #[test]
    fn test_demotion_removes_voter_immediately() {
        let mut cluster = membership(1, &[1, 2, 3]);
        let mut members = active(&[1, 2]);
        members.push(Member::passive(NodeId(3)));
        cluster.configure(
            Configuration {
                index: LogIndex(2),
                term: Term(1),
                time: 0,
                new_members: members,
                old_members: Vec::new(),
            },
            LogIndex(2),
        );

        assert_eq!(cluster.voting_members(), vec![NodeId(1), NodeId(2)]);
        assert_eq!(cluster.replication_targets(), vec![NodeId(2), NodeId(3)]);

        set_match(&mut cluster, 2, 1);
        set_match(&mut cluster, 3, 8);
        // The passive member's progress no longer counts
        assert_eq!(
            cluster.quorum_for(LogIndex(8), |m| m.match_index),
            Some(LogIndex(1))
        );
    }

    #[test]
    fn test_shrink_to_single_member() {
        let mut cluster = membership(1, &[1, 2, 3]);
        set_match(&mut cluster, 2, 4);
        set_match(&mut cluster, 3, 0);
        // Before: 2-of-3
        assert_eq!(
            cluster.quorum_for(LogIndex(6), |m| m.match_index),
            Some(LogIndex(4))
        );

        cluster.configure(
            Configuration {
                index: LogIndex(7),
                term: Term(1),
                time: 0,
                new_members: active(&[1]),
                old_members: Vec::new(),
            },
            LogIndex(7),
        );

        assert!(cluster.replication_targets().is_empty());
        assert!(cluster.is_single_member_cluster());
        assert!(cluster.member(NodeId(2)).is_none());
        assert_eq!(
            cluster.quorum_for(LogIndex(6), |m| m.match_index),
            Some(LogIndex(6))
        );
    }

    #[test]
    fn test_configure_keeps_progress_of_remaining_members() {
        let mut cluster = membership(1, &[1, 2, 3]);
        set_match(&mut cluster, 2, 9);
        cluster.configure(Configuration::bootstrap(active(&[1, 2, 4])), LogIndex(12));

        assert_eq!(cluster.member(NodeId(2)).unwrap().match_index, LogIndex(9));
        assert_eq!(cluster.member(NodeId(4)).unwrap().next_index, LogIndex(12));
        assert!(cluster.member(NodeId(3)).is_none());
    }

    #[test]
    fn test_has_same_members_ignores_order_and_timestamps() {
        let config = Configuration::bootstrap(active(&[1, 2, 3]));
        assert!(config.has_same_members(&active(&[3, 1, 2])));
        assert!(!config.has_same_members(&active(&[1, 2])));
    }

    fn majority_acknowledges(values: &[u64], quorum: u64) -> bool {
        let acked = values.iter().filter(|&&v| v >= quorum).count();
        acked > values.len() / 2
    }

    proptest! {
        #[test]
        fn prop_joint_quorum_is_acknowledged_by_both_majorities(
            new_values in proptest::collection::vec(0u64..100, 1..6),
            old_values in proptest::collection::vec(0u64..100, 1..6),
        ) {
            // Member 1 is local in both sets; remaining ids are disjoint
            let new_ids: Vec<u64> = (0..new_values.len() as u64)
                .map(|i| if i == 0 { 1 } else { 10 + i })
                .collect();
            let old_ids: Vec<u64> = (0..old_values.len() as u64)
                .map(|i| if i == 0 { 1 } else { 20 + i })
                .collect();
            let mut cluster = ClusterMembership::new(NodeId(1), Configuration {
                index: LogIndex(1),
                term: Term(1),
                time: 0,
                new_members: active(&new_ids),
                old_members: active(&old_ids),
            });
            // The local member reports a single value shared by both sets
            let local = new_values[0];
            let mut old_values = old_values;
            old_values[0] = local;
            for (id, value) in new_ids.iter().zip(new_values.iter()).skip(1) {
                set_match(&mut cluster, *id, *value);
            }
            for (id, value) in old_ids.iter().zip(old_values.iter()).skip(1) {
                set_match(&mut cluster, *id, *value);
            }

            let quorum = cluster.quorum_for(LogIndex(local), |m| m.match_index).unwrap();
            prop_assert!(majority_acknowledges(&new_values, quorum.0));
            prop_assert!(majority_acknowledges(&old_values, quorum.0));
        }
    }
}
