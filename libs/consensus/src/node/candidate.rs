//! Elections

use super::{RaftEvent, RaftNodeInner};
use crate::rpc::{RequestVoteRequest, RequestVoteResponse};
use crate::state::RaftRole;
use crate::types::{NodeId, Term};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

impl RaftNodeInner {
    /// Start an election after the election timeout elapsed
    pub(super) fn start_election(&mut self) -> Result<()> {
        if !self.cluster.is_voting_member(self.state.id) {
            self.enter_resting_role(None);
            return Ok(());
        }

        self.state.become_candidate();
        self.persist_vote()?;
        self.cluster.reset_votes();
        self.reset_election_timeout();
        self.metrics.elections_total.inc();
        self.publish_status();

        let term = self.state.current_term();
        info!("Node {} starting election for term {}", self.state.id, term);

        // Our own vote may already be a quorum
        if self.has_vote_quorum() {
            return self.become_leader();
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.state.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        for target in self.cluster.remote_voting_members() {
            let transport = Arc::clone(&self.transport);
            let events = self.events_tx.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let result = transport.request_vote(target, request).await;
                let _ = events.send(RaftEvent::VoteResult {
                    term,
                    from: target,
                    result,
                });
            });
        }

        Ok(())
    }

    pub(super) fn handle_vote_result(
        &mut self,
        term: Term,
        from: NodeId,
        result: Result<RequestVoteResponse>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!("Node {} got no vote from {}: {}", self.state.id, from, e);
                return Ok(());
            }
        };

        if response.term > self.state.current_term() {
            return self.step_down(response.term, None);
        }

        // Stale response from an earlier election
        if self.state.role != RaftRole::Candidate || term != self.state.current_term() {
            return Ok(());
        }

        if response.vote_granted {
            if let Some(member) = self.cluster.member_mut(from) {
                member.vote_granted = true;
            }
            debug!("Node {} received vote from {} in {}", self.state.id, from, term);
            if self.has_vote_quorum() {
                return self.become_leader();
            }
        }

        Ok(())
    }

    /// Votes are counted in both sets during joint consensus
    fn has_vote_quorum(&self) -> bool {
        self.cluster.quorum_for(true, |member| member.vote_granted) == Some(true)
    }
}
