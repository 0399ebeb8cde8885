//! The protocol kernel: term bookkeeping, vote granting, publish
//! accept/ack, and commit application.
//!
//! [`CoordinationState`] owns the single authoritative
//! `(current_term, last_accepted)` pair for a node. Every mutation happens
//! through an explicit operation here, called from the coordinator's
//! serialized loop, and every durable write completes before the method
//! returns the response that depends on it.

use conclave_core::election::{ElectionStrategy, Join};
use conclave_core::messages::{
    ApplyCommitRequest, PreVoteRequest, PreVoteResponse, PublishRequest, PublishResponse,
    VoteRequest, VoteResponse,
};
use conclave_core::store::CoordinationStore;
use conclave_core::{
    ClusterState, ConclaveError, Node, NodeId, Result, StateVersion, Term,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-node protocol state. Pure decision logic; scheduling, timers, and
/// message transport live in the coordinator.
pub struct CoordinationState {
    local: Node,
    strategy: Arc<dyn ElectionStrategy>,
    current_term: Term,
    last_accepted: ClusterState,
    /// Last state known committed; served to collaborators. In-memory only:
    /// after a restart it restarts from the accepted state's predecessor
    /// position and catches up on the next commit.
    last_committed: Option<ClusterState>,
    /// Votes granted to us in `current_term`, keyed by voter.
    join_votes: HashMap<NodeId, Join>,
    election_won: bool,
    /// The state we are currently publishing, if we are the leader.
    publish_state: Option<ClusterState>,
    publish_votes: HashSet<NodeId>,
}

impl CoordinationState {
    pub fn new(
        local: Node,
        strategy: Arc<dyn ElectionStrategy>,
        current_term: Term,
        last_accepted: ClusterState,
    ) -> Self {
        Self {
            local,
            strategy,
            current_term,
            last_accepted,
            last_committed: None,
            join_votes: HashMap::new(),
            election_won: false,
            publish_state: None,
            publish_votes: HashSet::new(),
        }
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn last_accepted(&self) -> &ClusterState {
        &self.last_accepted
    }

    pub fn last_committed(&self) -> Option<&ClusterState> {
        self.last_committed.as_ref()
    }

    pub fn election_won(&self) -> bool {
        self.election_won
    }

    pub fn in_flight_publication(&self) -> Option<&ClusterState> {
        self.publish_state.as_ref()
    }

    /// Our `(last_accepted_term, last_accepted_version)` position.
    pub fn position(&self) -> (Term, StateVersion) {
        (self.last_accepted.term, self.last_accepted.version)
    }

    /// The committed voting configuration quorum decisions are checked
    /// against. Comes from the accepted state so it survives restarts.
    pub fn committed_config(&self) -> &conclave_core::VotingConfiguration {
        &self.last_accepted.last_committed_config
    }

    /// Election quorum check over both the committed and the accepted
    /// voting configuration, so a vote set is binding under either view of
    /// the membership.
    pub fn is_election_quorum(&self, voters: &HashSet<NodeId>) -> bool {
        self.strategy
            .is_election_quorum(&self.last_accepted.last_committed_config, voters)
            && self
                .strategy
                .is_election_quorum(&self.last_accepted.voting_config, voters)
    }

    /// Publish quorum check over both configurations of the accepted state;
    /// used by the leader to decide whether it still has provable quorum
    /// support.
    pub fn is_publish_quorum(&self, acks: &HashSet<NodeId>) -> bool {
        self.strategy
            .is_publish_quorum(&self.last_accepted.last_committed_config, acks)
            && self
                .strategy
                .is_publish_quorum(&self.last_accepted.voting_config, acks)
    }

    fn reset_term_bookkeeping(&mut self) {
        self.join_votes.clear();
        self.election_won = false;
        self.publish_state = None;
        self.publish_votes.clear();
    }

    /// Adopt a higher term observed from a peer, durably. Clears any vote
    /// already granted to us and any in-flight publication bookkeeping.
    /// Returns true if the term advanced.
    pub async fn maybe_advance_term(
        &mut self,
        term: Term,
        store: &dyn CoordinationStore,
    ) -> Result<bool> {
        if term <= self.current_term {
            return Ok(false);
        }
        store.store_term(term).await?;
        debug!("advancing term {} -> {}", self.current_term, term);
        self.current_term = term;
        self.reset_term_bookkeeping();
        Ok(true)
    }

    /// Answer a pre-vote probe: a stateless read with no durable side
    /// effects.
    pub fn handle_pre_vote(&self, _request: &PreVoteRequest) -> PreVoteResponse {
        PreVoteResponse {
            current_term: self.current_term,
            last_accepted_term: self.last_accepted.term,
            last_accepted_version: self.last_accepted.version,
        }
    }

    /// Candidate-side judgement of a pre-vote response: the responder
    /// supports us iff it has seen no term beyond ours and our accepted
    /// state is at least as recent as its own, i.e. it would grant us a
    /// real vote.
    pub fn pre_vote_supports(&self, response: &PreVoteResponse) -> bool {
        response.current_term <= self.current_term
            && self.position() >= (response.last_accepted_term, response.last_accepted_version)
    }

    /// Begin a binding election: durably bump our term, vote for ourselves,
    /// and produce the request to broadcast.
    pub async fn start_election(&mut self, store: &dyn CoordinationStore) -> Result<VoteRequest> {
        let term = self.current_term.next();
        store.store_term(term).await?;
        self.current_term = term;
        self.reset_term_bookkeeping();

        let (last_accepted_term, last_accepted_version) = self.position();
        let self_join = Join {
            voter: self.local.id,
            term,
            last_accepted_term,
            last_accepted_version,
        };
        self.record_join(self_join);

        Ok(VoteRequest {
            term,
            last_accepted_term,
            last_accepted_version,
        })
    }

    /// Handle a binding vote request from `candidate`.
    ///
    /// A vote is granted only for a term strictly above ours, and only if
    /// the candidate's accepted position is at least as recent as ours
    /// (leader completeness). The durable term bump doubles as the vote
    /// record: one grant per term survives restarts because a restarted
    /// node only grants votes for terms above its persisted one.
    pub async fn handle_vote_request(
        &mut self,
        candidate: NodeId,
        request: &VoteRequest,
        store: &dyn CoordinationStore,
    ) -> Result<VoteResponse> {
        let (our_term, our_version) = self.position();

        if request.term <= self.current_term {
            trace!(
                "rejecting vote for {} at term {} (current term {})",
                candidate,
                request.term,
                self.current_term
            );
            return Ok(self.vote_rejection());
        }

        let candidate_position = (request.last_accepted_term, request.last_accepted_version);
        if candidate_position < (our_term, our_version) {
            // The candidate is missing accepted history we hold. Leave our
            // term untouched so a caught-up candidate can still win this
            // term from us; the rejection already carries our term.
            trace!(
                "rejecting vote for {}: position {:?} behind ours {:?}",
                candidate,
                candidate_position,
                (our_term, our_version)
            );
            return Ok(self.vote_rejection());
        }

        store.store_term(request.term).await?;
        self.current_term = request.term;
        self.reset_term_bookkeeping();

        debug!("granting vote to {} for term {}", candidate, request.term);
        Ok(VoteResponse {
            granted: true,
            current_term: self.current_term,
            last_accepted_term: our_term,
            last_accepted_version: our_version,
        })
    }

    fn vote_rejection(&self) -> VoteResponse {
        let (last_accepted_term, last_accepted_version) = self.position();
        VoteResponse {
            granted: false,
            current_term: self.current_term,
            last_accepted_term,
            last_accepted_version,
        }
    }

    /// Candidate-side vote accounting. Returns true once the recorded votes
    /// win the election: quorum under both the last committed and last
    /// accepted configurations, with no voter reporting an accepted
    /// position beyond ours.
    pub fn record_join(&mut self, join: Join) -> bool {
        if join.term != self.current_term {
            trace!(
                "ignoring join from {} for term {} (current term {})",
                join.voter,
                join.term,
                self.current_term
            );
            return self.election_won;
        }
        self.join_votes.insert(join.voter, join);

        let voters: HashSet<NodeId> = self.join_votes.keys().copied().collect();
        let complete = self
            .join_votes
            .values()
            .all(|j| (j.last_accepted_term, j.last_accepted_version) <= self.position());

        if self.is_election_quorum(&voters) && complete {
            self.election_won = true;
        }
        self.election_won
    }

    /// Leader-side: begin tracking acks for a state we are publishing.
    pub fn start_publication(&mut self, state: ClusterState) {
        self.publish_state = Some(state);
        self.publish_votes.clear();
    }

    /// Receiver-side phase 1: accept a published state, durably, and
    /// produce the ack. A state from a stale term yields `StaleTerm` so the
    /// caller can reply with a rejection carrying our term; a version
    /// regression within the current term is an internal error the caller
    /// logs and ignores.
    pub async fn accept_publish(
        &mut self,
        request: &PublishRequest,
        store: &dyn CoordinationStore,
    ) -> Result<PublishResponse> {
        let state = &request.state;

        if state.term < self.current_term {
            return Err(ConclaveError::StaleTerm {
                current: self.current_term,
            });
        }
        if state.term > self.current_term {
            store.store_term(state.term).await?;
            self.current_term = state.term;
            self.reset_term_bookkeeping();
        }

        let position = (state.term, state.version);
        if position == self.position() && *state == self.last_accepted {
            // Re-delivered publish of the state we already hold; ack again.
            return Ok(PublishResponse {
                term: state.term,
                version: state.version,
            });
        }
        if !state.is_later_than(self.last_accepted.term, self.last_accepted.version) {
            return Err(ConclaveError::internal(format!(
                "publish regression: got ({}, {}) but accepted ({}, {})",
                state.term, state.version, self.last_accepted.term, self.last_accepted.version
            )));
        }

        store.store_accepted_state(state).await?;
        self.last_accepted = state.clone();

        Ok(PublishResponse {
            term: state.term,
            version: state.version,
        })
    }

    /// Leader-side phase 1 accounting. Returns the commit marker once acks
    /// form a quorum of both the configuration the state was published
    /// under and the configuration it proposes (joint consensus for the
    /// transitional reconfiguration publication).
    pub fn record_publish_ack(
        &mut self,
        voter: NodeId,
        response: &PublishResponse,
    ) -> Option<ApplyCommitRequest> {
        let state = self.publish_state.as_ref()?;
        if (response.term, response.version) != (state.term, state.version) {
            trace!(
                "ignoring stale publish ack from {} for ({}, {})",
                voter,
                response.term,
                response.version
            );
            return None;
        }
        self.publish_votes.insert(voter);

        let committed_quorum = self
            .strategy
            .is_publish_quorum(&state.last_committed_config, &self.publish_votes);
        let proposed_quorum = self
            .strategy
            .is_publish_quorum(&state.voting_config, &self.publish_votes);

        if committed_quorum && proposed_quorum {
            Some(ApplyCommitRequest {
                term: state.term,
                version: state.version,
            })
        } else {
            None
        }
    }

    /// Phase 2: apply a commit marker. Returns the newly committed state,
    /// `None` when the same commit was already applied (idempotent), or
    /// `CommitMismatch` for a marker that does not match the accepted
    /// state.
    pub fn apply_commit(&mut self, request: &ApplyCommitRequest) -> Result<Option<ClusterState>> {
        if (request.term, request.version) != self.position() {
            return Err(ConclaveError::CommitMismatch {
                term: request.term,
                version: request.version,
            });
        }
        if let Some(committed) = &self.last_committed {
            if (committed.term, committed.version) == (request.term, request.version) {
                return Ok(None);
            }
        }
        self.last_committed = Some(self.last_accepted.clone());
        debug!(
            "committed cluster state ({}, {})",
            request.term, request.version
        );
        Ok(self.last_committed.clone())
    }

    /// Whether this node may start a binding election at all.
    pub fn may_lead(&self) -> bool {
        self.strategy.may_lead(&self.local)
    }
}
