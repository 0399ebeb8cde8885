//! The top-level coordination state machine.
//!
//! A [`Coordinator`] runs one serialized loop per node. Every election,
//! publish, and commit message, every command from collaborators, and every
//! timer signal is processed to completion on this loop before the next;
//! timers and the network layer only ever signal it through channels and
//! never touch term or state directly.

use crate::config::ConclaveConfig;
use crate::coordination::CoordinationState;
use crate::fault::{FollowerChecker, LeaderCheck, LeaderChecker};
use crate::publication::{Publication, PublishReply};
use crate::reconfigure::Reconfigurator;
use bytes::Bytes;
use conclave_core::election::{ElectionStrategy, Join};
use conclave_core::messages::{
    ApplyCommitAck, ApplyCommitRequest, FollowerHeartbeat, HeartbeatAck, LeaderHeartbeat,
    MessageKind, PreVoteRequest, PreVoteResponse, ProtocolMessage, PublishReject, PublishRequest,
    PublishResponse, VoteRequest, VoteResponse,
};
use conclave_core::store::CoordinationStore;
use conclave_core::transport::{ClusterConfig, InboundReceiver, Transport};
use conclave_core::{
    ClusterState, ConclaveError, Node, NodeId, Result, StateVersion, Term,
};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Coordinator role. There is no explicit uninitialized state: a node
/// starts as a candidate and stays one until it wins an election or hears
/// from a leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Candidate,
    Leader,
    Follower,
}

/// Commands collaborators send into the coordinator loop.
pub enum CoordinatorCommand {
    /// Propose a new metadata payload; resolved with the committed
    /// `(term, version)` or a typed failure.
    SubmitUpdate {
        payload: Bytes,
        reply: PublishReply,
    },
    /// Membership discovery reports a new node.
    NodeJoined(Node),
    /// Membership discovery reports a departed node.
    NodeLeft(NodeId),
    Shutdown,
}

struct Shared {
    mode: RwLock<Mode>,
    leader: RwLock<Option<NodeId>>,
    term: RwLock<Term>,
    committed: RwLock<ClusterState>,
}

/// Cloneable handle collaborators use to talk to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorCommand>,
    shared: Arc<Shared>,
}

impl CoordinatorHandle {
    /// Submit a cluster-state update. Suspends until the owning publication
    /// resolves: commit, failure, or loss of leadership.
    pub async fn submit_update(&self, payload: Bytes) -> Result<(Term, StateVersion)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::SubmitUpdate {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| ConclaveError::CoordinatorUnavailable)?;
        reply_rx
            .await
            .map_err(|_| ConclaveError::CoordinatorUnavailable)?
    }

    /// The last committed cluster state this node has applied.
    pub fn current_state(&self) -> ClusterState {
        self.shared.committed.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.shared.mode.read() == Mode::Leader
    }

    pub fn mode(&self) -> Mode {
        *self.shared.mode.read()
    }

    pub fn leader(&self) -> Option<NodeId> {
        *self.shared.leader.read()
    }

    pub fn current_term(&self) -> Term {
        *self.shared.term.read()
    }

    pub fn node_joined(&self, node: Node) {
        let _ = self.tx.send(CoordinatorCommand::NodeJoined(node));
    }

    pub fn node_left(&self, node_id: NodeId) {
        let _ = self.tx.send(CoordinatorCommand::NodeLeft(node_id));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(CoordinatorCommand::Shutdown);
    }
}

pub struct Coordinator<T, S>
where
    T: Transport + 'static,
    S: CoordinationStore + 'static,
{
    cluster: ClusterConfig,
    config: ConclaveConfig,
    kernel: CoordinationState,
    store: Arc<S>,
    transport: Arc<T>,
    command_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
    inbound_rx: InboundReceiver,
    shared: Arc<Shared>,

    mode: Mode,
    leader: Option<NodeId>,
    known_nodes: BTreeMap<NodeId, Node>,
    leader_checker: Option<LeaderChecker>,
    follower_checker: Option<FollowerChecker>,
    publication: Option<Publication>,
    pending_updates: VecDeque<(Bytes, PublishReply)>,
    pre_vote_support: Option<HashSet<NodeId>>,
    reconfigurator: Reconfigurator,
    election_attempts: u32,
    election_deadline: Option<Instant>,
    rng: StdRng,
    storage_failed: bool,
}

impl<T, S> Coordinator<T, S>
where
    T: Transport + 'static,
    S: CoordinationStore + 'static,
{
    /// Build a coordinator, recovering `(current_term, last_accepted)` from
    /// the store. `initial_state` seeds a node that has never accepted
    /// anything (cluster bootstrap).
    pub async fn new(
        cluster: ClusterConfig,
        config: ConclaveConfig,
        strategy: Arc<dyn ElectionStrategy>,
        store: S,
        transport: T,
        inbound_rx: InboundReceiver,
        initial_state: ClusterState,
    ) -> Result<(Self, CoordinatorHandle)> {
        let persisted = store.load().await?;
        let (current_term, last_accepted) = match persisted {
            Some(record) => (
                record.current_term,
                record.last_accepted.unwrap_or_else(|| initial_state.clone()),
            ),
            None => (Term::ZERO, initial_state),
        };
        info!(
            "starting coordinator on {} at term {} with accepted state ({}, {})",
            cluster.local_id(),
            current_term,
            last_accepted.term,
            last_accepted.version
        );

        let mut known_nodes = cluster.nodes.clone();
        for (id, node) in &last_accepted.nodes {
            known_nodes.entry(*id).or_insert_with(|| node.clone());
        }

        let shared = Arc::new(Shared {
            mode: RwLock::new(Mode::Candidate),
            leader: RwLock::new(None),
            term: RwLock::new(current_term),
            committed: RwLock::new(last_accepted.clone()),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = CoordinatorHandle {
            tx: command_tx,
            shared: Arc::clone(&shared),
        };

        let rng = match config.randomization_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let kernel = CoordinationState::new(
            cluster.local.clone(),
            strategy,
            current_term,
            last_accepted,
        );

        let coordinator = Self {
            cluster,
            config,
            kernel,
            store: Arc::new(store),
            transport: Arc::new(transport),
            command_rx,
            inbound_rx,
            shared,
            mode: Mode::Candidate,
            leader: None,
            known_nodes,
            leader_checker: None,
            follower_checker: None,
            publication: None,
            pending_updates: VecDeque::new(),
            pre_vote_support: None,
            reconfigurator: Reconfigurator::default(),
            election_attempts: 0,
            election_deadline: None,
            rng,
            storage_failed: false,
        };
        Ok((coordinator, handle))
    }

    fn node_id(&self) -> NodeId {
        self.cluster.local_id()
    }

    /// Run the serialized coordination loop until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.schedule_election();

        loop {
            let election_deadline = self
                .election_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(CoordinatorCommand::SubmitUpdate { payload, reply }) => {
                            self.handle_submit(payload, reply).await;
                        }
                        Some(CoordinatorCommand::NodeJoined(node)) => {
                            debug!("node {} joined", node.id);
                            self.known_nodes.insert(node.id, node);
                        }
                        Some(CoordinatorCommand::NodeLeft(node_id)) => {
                            debug!("node {} left", node_id);
                            self.known_nodes.remove(&node_id);
                        }
                        Some(CoordinatorCommand::Shutdown) | None => break,
                    }
                }

                inbound = self.inbound_rx.recv() => {
                    match inbound {
                        Some((from, message)) => {
                            if let Err(e) = self.handle_message(from, message).await {
                                self.note_store_failure(&e);
                                warn!("error handling message from {}: {}", from, e);
                            }
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    self.on_heartbeat_tick().await;
                }

                _ = sleep_until(election_deadline) => {
                    self.on_election_timeout().await;
                }
            }
        }

        info!("coordinator on {} stopped", self.node_id());
        if let Some(mut publication) = self.publication.take() {
            publication.resolve(Err(ConclaveError::CoordinatorUnavailable));
        }
        for (_, reply) in self.pending_updates.drain(..) {
            let _ = reply.send(Err(ConclaveError::CoordinatorUnavailable));
        }
        Ok(())
    }

    fn update_shared(&self) {
        *self.shared.mode.write() = self.mode;
        *self.shared.leader.write() = self.leader;
        *self.shared.term.write() = self.kernel.current_term();
    }

    fn note_store_failure(&mut self, error: &ConclaveError) {
        if matches!(
            error,
            ConclaveError::Durability { .. } | ConclaveError::Io(_)
        ) {
            // a node that cannot persist must not vote, ack, or lead until
            // storage recovers
            error!("persistent store failed, suspending protocol participation: {}", error);
            self.storage_failed = true;
        }
    }

    async fn send(&self, to: NodeId, message: ProtocolMessage) {
        if let Err(e) = self.transport.send_to(to, message).await {
            // treated like a missing response; the relevant timeout covers it
            trace!("send to {} failed: {}", to, e);
        }
    }

    fn peers(&self) -> Vec<NodeId> {
        self.known_nodes
            .keys()
            .copied()
            .filter(|id| *id != self.node_id())
            .collect()
    }

    fn master_eligible_nodes(&self) -> Vec<Node> {
        self.known_nodes
            .values()
            .filter(|n| n.master_eligible)
            .cloned()
            .collect()
    }

    // ---- elections ----------------------------------------------------

    fn schedule_election(&mut self) {
        let backoff = self
            .config
            .election_backoff
            .saturating_mul(self.election_attempts);
        let base = (self.config.election_initial_timeout + backoff)
            .min(self.config.election_max_timeout);
        let jitter = self
            .rng
            .gen_range(Duration::ZERO..=self.config.election_initial_timeout);
        self.election_deadline = Some(Instant::now() + base + jitter);
        self.election_attempts = self.election_attempts.saturating_add(1);
    }

    async fn on_election_timeout(&mut self) {
        if self.mode != Mode::Candidate {
            self.election_deadline = None;
            return;
        }
        if self.storage_failed {
            self.schedule_election();
            return;
        }

        // pre-vote: a stateless probe round that suppresses disruptive term
        // inflation from partitioned nodes
        trace!("starting pre-vote round at term {}", self.kernel.current_term());
        let mut support = HashSet::new();
        support.insert(self.node_id());

        if self.kernel.is_election_quorum(&support) {
            // single-node configuration; skip straight to the binding round
            self.pre_vote_support = None;
            if let Err(e) = self.start_binding_election().await {
                self.note_store_failure(&e);
                warn!("election attempt failed: {}", e);
            }
        } else {
            self.pre_vote_support = Some(support);
            let request = PreVoteRequest {
                term: self.kernel.current_term(),
            };
            for peer in self.peers() {
                self.send(
                    peer,
                    ProtocolMessage::pre_vote_request(self.node_id(), peer, request),
                )
                .await;
            }
        }
        if self.mode == Mode::Candidate {
            self.schedule_election();
        }
    }

    async fn start_binding_election(&mut self) -> Result<()> {
        if !self.kernel.may_lead() {
            // voting-only nodes run the pre-vote and follower logic but
            // never a binding candidacy
            debug!("{} is not electable, staying candidate", self.node_id());
            return Ok(());
        }

        let request = self.kernel.start_election(self.store.as_ref()).await?;
        info!(
            "starting election for term {} on {}",
            request.term,
            self.node_id()
        );
        self.update_shared();

        if self.kernel.election_won() {
            self.become_leader().await?;
            return Ok(());
        }
        for peer in self.peers() {
            self.send(
                peer,
                ProtocolMessage::vote_request(self.node_id(), peer, request),
            )
            .await;
        }
        Ok(())
    }

    async fn become_leader(&mut self) -> Result<()> {
        info!(
            "{} elected leader for term {}",
            self.node_id(),
            self.kernel.current_term()
        );
        self.mode = Mode::Leader;
        self.leader = Some(self.node_id());
        self.leader_checker = None;
        self.pre_vote_support = None;
        self.election_deadline = None;
        self.election_attempts = 0;

        let mut checker = FollowerChecker::new(self.config.follower_check_retry_count);
        checker.set_peers(self.follower_check_targets());
        self.follower_checker = Some(checker);
        self.update_shared();

        // reconcile: republish the highest accepted state at the new term so
        // every node converges on it before new client values are accepted
        let base = self.kernel.last_accepted().clone();
        let reconciling = ClusterState {
            term: self.kernel.current_term(),
            version: base.version.next(),
            voting_config: base.voting_config.clone(),
            // keep the joint window open if the base carried an uncommitted
            // reconfiguration
            last_committed_config: base.last_committed_config.clone(),
            nodes: self.known_nodes.clone(),
            payload: base.payload.clone(),
        };
        self.start_publication(reconciling, None).await
    }

    fn follower_check_targets(&self) -> Vec<NodeId> {
        let mut targets: HashSet<NodeId> =
            self.kernel.last_accepted().publish_targets().into_iter().collect();
        targets.extend(self.known_nodes.keys().copied());
        targets.remove(&self.node_id());
        targets.into_iter().collect()
    }

    // ---- publications -------------------------------------------------

    async fn handle_submit(&mut self, payload: Bytes, reply: PublishReply) {
        if self.mode != Mode::Leader {
            let _ = reply.send(Err(ConclaveError::not_leader(self.leader)));
            return;
        }
        if self.in_flight() {
            // serialized: the next publication starts when this one resolves
            self.pending_updates.push_back((payload, reply));
            return;
        }
        let state = self.next_state(payload);
        if let Err(e) = self.start_publication(state, Some(reply)).await {
            self.note_store_failure(&e);
            warn!("failed to start publication: {}", e);
        }
    }

    fn in_flight(&self) -> bool {
        self.publication
            .as_ref()
            .map(|p| !p.is_committed())
            .unwrap_or(false)
    }

    fn next_state(&self, payload: Bytes) -> ClusterState {
        let base = self.kernel.last_accepted();
        let mut state = base.successor(self.kernel.current_term(), payload);
        state.nodes = self.known_nodes.clone();
        state
    }

    async fn start_publication(
        &mut self,
        state: ClusterState,
        reply: Option<PublishReply>,
    ) -> Result<()> {
        debug!(
            "publishing cluster state ({}, {}) from {}",
            state.term,
            state.version,
            self.node_id()
        );
        self.kernel.start_publication(state.clone());

        // accept our own state durably before asking anyone else to
        let request = PublishRequest {
            state: state.clone(),
        };
        let self_ack = match self.kernel.accept_publish(&request, self.store.as_ref()).await {
            Ok(ack) => ack,
            Err(e) => {
                // the client gets the real failure, not a dropped channel
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ConclaveError::durability(format!(
                        "could not persist own publication: {}",
                        e
                    ))));
                }
                return Err(e);
            }
        };

        let targets: Vec<NodeId> = self.peers();
        self.publication = Some(Publication::new(state, targets.clone(), reply));

        let commit = self.kernel.record_publish_ack(self.node_id(), &self_ack);

        for target in targets {
            self.send(
                target,
                ProtocolMessage::publish_request(self.node_id(), target, request.clone()),
            )
            .await;
        }

        if let Some(commit) = commit {
            // single-node voting configuration commits immediately
            self.on_commit_decision(commit).await;
        }
        Ok(())
    }

    async fn on_commit_decision(&mut self, commit: ApplyCommitRequest) {
        if let Some(publication) = &mut self.publication {
            publication.set_committed();
        }
        match self.kernel.apply_commit(&commit) {
            Ok(Some(state)) => self.apply_committed(state),
            Ok(None) => {}
            Err(e) => warn!("leader failed to apply own commit: {}", e),
        }
        if let Some(publication) = &mut self.publication {
            publication.resolve(Ok((commit.term, commit.version)));
        }
        for peer in self.peers() {
            self.send(
                peer,
                ProtocolMessage::apply_commit(self.node_id(), peer, commit),
            )
            .await;
        }
        // follow-up work (pending client updates, reconfiguration) happens
        // on the next heartbeat tick
    }

    fn apply_committed(&mut self, state: ClusterState) {
        for (id, node) in &state.nodes {
            self.known_nodes.entry(*id).or_insert_with(|| node.clone());
        }
        let targets = self.follower_check_targets();
        if let Some(checker) = &mut self.follower_checker {
            checker.set_peers(targets);
        }
        *self.shared.committed.write() = state;
    }

    fn fail_publication(&mut self, error: ConclaveError) {
        if let Some(mut publication) = self.publication.take() {
            publication.resolve(Err(error));
        }
    }

    fn step_down(&mut self, reason: &str, error: ConclaveError) {
        info!("{} stepping down: {}", self.node_id(), reason);
        self.fail_publication(error);
        for (_, reply) in self.pending_updates.drain(..) {
            let _ = reply.send(Err(ConclaveError::not_leader(None)));
        }
        self.follower_checker = None;
        self.leader_checker = None;
        self.mode = Mode::Candidate;
        self.leader = None;
        self.election_attempts = 0;
        self.schedule_election();
        self.update_shared();
    }

    fn become_follower(&mut self, leader: NodeId) {
        if self.mode == Mode::Leader {
            self.fail_publication(ConclaveError::Superseded {
                term: self.kernel.current_term(),
            });
            for (_, reply) in self.pending_updates.drain(..) {
                let _ = reply.send(Err(ConclaveError::not_leader(Some(leader))));
            }
            self.follower_checker = None;
        }
        if self.mode != Mode::Follower || self.leader != Some(leader) {
            info!("{} following leader {}", self.node_id(), leader);
            self.leader_checker = Some(LeaderChecker::new(
                leader,
                self.config.leader_check_retry_count,
            ));
        }
        self.mode = Mode::Follower;
        self.leader = Some(leader);
        self.pre_vote_support = None;
        self.election_deadline = None;
        self.election_attempts = 0;
        self.update_shared();
    }

    // ---- timers -------------------------------------------------------

    async fn on_heartbeat_tick(&mut self) {
        if self.storage_failed {
            // probe the store; participation resumes once a write succeeds
            match self.store.store_term(self.kernel.current_term()).await {
                Ok(()) => {
                    info!("persistent store recovered on {}", self.node_id());
                    self.storage_failed = false;
                }
                Err(e) => {
                    trace!("persistent store still failing: {}", e);
                    return;
                }
            }
        }

        match self.mode {
            Mode::Leader => self.on_leader_tick().await,
            Mode::Follower => self.on_follower_tick().await,
            Mode::Candidate => {}
        }
    }

    async fn on_leader_tick(&mut self) {
        let term = self.kernel.current_term();
        let (probes, newly_faulty) = match &mut self.follower_checker {
            Some(checker) => checker.on_tick(),
            None => return,
        };
        for node in &newly_faulty {
            warn!("follower {} is unreachable past its retry budget", node);
        }
        for peer in probes {
            self.send(
                peer,
                ProtocolMessage::follower_heartbeat(
                    self.node_id(),
                    peer,
                    FollowerHeartbeat { term },
                ),
            )
            .await;
        }

        // a leader that cannot prove quorum support must not stay leader
        let (healthy, faulty) = match &self.follower_checker {
            Some(checker) => (checker.healthy_peers(), checker.faulty_peers()),
            None => return,
        };
        let mut reachable = healthy.clone();
        reachable.insert(self.node_id());
        if !self.kernel.is_publish_quorum(&reachable) {
            self.step_down(
                "lost quorum connectivity",
                ConclaveError::QuorumTimeout {
                    operation: "leader connectivity check".into(),
                },
            );
            return;
        }

        // publication deadline
        if let Some(publication) = &self.publication {
            if publication.is_expired(self.config.publish_timeout) {
                let (term, version) = (publication.term(), publication.version());
                warn!(
                    "publication ({}, {}) missed its commit deadline",
                    term, version
                );
                self.step_down(
                    "publication timed out before quorum",
                    ConclaveError::QuorumTimeout {
                        operation: format!("publish ({}, {})", term, version),
                    },
                );
                return;
            }
        }

        if self.in_flight() {
            return;
        }

        // dequeue the next client update
        if let Some((payload, reply)) = self.pending_updates.pop_front() {
            let state = self.next_state(payload);
            if let Err(e) = self.start_publication(state, Some(reply)).await {
                self.note_store_failure(&e);
                warn!("failed to start queued publication: {}", e);
            }
            return;
        }

        // auto-reconfiguration: retire members past their retry budget
        let committed_config = self.kernel.last_accepted().voting_config.clone();
        let mut live = healthy;
        live.insert(self.node_id());
        let candidates = self.master_eligible_nodes();
        match self.reconfigurator.reconfigure(
            &committed_config,
            &live,
            &faulty,
            self.node_id(),
            candidates.iter(),
        ) {
            Ok(proposed) if proposed != committed_config => {
                let term = self.kernel.current_term();
                let state = {
                    let base = self.kernel.last_accepted();
                    let mut state = base.reconfigured(term, proposed);
                    state.nodes = self.known_nodes.clone();
                    state
                };
                if let Err(e) = self.start_publication(state, None).await {
                    self.note_store_failure(&e);
                    warn!("failed to publish reconfiguration: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => trace!("no safe reconfiguration available: {}", e),
        }
    }

    async fn on_follower_tick(&mut self) {
        let term = self.kernel.current_term();
        let Some(checker) = &mut self.leader_checker else {
            return;
        };
        match checker.on_tick() {
            LeaderCheck::Probe => {
                let leader = checker.leader();
                self.send(
                    leader,
                    ProtocolMessage::leader_heartbeat(
                        self.node_id(),
                        leader,
                        LeaderHeartbeat { term },
                    ),
                )
                .await;
            }
            LeaderCheck::LeaderFailed => {
                warn!("leader {} is unreachable, starting election", checker.leader());
                self.leader_checker = None;
                self.leader = None;
                self.mode = Mode::Candidate;
                self.election_attempts = 0;
                self.schedule_election();
                self.update_shared();
            }
        }
    }

    // ---- message handling ---------------------------------------------

    async fn handle_message(&mut self, from: NodeId, message: ProtocolMessage) -> Result<()> {
        if message.from != from {
            warn!(
                "message claims to be from {} but was received from {}",
                message.from, from
            );
            return Err(ConclaveError::network("message source mismatch"));
        }

        match message.kind {
            MessageKind::PreVoteRequest(request) => {
                let response = self.kernel.handle_pre_vote(&request);
                self.send(
                    from,
                    ProtocolMessage::pre_vote_response(self.node_id(), from, response),
                )
                .await;
                Ok(())
            }
            MessageKind::PreVoteResponse(response) => {
                self.on_pre_vote_response(from, response).await
            }
            MessageKind::VoteRequest(request) => self.on_vote_request(from, request).await,
            MessageKind::VoteResponse(response) => self.on_vote_response(from, response).await,
            MessageKind::PublishRequest(request) => self.on_publish_request(from, request).await,
            MessageKind::PublishResponse(response) => {
                self.on_publish_response(from, response).await
            }
            MessageKind::PublishReject(reject) => self.on_publish_reject(from, reject).await,
            MessageKind::ApplyCommitRequest(request) => self.on_apply_commit(from, request).await,
            MessageKind::ApplyCommitAck(ack) => {
                if let Some(publication) = &mut self.publication {
                    if (ack.term, ack.version) == (publication.term(), publication.version()) {
                        publication.on_commit_ack(from);
                    }
                }
                Ok(())
            }
            MessageKind::LeaderHeartbeat(heartbeat) => {
                self.on_leader_heartbeat(from, heartbeat).await
            }
            MessageKind::FollowerHeartbeat(heartbeat) => {
                self.on_follower_heartbeat(from, heartbeat).await
            }
            MessageKind::HeartbeatAck(ack) => self.on_heartbeat_ack(from, ack).await,
        }
    }

    async fn on_pre_vote_response(&mut self, from: NodeId, response: PreVoteResponse) -> Result<()> {
        if self.mode != Mode::Candidate {
            return Ok(());
        }
        let Some(support) = &mut self.pre_vote_support else {
            return Ok(());
        };
        if response.current_term > self.kernel.current_term() {
            // someone is ahead of us; this round cannot win, wait to learn
            // the higher term through a binding message
            trace!("abandoning pre-vote round, {} is at term {}", from, response.current_term);
            self.pre_vote_support = None;
            return Ok(());
        }
        if self.kernel.pre_vote_supports(&response) {
            support.insert(from);
        }
        let support = support.clone();
        if self.kernel.is_election_quorum(&support) {
            self.pre_vote_support = None;
            self.start_binding_election().await?;
        }
        Ok(())
    }

    async fn on_vote_request(&mut self, from: NodeId, request: VoteRequest) -> Result<()> {
        if self.storage_failed {
            debug!("ignoring vote request while storage is failed");
            return Ok(());
        }
        let previous_term = self.kernel.current_term();
        let response = self
            .kernel
            .handle_vote_request(from, &request, self.store.as_ref())
            .await?;
        if self.kernel.current_term() > previous_term {
            // our vote (or the mere observation of the higher term) ends any
            // current leadership or candidacy at the old term
            if self.mode == Mode::Leader {
                self.step_down(
                    "observed vote request at higher term",
                    ConclaveError::Superseded {
                        term: self.kernel.current_term(),
                    },
                );
            } else {
                self.mode = Mode::Candidate;
                self.leader = None;
                self.leader_checker = None;
                self.election_attempts = 0;
                self.schedule_election();
                self.update_shared();
            }
        }
        self.send(
            from,
            ProtocolMessage::vote_response(self.node_id(), from, response),
        )
        .await;
        Ok(())
    }

    async fn on_vote_response(&mut self, from: NodeId, response: VoteResponse) -> Result<()> {
        if !response.granted {
            if self.storage_failed {
                return Ok(());
            }
            if self
                .kernel
                .maybe_advance_term(response.current_term, self.store.as_ref())
                .await?
            {
                // a rejection carrying a higher term ends any leadership or
                // candidacy at the old one, same as a heartbeat ack would
                match self.mode {
                    Mode::Leader => self.step_down(
                        "vote rejected at higher term",
                        ConclaveError::Superseded {
                            term: response.current_term,
                        },
                    ),
                    _ => {
                        self.mode = Mode::Candidate;
                        self.leader = None;
                        self.leader_checker = None;
                        self.schedule_election();
                        self.update_shared();
                    }
                }
            }
            return Ok(());
        }
        if self.mode == Mode::Leader || response.current_term != self.kernel.current_term() {
            return Ok(());
        }
        let join = Join {
            voter: from,
            term: response.current_term,
            last_accepted_term: response.last_accepted_term,
            last_accepted_version: response.last_accepted_version,
        };
        if self.kernel.record_join(join) {
            self.become_leader().await?;
        }
        Ok(())
    }

    async fn on_publish_request(&mut self, from: NodeId, request: PublishRequest) -> Result<()> {
        if self.storage_failed {
            debug!("ignoring publish request while storage is failed");
            return Ok(());
        }
        match self
            .kernel
            .accept_publish(&request, self.store.as_ref())
            .await
        {
            Ok(response) => {
                self.become_follower(from);
                if let Some(checker) = &mut self.leader_checker {
                    checker.on_contact();
                }
                self.send(
                    from,
                    ProtocolMessage::publish_response(self.node_id(), from, response),
                )
                .await;
                Ok(())
            }
            Err(ConclaveError::StaleTerm { current }) => {
                self.send(
                    from,
                    ProtocolMessage::publish_reject(
                        self.node_id(),
                        from,
                        PublishReject {
                            current_term: current,
                        },
                    ),
                )
                .await;
                Ok(())
            }
            Err(e @ (ConclaveError::Durability { .. } | ConclaveError::Io(_))) => Err(e),
            Err(e) => {
                // term/version regression: logged and ignored, never applied
                warn!("ignoring publish request from {}: {}", from, e);
                Ok(())
            }
        }
    }

    async fn on_publish_response(&mut self, from: NodeId, response: PublishResponse) -> Result<()> {
        if self.mode != Mode::Leader {
            return Ok(());
        }
        let matches_current = self
            .publication
            .as_ref()
            .map(|p| (p.term(), p.version()) == (response.term, response.version))
            .unwrap_or(false);
        if !matches_current {
            return Ok(());
        }
        let committed = self
            .publication
            .as_ref()
            .map(|p| p.is_committed())
            .unwrap_or(false);
        if let Some(publication) = &mut self.publication {
            publication.on_ack(from);
        }
        if committed {
            // slow follower acked after the decision: reconcile it directly
            let commit = ApplyCommitRequest {
                term: response.term,
                version: response.version,
            };
            self.send(
                from,
                ProtocolMessage::apply_commit(self.node_id(), from, commit),
            )
            .await;
            return Ok(());
        }
        if let Some(commit) = self.kernel.record_publish_ack(from, &response) {
            self.on_commit_decision(commit).await;
        }
        Ok(())
    }

    async fn on_publish_reject(&mut self, from: NodeId, reject: PublishReject) -> Result<()> {
        if let Some(publication) = &mut self.publication {
            publication.on_reject(from);
        }
        if self
            .kernel
            .maybe_advance_term(reject.current_term, self.store.as_ref())
            .await?
        {
            debug!("publish rejected by {} at higher term {}", from, reject.current_term);
            self.step_down(
                "publish rejected at higher term",
                ConclaveError::Superseded {
                    term: reject.current_term,
                },
            );
        }
        Ok(())
    }

    async fn on_apply_commit(&mut self, from: NodeId, request: ApplyCommitRequest) -> Result<()> {
        match self.kernel.apply_commit(&request) {
            Ok(Some(state)) => {
                self.apply_committed(state);
                if let Some(checker) = &mut self.leader_checker {
                    checker.on_contact();
                }
                self.send(
                    from,
                    ProtocolMessage::apply_commit_ack(
                        self.node_id(),
                        from,
                        ApplyCommitAck {
                            term: request.term,
                            version: request.version,
                        },
                    ),
                )
                .await;
            }
            Ok(None) => {
                // idempotent re-delivery
                self.send(
                    from,
                    ProtocolMessage::apply_commit_ack(
                        self.node_id(),
                        from,
                        ApplyCommitAck {
                            term: request.term,
                            version: request.version,
                        },
                    ),
                )
                .await;
            }
            Err(e) => {
                debug!("ignoring commit from {}: {}", from, e);
            }
        }
        Ok(())
    }

    async fn on_leader_heartbeat(&mut self, from: NodeId, heartbeat: LeaderHeartbeat) -> Result<()> {
        // a follower probing us; answer with our term either way so a stale
        // follower learns about a newer term quickly
        if self.mode == Mode::Leader && heartbeat.term == self.kernel.current_term() {
            if let Some(checker) = &mut self.follower_checker {
                checker.on_ack(from);
            }
        }
        self.send(
            from,
            ProtocolMessage::heartbeat_ack(
                self.node_id(),
                from,
                HeartbeatAck {
                    current_term: self.kernel.current_term(),
                },
            ),
        )
        .await;
        Ok(())
    }

    async fn on_follower_heartbeat(
        &mut self,
        from: NodeId,
        heartbeat: FollowerHeartbeat,
    ) -> Result<()> {
        if heartbeat.term < self.kernel.current_term() {
            // stale leader; the ack carries our higher term
            self.send(
                from,
                ProtocolMessage::heartbeat_ack(
                    self.node_id(),
                    from,
                    HeartbeatAck {
                        current_term: self.kernel.current_term(),
                    },
                ),
            )
            .await;
            return Ok(());
        }
        if heartbeat.term > self.kernel.current_term() {
            if self.storage_failed {
                return Ok(());
            }
            self.kernel
                .maybe_advance_term(heartbeat.term, self.store.as_ref())
                .await?;
        }
        self.become_follower(from);
        if let Some(checker) = &mut self.leader_checker {
            checker.on_contact();
        }
        self.send(
            from,
            ProtocolMessage::heartbeat_ack(
                self.node_id(),
                from,
                HeartbeatAck {
                    current_term: self.kernel.current_term(),
                },
            ),
        )
        .await;
        Ok(())
    }

    async fn on_heartbeat_ack(&mut self, from: NodeId, ack: HeartbeatAck) -> Result<()> {
        if ack.current_term > self.kernel.current_term() {
            if self.storage_failed {
                return Ok(());
            }
            self.kernel
                .maybe_advance_term(ack.current_term, self.store.as_ref())
                .await?;
            match self.mode {
                Mode::Leader => self.step_down(
                    "observed higher term in heartbeat ack",
                    ConclaveError::Superseded {
                        term: ack.current_term,
                    },
                ),
                _ => {
                    self.mode = Mode::Candidate;
                    self.leader = None;
                    self.leader_checker = None;
                    self.schedule_election();
                    self.update_shared();
                }
            }
            return Ok(());
        }
        match self.mode {
            Mode::Leader => {
                if let Some(checker) = &mut self.follower_checker {
                    checker.on_ack(from);
                }
            }
            Mode::Follower => {
                if self.leader == Some(from) {
                    if let Some(checker) = &mut self.leader_checker {
                        checker.on_contact();
                    }
                }
            }
            Mode::Candidate => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::election::MajorityStrategy;
    use conclave_core::transport::inbound_channel;
    use conclave_core::{Node, VotingConfiguration};
    use conclave_persistence::InMemoryStore;

    struct NullTransport;

    #[async_trait::async_trait]
    impl Transport for NullTransport {
        async fn send_to(&self, _target: NodeId, _message: ProtocolMessage) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_elects_itself_and_commits() {
        let local = Node::new(NodeId::from(1), "10.0.0.1");
        let cluster = ClusterConfig::new(local.clone(), []);
        let initial =
            ClusterState::initial(VotingConfiguration::of([local.id]), [local.clone()]);
        let (_inbound_tx, inbound_rx) = inbound_channel();
        let config = ConclaveConfig::default().with_randomization_seed(42);

        let (coordinator, handle) = Coordinator::new(
            cluster,
            config,
            Arc::new(MajorityStrategy),
            InMemoryStore::new(),
            NullTransport,
            inbound_rx,
            initial,
        )
        .await
        .unwrap();
        let task = tokio::spawn(coordinator.run());

        while !handle.is_leader() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(handle.leader(), Some(NodeId::from(1)));

        let (term, version) = handle
            .submit_update(Bytes::from_static(b"settings"))
            .await
            .unwrap();
        assert_eq!(term, handle.current_term());
        assert!(version > StateVersion::ZERO);
        assert_eq!(
            handle.current_state().payload,
            Bytes::from_static(b"settings")
        );

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_on_non_leader_fails_fast() {
        let local = Node::new(NodeId::from(1), "10.0.0.1");
        let peer = Node::new(NodeId::from(2), "10.0.0.2");
        let cluster = ClusterConfig::new(local.clone(), [peer.clone()]);
        let initial = ClusterState::initial(
            VotingConfiguration::of([local.id, peer.id]),
            [local.clone(), peer],
        );
        let (_inbound_tx, inbound_rx) = inbound_channel();

        let (coordinator, handle) = Coordinator::new(
            cluster,
            ConclaveConfig::default().with_randomization_seed(7),
            Arc::new(MajorityStrategy),
            InMemoryStore::new(),
            NullTransport,
            inbound_rx,
            initial,
        )
        .await
        .unwrap();
        let task = tokio::spawn(coordinator.run());

        // no second node ever answers, so this node stays a candidate
        let err = handle
            .submit_update(Bytes::from_static(b"settings"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::NotLeader { .. }));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_steps_down_on_higher_term_vote_rejection() {
        let local = Node::new(NodeId::from(1), "10.0.0.1");
        let cluster = ClusterConfig::new(local.clone(), []);
        let initial =
            ClusterState::initial(VotingConfiguration::of([local.id]), [local.clone()]);
        let (inbound_tx, inbound_rx) = inbound_channel();

        let (coordinator, handle) = Coordinator::new(
            cluster,
            ConclaveConfig::default().with_randomization_seed(3),
            Arc::new(MajorityStrategy),
            InMemoryStore::new(),
            NullTransport,
            inbound_rx,
            initial,
        )
        .await
        .unwrap();
        let task = tokio::spawn(coordinator.run());

        while !handle.is_leader() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(handle.current_term(), Term(1));

        // a stale rejection carrying a higher term must end this leadership
        let stranger = NodeId::from(2);
        inbound_tx
            .send((
                stranger,
                ProtocolMessage::vote_response(
                    stranger,
                    NodeId::from(1),
                    VoteResponse {
                        granted: false,
                        current_term: Term(9),
                        last_accepted_term: Term::ZERO,
                        last_accepted_version: StateVersion::ZERO,
                    },
                ),
            ))
            .unwrap();

        // the node re-elects itself at a fresh term; it may never sit as
        // leader at term 9, which it did not win
        while !(handle.is_leader() && handle.current_term() >= Term(10)) {
            assert!(
                !(handle.is_leader() && handle.current_term() == Term(9)),
                "node must not lead at a term it did not win"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_suspends_votes_until_recovery() {
        let local = Node::new(NodeId::from(1), "10.0.0.1");
        let peer = Node::new(NodeId::from(2), "10.0.0.2");
        let cluster = ClusterConfig::new(local.clone(), [peer.clone()]);
        let initial = ClusterState::initial(
            VotingConfiguration::of([local.id, peer.id]),
            [local.clone(), peer.clone()],
        );
        let (inbound_tx, inbound_rx) = inbound_channel();
        let store = InMemoryStore::new();

        let (coordinator, handle) = Coordinator::new(
            cluster,
            ConclaveConfig::default().with_randomization_seed(11),
            Arc::new(MajorityStrategy),
            store.clone(),
            NullTransport,
            inbound_rx,
            initial,
        )
        .await
        .unwrap();
        let task = tokio::spawn(coordinator.run());

        let vote_request = |term: u64| {
            (
                NodeId::from(2),
                ProtocolMessage::vote_request(
                    NodeId::from(2),
                    NodeId::from(1),
                    VoteRequest {
                        term: Term(term),
                        last_accepted_term: Term::ZERO,
                        last_accepted_version: StateVersion::ZERO,
                    },
                ),
            )
        };

        // the durable term bump fails, so no vote is granted and the node
        // suspends itself
        store.set_fail_writes(true);
        inbound_tx.send(vote_request(5)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.current_term(), Term::ZERO);

        // while suspended, even a valid request is ignored outright
        inbound_tx.send(vote_request(6)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.current_term(), Term::ZERO);

        // the heartbeat tick notices the store is writable again and the
        // node resumes granting votes
        store.set_fail_writes(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        inbound_tx.send(vote_request(7)).unwrap();
        tokio::time::timeout(Duration::from_secs(30), async {
            while handle.current_term() != Term(7) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("vote was never granted after storage recovered");

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_surfaces_durability_error_and_recovers() {
        let local = Node::new(NodeId::from(1), "10.0.0.1");
        let cluster = ClusterConfig::new(local.clone(), []);
        let initial =
            ClusterState::initial(VotingConfiguration::of([local.id]), [local.clone()]);
        let (_inbound_tx, inbound_rx) = inbound_channel();
        let store = InMemoryStore::new();

        let (coordinator, handle) = Coordinator::new(
            cluster,
            ConclaveConfig::default().with_randomization_seed(5),
            Arc::new(MajorityStrategy),
            store.clone(),
            NullTransport,
            inbound_rx,
            initial,
        )
        .await
        .unwrap();
        let task = tokio::spawn(coordinator.run());

        while !handle.is_leader() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle
            .submit_update(Bytes::from_static(b"first"))
            .await
            .unwrap();

        // the client sees the actual storage failure, not a dropped channel
        store.set_fail_writes(true);
        let err = handle
            .submit_update(Bytes::from_static(b"second"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ConclaveError::Durability { .. }),
            "expected a durability error, got: {err}"
        );

        // once the store recovers, publications flow again
        store.set_fail_writes(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let payload = Bytes::from_static(b"third");
        handle.submit_update(payload.clone()).await.unwrap();
        assert_eq!(handle.current_state().payload, payload);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
