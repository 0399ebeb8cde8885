//! One-shot, per-cluster-state two-phase commit bookkeeping.
//!
//! A [`Publication`] exists only on the leader, one instance per proposed
//! state, and only for the lifetime of that proposal. Quorum decisions are
//! made by the kernel ([`crate::coordination::CoordinationState`]); this
//! type tracks per-target progress, the publication deadline, and the
//! pending client reply.

use conclave_core::{ClusterState, NodeId, Result, StateVersion, Term};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

/// Progress of a single publication target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationTargetState {
    /// Publish request sent, ack outstanding.
    Sent,
    /// Publish ack received, commit not yet sent or not yet acknowledged.
    WaitingCommit,
    /// Commit acknowledged.
    AppliedCommit,
    /// Target rejected the publish or was unreachable.
    Failed,
}

/// Reply channel for a pending `submit_update` call.
pub type PublishReply = oneshot::Sender<Result<(Term, StateVersion)>>;

pub struct Publication {
    state: ClusterState,
    targets: BTreeMap<NodeId, PublicationTargetState>,
    committed: bool,
    started: Instant,
    reply: Option<PublishReply>,
}

impl Publication {
    /// `targets` is every node the state is pushed to: the union of the old
    /// and new voting configurations plus all other known nodes (which need
    /// the state even though their acks never count toward quorum).
    pub fn new(
        state: ClusterState,
        targets: impl IntoIterator<Item = NodeId>,
        reply: Option<PublishReply>,
    ) -> Self {
        Self {
            state,
            targets: targets
                .into_iter()
                .map(|id| (id, PublicationTargetState::Sent))
                .collect(),
            committed: false,
            started: Instant::now(),
            reply,
        }
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn term(&self) -> Term {
        self.state.term
    }

    pub fn version(&self) -> StateVersion {
        self.state.version
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn target_state(&self, node: &NodeId) -> Option<PublicationTargetState> {
        self.targets.get(node).copied()
    }

    /// Targets still in `Sent` or `WaitingCommit`.
    pub fn pending_targets(&self) -> Vec<NodeId> {
        self.targets
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s,
                    PublicationTargetState::Sent | PublicationTargetState::WaitingCommit
                )
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn on_ack(&mut self, from: NodeId) {
        if let Some(target) = self.targets.get_mut(&from) {
            if *target == PublicationTargetState::Sent {
                *target = PublicationTargetState::WaitingCommit;
            }
        } else {
            trace!("publish ack from non-target {}", from);
        }
    }

    pub fn on_reject(&mut self, from: NodeId) {
        if let Some(target) = self.targets.get_mut(&from) {
            *target = PublicationTargetState::Failed;
        }
    }

    /// Mark the commit decision made; late publish acks from here on get an
    /// immediate commit message rather than counting toward anything.
    pub fn set_committed(&mut self) {
        self.committed = true;
    }

    pub fn on_commit_ack(&mut self, from: NodeId) {
        if let Some(target) = self.targets.get_mut(&from) {
            *target = PublicationTargetState::AppliedCommit;
        }
    }

    /// Whether the publication missed its commit deadline.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        !self.committed && self.started.elapsed() >= timeout
    }

    /// Resolve the pending client call. Safe to call once; subsequent calls
    /// are no-ops (the reply channel is consumed).
    pub fn resolve(&mut self, result: Result<(Term, StateVersion)>) {
        if let Some(reply) = self.reply.take() {
            // the caller may have given up waiting; that is not an error
            let _ = reply.send(result);
        }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        // a publication abandoned mid-flight must not leave the caller
        // pending indefinitely
        self.resolve(Err(conclave_core::ConclaveError::CoordinatorUnavailable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conclave_core::{ClusterState, ConclaveError, Node, VotingConfiguration};

    fn publication(reply: Option<PublishReply>) -> Publication {
        let ids = [1, 2, 3].map(NodeId::from);
        let config = VotingConfiguration::of(ids);
        let state = ClusterState::initial(config, ids.iter().map(|id| Node::new(*id, "local")))
            .successor(Term(1), Bytes::from_static(b"meta"));
        Publication::new(state, [2, 3].map(NodeId::from), reply)
    }

    #[test]
    fn test_target_transitions() {
        let mut publication = publication(None);
        let follower = NodeId::from(2);

        assert_eq!(
            publication.target_state(&follower),
            Some(PublicationTargetState::Sent)
        );
        publication.on_ack(follower);
        assert_eq!(
            publication.target_state(&follower),
            Some(PublicationTargetState::WaitingCommit)
        );
        publication.on_commit_ack(follower);
        assert_eq!(
            publication.target_state(&follower),
            Some(PublicationTargetState::AppliedCommit)
        );
    }

    #[test]
    fn test_ack_from_non_target_ignored() {
        let mut publication = publication(None);
        publication.on_ack(NodeId::from(99));
        assert_eq!(publication.pending_targets().len(), 2);
    }

    #[test]
    fn test_expiry_only_before_commit() {
        let mut publication = publication(None);
        assert!(publication.is_expired(Duration::ZERO));
        publication.set_committed();
        assert!(!publication.is_expired(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_drop_resolves_pending_caller() {
        let (tx, rx) = oneshot::channel();
        let publication = publication(Some(tx));
        drop(publication);

        let result = rx.await.expect("reply channel resolved");
        assert!(matches!(
            result.unwrap_err(),
            ConclaveError::CoordinatorUnavailable
        ));
    }

    #[tokio::test]
    async fn test_resolve_consumes_reply() {
        let (tx, rx) = oneshot::channel();
        let mut publication = publication(Some(tx));
        publication.resolve(Ok((Term(1), StateVersion(1))));
        // drop must not panic or double-send
        drop(publication);
        assert_eq!(rx.await.unwrap().unwrap(), (Term(1), StateVersion(1)));
    }
}
