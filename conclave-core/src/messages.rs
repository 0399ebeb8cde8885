//! Coordination protocol messages: pre-vote, vote, publish, commit, and
//! heartbeat request/response pairs.

use crate::{ClusterState, NodeId, StateVersion, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub id: uuid::Uuid,
    pub from: NodeId,
    pub to: Option<NodeId>, // None for broadcast
    pub timestamp: u64,
    pub kind: MessageKind,
}

impl ProtocolMessage {
    pub fn new(from: NodeId, to: Option<NodeId>, kind: MessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            from,
            to,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            kind,
        }
    }

    pub fn pre_vote_request(from: NodeId, to: NodeId, request: PreVoteRequest) -> Self {
        Self::new(from, Some(to), MessageKind::PreVoteRequest(request))
    }

    pub fn pre_vote_response(from: NodeId, to: NodeId, response: PreVoteResponse) -> Self {
        Self::new(from, Some(to), MessageKind::PreVoteResponse(response))
    }

    pub fn vote_request(from: NodeId, to: NodeId, request: VoteRequest) -> Self {
        Self::new(from, Some(to), MessageKind::VoteRequest(request))
    }

    pub fn vote_response(from: NodeId, to: NodeId, response: VoteResponse) -> Self {
        Self::new(from, Some(to), MessageKind::VoteResponse(response))
    }

    pub fn publish_request(from: NodeId, to: NodeId, request: PublishRequest) -> Self {
        Self::new(from, Some(to), MessageKind::PublishRequest(request))
    }

    pub fn publish_response(from: NodeId, to: NodeId, response: PublishResponse) -> Self {
        Self::new(from, Some(to), MessageKind::PublishResponse(response))
    }

    pub fn publish_reject(from: NodeId, to: NodeId, reject: PublishReject) -> Self {
        Self::new(from, Some(to), MessageKind::PublishReject(reject))
    }

    pub fn apply_commit(from: NodeId, to: NodeId, request: ApplyCommitRequest) -> Self {
        Self::new(from, Some(to), MessageKind::ApplyCommitRequest(request))
    }

    pub fn apply_commit_ack(from: NodeId, to: NodeId, ack: ApplyCommitAck) -> Self {
        Self::new(from, Some(to), MessageKind::ApplyCommitAck(ack))
    }

    pub fn leader_heartbeat(from: NodeId, to: NodeId, heartbeat: LeaderHeartbeat) -> Self {
        Self::new(from, Some(to), MessageKind::LeaderHeartbeat(heartbeat))
    }

    pub fn follower_heartbeat(from: NodeId, to: NodeId, heartbeat: FollowerHeartbeat) -> Self {
        Self::new(from, Some(to), MessageKind::FollowerHeartbeat(heartbeat))
    }

    pub fn heartbeat_ack(from: NodeId, to: NodeId, ack: HeartbeatAck) -> Self {
        Self::new(from, Some(to), MessageKind::HeartbeatAck(ack))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageKind {
    PreVoteRequest(PreVoteRequest),
    PreVoteResponse(PreVoteResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    PublishRequest(PublishRequest),
    PublishResponse(PublishResponse),
    PublishReject(PublishReject),
    ApplyCommitRequest(ApplyCommitRequest),
    ApplyCommitAck(ApplyCommitAck),
    LeaderHeartbeat(LeaderHeartbeat),
    FollowerHeartbeat(FollowerHeartbeat),
    HeartbeatAck(HeartbeatAck),
}

/// Non-binding probe sent before a real election to check whether the
/// sender could plausibly win. Has no durable side effect on the receiver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreVoteRequest {
    pub term: Term,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreVoteResponse {
    pub current_term: Term,
    pub last_accepted_term: Term,
    pub last_accepted_version: StateVersion,
}

/// Binding vote request for `term`, carrying the candidate's accepted-state
/// position so the receiver can enforce leader completeness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub last_accepted_term: Term,
    pub last_accepted_version: StateVersion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoteResponse {
    pub granted: bool,
    pub current_term: Term,
    pub last_accepted_term: Term,
    pub last_accepted_version: StateVersion,
}

/// Phase 1 of a publication: the full proposed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub state: ClusterState,
}

/// Ack for an accepted publish request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PublishResponse {
    pub term: Term,
    pub version: StateVersion,
}

/// Rejection carrying the receiver's higher term, forcing the sender to
/// step down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PublishReject {
    pub current_term: Term,
}

/// Phase 2 of a publication: commit marker for an already-accepted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCommitRequest {
    pub term: Term,
    pub version: StateVersion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApplyCommitAck {
    pub term: Term,
    pub version: StateVersion,
}

/// Heartbeat a follower sends to its leader to check it is still alive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeaderHeartbeat {
    pub term: Term,
}

/// Heartbeat the leader sends to each follower in the voting configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FollowerHeartbeat {
    pub term: Term,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub current_term: Term,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_request_equality() {
        let a = ApplyCommitRequest {
            term: Term(3),
            version: StateVersion(8),
        };
        let b = ApplyCommitRequest {
            term: Term(3),
            version: StateVersion(8),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_envelope_addressing() {
        let from = NodeId::from(1);
        let to = NodeId::from(2);
        let message = ProtocolMessage::heartbeat_ack(
            from,
            to,
            HeartbeatAck {
                current_term: Term(5),
            },
        );
        assert_eq!(message.to, Some(to));
        match message.kind {
            MessageKind::HeartbeatAck(ack) => assert_eq!(ack.current_term, Term(5)),
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
