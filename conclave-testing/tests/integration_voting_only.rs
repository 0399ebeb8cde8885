//! Voting-only node integration tests: such nodes vote and count toward
//! quorum but never take leadership themselves.

use bytes::Bytes;
use std::time::Duration;

use conclave_testing::TestCluster;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

const WAIT: Duration = Duration::from_secs(120);

#[tokio::test(start_paused = true)]
async fn test_voting_only_node_never_leads() {
    init_logging();
    // node index 2 is voting-only
    let mut cluster = TestCluster::start_with(3, &[2]).await;

    let leader = cluster.await_leader(WAIT).await;
    assert_ne!(leader, 2, "voting-only node must not lead");

    // even after the leader fails, leadership goes to the other full node
    cluster.stop(leader).await;
    let second = cluster.await_leader(WAIT).await;
    assert_ne!(second, 2, "voting-only node must not lead after failover");
    assert_ne!(second, leader);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_voting_only_vote_counts_toward_quorum() {
    init_logging();
    let mut cluster = TestCluster::start_with(3, &[2]).await;
    let leader = cluster.await_leader(WAIT).await;

    // drop the non-leading full node; the quorum that keeps the leader in
    // power and commits updates now depends on the voting-only node
    let other_full = (0..2).find(|i| *i != leader).unwrap();
    cluster.stop(other_full).await;

    let payload = Bytes::from_static(b"carried by a voting-only quorum");
    cluster
        .handle(leader)
        .submit_update(payload.clone())
        .await
        .expect("commit with voting-only node in the quorum");
    cluster.await_payload(2, &payload, WAIT).await;

    cluster.shutdown().await;
}
