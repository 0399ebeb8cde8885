//! Publication integration tests: committed updates reach every node, in
//! order, and only through the leader.

use bytes::Bytes;
use std::time::Duration;

use conclave_core::ConclaveError;
use conclave_testing::TestCluster;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

const WAIT: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn test_committed_update_reaches_all_nodes() {
    init_logging();
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(WAIT).await;

    let payload = Bytes::from_static(b"index mapping v1");
    let (term, version) = cluster
        .handle(leader)
        .submit_update(payload.clone())
        .await
        .expect("leader commits the update");
    assert_eq!(term, cluster.handle(leader).current_term());

    for i in 0..cluster.size() {
        cluster.await_payload(i, &payload, WAIT).await;
        assert!(cluster.handle(i).current_state().version >= version);
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sequential_updates_are_ordered() {
    init_logging();
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(WAIT).await;

    let mut last_version = None;
    for round in 0..5u8 {
        let payload = Bytes::from(vec![b'v', round]);
        let (_, version) = cluster
            .handle(leader)
            .submit_update(payload)
            .await
            .expect("update commits");
        if let Some(previous) = last_version {
            assert!(version > previous, "versions must advance");
        }
        last_version = Some(version);
    }

    let final_payload = Bytes::from(vec![b'v', 4]);
    for i in 0..cluster.size() {
        cluster.await_payload(i, &final_payload, WAIT).await;
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_submit_on_follower_is_rejected() {
    init_logging();
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(WAIT).await;
    let leader_id = cluster.id(leader);

    let follower = (0..3).find(|i| *i != leader).unwrap();
    // wait until the follower has learned who leads, so the rejection can
    // name the leader
    tokio::time::timeout(WAIT, async {
        loop {
            if cluster.handle(follower).leader() == Some(leader_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let err = cluster
        .handle(follower)
        .submit_update(Bytes::from_static(b"nope"))
        .await
        .unwrap_err();
    match err {
        ConclaveError::NotLeader { leader } => assert_eq!(leader, Some(leader_id)),
        other => panic!("unexpected error: {other}"),
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_isolated_leader_cannot_commit() {
    init_logging();
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(WAIT).await;
    let leader_id = cluster.id(leader);

    cluster.hub().isolate(leader_id);

    // every subsequent submit on the isolated node fails: either the
    // publication misses quorum or the node has already stepped down
    let result = cluster
        .handle(leader)
        .submit_update(Bytes::from_static(b"split-brain write"))
        .await;
    assert!(result.is_err());

    // the majority side elects a fresh leader and keeps committing
    let survivors: Vec<usize> = (0..3).filter(|i| *i != leader).collect();
    let new_leader = cluster.await_leader_among(&survivors, WAIT).await;
    let payload = Bytes::from_static(b"majority write");
    cluster
        .handle(new_leader)
        .submit_update(payload.clone())
        .await
        .expect("majority commits");

    // the deposed leader must never have applied its write
    assert_ne!(
        cluster.handle(leader).current_state().payload,
        Bytes::from_static(b"split-brain write")
    );

    cluster.shutdown().await;
}
