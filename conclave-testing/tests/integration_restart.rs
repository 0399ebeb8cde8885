//! Restart integration tests: durable term and accepted state survive a
//! crash, and a restarted node rejoins without disturbing the cluster.

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
async fn test_follower_restart_recovers_term() {
    init_logging();
    let mut cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(WAIT).await;
    let term_before = cluster.handle(leader).current_term();

    let follower = (0..3).find(|i| *i != leader).unwrap();
    cluster.stop(follower).await;

    // the remaining pair still has quorum
    let payload = Bytes::from_static(b"while-down");
    cluster
        .handle(leader)
        .submit_update(payload.clone())
        .await
        .expect("two of three commit");

    cluster.restart(follower).await;

    // the restarted node rejoins at a term no older than it granted before
    tokio::time::timeout(WAIT, async {
        loop {
            if cluster.handle(follower).current_term() >= term_before {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("restarted node never recovered its term");

    // the next commit brings it fully up to date
    let catch_up = Bytes::from_static(b"after-restart");
    let leader = cluster.await_leader(WAIT).await;
    cluster
        .handle(leader)
        .submit_update(catch_up.clone())
        .await
        .expect("commit after restart");
    cluster.await_payload(follower, &catch_up, WAIT).await;

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leader_restart_triggers_reelection_and_recovery() {
    init_logging();
    let mut cluster = TestCluster::start(3).await;
    let first = cluster.await_leader(WAIT).await;

    let payload = Bytes::from_static(b"committed-before-crash");
    cluster
        .handle(first)
        .submit_update(payload.clone())
        .await
        .expect("initial commit");

    cluster.stop(first).await;
    let second = cluster.await_leader(WAIT).await;
    assert_ne!(second, first);

    cluster.restart(first).await;
    let final_payload = Bytes::from_static(b"committed-after-crash");
    let leader = cluster.await_leader(WAIT).await;
    cluster
        .handle(leader)
        .submit_update(final_payload.clone())
        .await
        .expect("commit with restarted node present");

    for i in 0..cluster.size() {
        cluster.await_payload(i, &final_payload, WAIT).await;
    }

    cluster.shutdown().await;
}
