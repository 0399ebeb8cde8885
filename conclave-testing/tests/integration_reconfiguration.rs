//! Auto-reconfiguration integration tests: the leader retires members past
//! their retry budget from the voting configuration, but never shrinks it
//! below the safety floor.

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
async fn test_leader_retires_unreachable_members() {
    init_logging();
    let mut cluster = TestCluster::start(5).await;
    let leader = cluster.await_leader(WAIT).await;

    // two unreachable members leave three live nodes, which is both odd and
    // at the safety floor, so the leader shrinks the configuration
    let stopped: Vec<usize> = (0..5).filter(|i| *i != leader).take(2).collect();
    let stopped_ids: Vec<_> = stopped.iter().map(|i| cluster.id(*i)).collect();
    for i in &stopped {
        cluster.stop(*i).await;
    }

    tokio::time::timeout(WAIT, async {
        loop {
            let config = cluster.handle(leader).current_state().voting_config;
            if config.len() == 3 && stopped_ids.iter().all(|id| !config.contains(id)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("unreachable members were never retired from the voting configuration");

    // the shrunk configuration still commits
    let payload = Bytes::from_static(b"after-retirement");
    cluster
        .handle(leader)
        .submit_update(payload.clone())
        .await
        .expect("commit under the shrunk configuration");
    for i in (0..5).filter(|i| !stopped.contains(i)) {
        cluster.await_payload(i, &payload, WAIT).await;
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_configuration_keeps_safety_floor() {
    init_logging();
    let mut cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(WAIT).await;

    // with only two live nodes no safe shrink exists; the unreachable
    // member stays in the configuration as quorum filler
    let stopped = (0..3).find(|i| *i != leader).unwrap();
    let stopped_id = cluster.id(stopped);
    cluster.stop(stopped).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    let config = cluster.handle(leader).current_state().voting_config;
    assert_eq!(config.len(), 3);
    assert!(config.contains(&stopped_id));

    // two of three is still a quorum
    let payload = Bytes::from_static(b"floor-held");
    cluster
        .handle(leader)
        .submit_update(payload.clone())
        .await
        .expect("commit with a dead member as quorum filler");
    for i in (0..3).filter(|i| *i != stopped) {
        cluster.await_payload(i, &payload, WAIT).await;
    }

    cluster.shutdown().await;
}
