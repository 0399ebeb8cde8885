use std::time::Duration;

/// Tuning knobs for the coordination engine.
///
/// All timeouts are finite so the protocol makes progress after a partition
/// heals. The election cadence values are operational tuning only; any
/// bounded non-zero interval preserves the safety properties.
#[derive(Debug, Clone)]
pub struct ConclaveConfig {
    /// Interval between heartbeat probes in both directions.
    pub heartbeat_interval: Duration,
    /// Consecutive missed leader probes before a follower starts an election.
    pub leader_check_retry_count: u32,
    /// Consecutive missed follower probes before the leader treats the
    /// follower as faulty and feeds it to the reconfigurator.
    pub follower_check_retry_count: u32,
    /// Deadline for a publication to reach commit quorum.
    pub publish_timeout: Duration,
    /// Delay before the first election attempt after losing a leader.
    pub election_initial_timeout: Duration,
    /// Additional delay added per failed election attempt.
    pub election_backoff: Duration,
    /// Upper bound on the delay between election attempts.
    pub election_max_timeout: Duration,
    /// Seed for election jitter; set for deterministic tests.
    pub randomization_seed: Option<u64>,
}

impl Default for ConclaveConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            leader_check_retry_count: 3,
            follower_check_retry_count: 3,
            publish_timeout: Duration::from_millis(3000),
            election_initial_timeout: Duration::from_millis(300),
            election_backoff: Duration::from_millis(100),
            election_max_timeout: Duration::from_secs(2),
            randomization_seed: None,
        }
    }
}

impl ConclaveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_election_timeouts(mut self, initial: Duration, backoff: Duration, max: Duration) -> Self {
        self.election_initial_timeout = initial;
        self.election_backoff = backoff;
        self.election_max_timeout = max;
        self
    }

    pub fn with_leader_check_retry_count(mut self, count: u32) -> Self {
        self.leader_check_retry_count = count;
        self
    }

    pub fn with_follower_check_retry_count(mut self, count: u32) -> Self {
        self.follower_check_retry_count = count;
        self
    }

    pub fn with_randomization_seed(mut self, seed: u64) -> Self {
        self.randomization_seed = Some(seed);
        self
    }
}
