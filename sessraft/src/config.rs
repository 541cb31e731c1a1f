//! Runtime configuration.

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT: u64 = 150;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default maximum number of bytes per replication batch.
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 1024 * 1024;
/// Default number of pipelined appends per follower.
pub const DEFAULT_MAX_INFLIGHT_APPENDS: u64 = 1;
/// Default snapshot chunk size, in bytes.
pub const DEFAULT_SNAPSHOT_CHUNK_BYTES: u64 = 1024 * 1024;
/// Default threshold of applied entries since the last snapshot.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 5000;
/// Default lag, in entries, below which a learner is promotable.
pub const DEFAULT_PROMOTION_LAG_THRESHOLD: u64 = 10;
/// Default client session timeout, in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT: u64 = 5000;
/// Default timeout for a single snapshot chunk round-trip, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;

/// Log compaction and snapshot policy.
///
/// This governs when the leader asks the state-machine context to build a
/// snapshot, and with it when lagging followers are switched from log
/// replication to snapshot installation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Build a snapshot once the given number of entries have been applied
    /// since the last snapshot.
    EntriesSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::EntriesSinceLast(DEFAULT_SNAPSHOT_THRESHOLD)
    }
}

/// The runtime configuration for a server.
///
/// Remember the inequality from the Raft paper when tuning:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. The heartbeat interval must
/// comfortably exceed the average RPC round-trip, and the election timeout
/// must be several heartbeat intervals so that a live leader never loses
/// followers to spurious elections.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this cluster, used for observability.
    pub cluster_name: String,
    /// The election timeout in milliseconds.
    ///
    /// A follower arms its heartbeat timer with a value drawn uniformly from
    /// `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: u64,
    /// The interval in milliseconds at which the leader sends heartbeats.
    pub heartbeat_interval: u64,
    /// The maximum number of bytes per replication batch.
    ///
    /// A single entry larger than this is still sent, alone.
    pub max_batch_bytes: u64,
    /// The number of append requests a follower's appender may have in
    /// flight at once. Defaults to 1, which serializes the pipeline.
    pub max_inflight_appends: u64,
    /// The maximum snapshot chunk size in bytes for snapshot installation.
    pub snapshot_chunk_bytes: u64,
    /// The snapshot policy.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum number of entries a learner may lag behind the leader's
    /// last log index and still be considered caught up for promotion.
    pub promotion_lag_threshold: u64,
    /// The session timeout in milliseconds granted to sessions which do not
    /// request one.
    pub session_timeout: u64,
    /// How long the leader may go without contact from a quorum before it
    /// steps down, in milliseconds.
    pub leader_lease_timeout: u64,
    /// The timeout for a single snapshot chunk round-trip, in milliseconds.
    pub install_snapshot_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate`
    /// when done.
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            election_timeout: None,
            heartbeat_interval: None,
            max_batch_bytes: None,
            max_inflight_appends: None,
            snapshot_chunk_bytes: None,
            snapshot_policy: None,
            promotion_lag_threshold: None,
            session_timeout: None,
            leader_lease_timeout: None,
            install_snapshot_timeout: None,
        }
    }

    /// Generate a new randomized heartbeat timeout within
    /// `[election_timeout, 2 * election_timeout)`.
    pub fn new_rand_election_timeout(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_timeout..self.election_timeout * 2)
    }

    /// The number of applied entries since the last snapshot which triggers a
    /// new snapshot build.
    pub fn snapshot_threshold(&self) -> u64 {
        let SnapshotPolicy::EntriesSinceLast(n) = self.snapshot_policy;
        n
    }
}

/// A configuration builder which validates the assembled config.
#[derive(Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_batch_bytes: Option<u64>,
    max_inflight_appends: Option<u64>,
    snapshot_chunk_bytes: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    promotion_lag_threshold: Option<u64>,
    session_timeout: Option<u64>,
    leader_lease_timeout: Option<u64>,
    install_snapshot_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout`.
    pub fn election_timeout(mut self, val: u64) -> Self {
        self.election_timeout = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_batch_bytes`.
    pub fn max_batch_bytes(mut self, val: u64) -> Self {
        self.max_batch_bytes = Some(val);
        self
    }

    /// Set the desired value for `max_inflight_appends`.
    pub fn max_inflight_appends(mut self, val: u64) -> Self {
        self.max_inflight_appends = Some(val);
        self
    }

    /// Set the desired value for `snapshot_chunk_bytes`.
    pub fn snapshot_chunk_bytes(mut self, val: u64) -> Self {
        self.snapshot_chunk_bytes = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `promotion_lag_threshold`.
    pub fn promotion_lag_threshold(mut self, val: u64) -> Self {
        self.promotion_lag_threshold = Some(val);
        self
    }

    /// Set the desired value for `session_timeout`.
    pub fn session_timeout(mut self, val: u64) -> Self {
        self.session_timeout = Some(val);
        self
    }

    /// Set the desired value for `leader_lease_timeout`.
    pub fn leader_lease_timeout(mut self, val: u64) -> Self {
        self.leader_lease_timeout = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance
    /// if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout = self.election_timeout.unwrap_or(DEFAULT_ELECTION_TIMEOUT);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if election_timeout <= heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutLessThanHeartbeatInterval);
        }
        let max_batch_bytes = self.max_batch_bytes.unwrap_or(DEFAULT_MAX_BATCH_BYTES);
        if max_batch_bytes == 0 {
            return Err(ConfigError::MaxBatchBytesTooSmall);
        }
        let max_inflight_appends = self.max_inflight_appends.unwrap_or(DEFAULT_MAX_INFLIGHT_APPENDS);
        if max_inflight_appends == 0 {
            return Err(ConfigError::MaxInflightAppendsTooSmall);
        }
        let snapshot_chunk_bytes = self.snapshot_chunk_bytes.unwrap_or(DEFAULT_SNAPSHOT_CHUNK_BYTES);
        if snapshot_chunk_bytes == 0 {
            return Err(ConfigError::SnapshotChunkBytesTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout,
            heartbeat_interval,
            max_batch_bytes,
            max_inflight_appends,
            snapshot_chunk_bytes,
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
            promotion_lag_threshold: self.promotion_lag_threshold.unwrap_or(DEFAULT_PROMOTION_LAG_THRESHOLD),
            session_timeout: self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT),
            leader_lease_timeout: self.leader_lease_timeout.unwrap_or(election_timeout * 2),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0").validate().unwrap();

        assert_eq!(cfg.election_timeout, DEFAULT_ELECTION_TIMEOUT);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.max_batch_bytes, DEFAULT_MAX_BATCH_BYTES);
        assert_eq!(cfg.max_inflight_appends, DEFAULT_MAX_INFLIGHT_APPENDS);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::EntriesSinceLast(DEFAULT_SNAPSHOT_THRESHOLD));
        assert_eq!(cfg.promotion_lag_threshold, DEFAULT_PROMOTION_LAG_THRESHOLD);
        assert_eq!(cfg.session_timeout, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(cfg.leader_lease_timeout, DEFAULT_ELECTION_TIMEOUT * 2);
    }

    #[test]
    fn test_config_with_specified_values() {
        let cfg = Config::build("cluster0")
            .election_timeout(300)
            .heartbeat_interval(100)
            .max_batch_bytes(1024)
            .max_inflight_appends(4)
            .snapshot_chunk_bytes(512)
            .snapshot_policy(SnapshotPolicy::EntriesSinceLast(100))
            .promotion_lag_threshold(5)
            .session_timeout(10_000)
            .leader_lease_timeout(900)
            .validate()
            .unwrap();

        assert_eq!(cfg.election_timeout, 300);
        assert_eq!(cfg.heartbeat_interval, 100);
        assert_eq!(cfg.max_batch_bytes, 1024);
        assert_eq!(cfg.max_inflight_appends, 4);
        assert_eq!(cfg.snapshot_chunk_bytes, 512);
        assert_eq!(cfg.snapshot_threshold(), 100);
        assert_eq!(cfg.promotion_lag_threshold, 5);
        assert_eq!(cfg.session_timeout, 10_000);
        assert_eq!(cfg.leader_lease_timeout, 900);
    }

    #[test]
    fn test_rand_election_timeout_within_range() {
        let cfg = Config::build("cluster0").validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout);
            assert!(t < cfg.election_timeout * 2);
        }
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_expected_error() {
        let res = Config::build("cluster0").election_timeout(50).heartbeat_interval(50).validate();
        assert!(res.is_err());
        assert_eq!(res.unwrap_err(), ConfigError::ElectionTimeoutLessThanHeartbeatInterval);
    }
}
