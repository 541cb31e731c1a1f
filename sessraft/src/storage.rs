//! The storage contracts and persisted data types.
//!
//! The engine talks to durable state through three narrow contracts: the
//! metadata store for term/vote/configuration records, the log store for
//! entries, and the snapshot store for state machine images. All three are
//! usually implemented by a single storage engine; `RaftStorage` is the
//! umbrella bound the server requires.

use std::ops::Range;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::Configuration;
use crate::raft_types::LogId;
use crate::summary::MessageSummary;
use crate::AppData;
use crate::MemberId;
use crate::SessionId;

/// A record holding the hard state of a server.
///
/// Must be written durably before the corresponding protocol action is
/// externalized: a term advance before any message carries the new term, a
/// vote before the vote response leaves the server.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HardState {
    /// The last recorded term observed by this server.
    pub current_term: u64,
    /// The ID of the member voted for in `current_term`.
    pub voted_for: Option<MemberId>,
}

/// The state a server recovers from storage when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The ID of the last entry in the log.
    pub last_log_id: LogId,
    /// The saved hard state of the server.
    pub hard_state: HardState,
    /// The latest known membership configuration, falling back to an initial
    /// configuration containing only this server.
    pub configuration: Configuration,
    /// Metadata of the current snapshot, if one exists.
    pub snapshot: Option<SnapshotMeta>,
}

impl InitialState {
    /// Create a new instance for a pristine server.
    pub fn new_initial(id: MemberId) -> Self {
        Self {
            last_log_id: LogId::default(),
            hard_state: HardState::default(),
            configuration: Configuration::new_initial(id),
            snapshot: None,
        }
    }
}

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<D: AppData> {
    pub log_id: LogId,

    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> LogEntry<D> {
    /// The state-machine timestamp carried by this entry, in milliseconds.
    ///
    /// Entries are stamped by the leader at append time; every server derives
    /// its deterministic state-machine clock from these stamps.
    pub fn timestamp(&self) -> u64 {
        match &self.payload {
            EntryPayload::Initialize { timestamp } => *timestamp,
            EntryPayload::Configuration(_) => 0,
            EntryPayload::OpenSession(open) => open.timestamp,
            EntryPayload::CloseSession(close) => close.timestamp,
            EntryPayload::KeepAlive(ka) => ka.timestamp,
            EntryPayload::Command(cmd) => cmd.timestamp,
            EntryPayload::Metadata(meta) => meta.timestamp,
        }
    }

    /// An estimate of the payload size in bytes, used for batching.
    pub fn size_hint(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(64)
    }
}

impl<D: AppData> MessageSummary for LogEntry<D> {
    fn summary(&self) -> String {
        let kind = match &self.payload {
            EntryPayload::Initialize { .. } => "initialize".to_string(),
            EntryPayload::Configuration(c) => format!("configuration:{}", c.summary()),
            EntryPayload::OpenSession(_) => "open-session".to_string(),
            EntryPayload::CloseSession(c) => format!("close-session:{}", c.session),
            EntryPayload::KeepAlive(k) => format!("keep-alive:{}", k.session),
            EntryPayload::Command(c) => format!("command:{}:{}", c.session, c.sequence),
            EntryPayload::Metadata(_) => "metadata".to_string(),
        };
        format!("{}:{}", self.log_id, kind)
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty entry committed by a new leader to establish its commit
    /// proof for the term.
    Initialize { timestamp: u64 },
    /// A membership configuration change.
    Configuration(Configuration),
    /// Registration of a new client session; the session's ID is the index
    /// of this entry.
    OpenSession(OpenSessionEntry),
    /// An explicit close of a client session.
    CloseSession(CloseSessionEntry),
    /// A session keep-alive, also carrying result and event acknowledgments.
    KeepAlive(KeepAliveEntry),
    /// A client command to be applied to the state machine.
    #[serde(bound = "D: AppData")]
    Command(CommandEntry<D>),
    /// A read of the session registry, committed through the log so that the
    /// response reflects a single point in time.
    Metadata(MetadataEntry),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionEntry {
    /// The member through which the client connected; events for the session
    /// are pushed to this member.
    pub member: MemberId,
    pub name: String,
    /// The name of the state machine the session binds to.
    pub kind: String,
    pub timeout: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionEntry {
    pub session: SessionId,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    pub session: SessionId,
    /// Highest command sequence whose result the client acknowledges.
    pub command_ack: u64,
    /// Highest event index the client acknowledges.
    pub event_ack: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry<D: AppData> {
    pub session: SessionId,
    pub sequence: u64,
    #[serde(bound = "D: AppData")]
    pub data: D,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub session: SessionId,
    pub timestamp: u64,
}

/// Metadata describing a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// A unique ID for this snapshot.
    pub id: String,
    /// The ID of the last entry covered by the snapshot.
    pub last_log_id: LogId,
    /// The membership configuration as of `last_log_id`.
    pub configuration: Configuration,
}

/// A snapshot of the state machine, including the engine's session registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// The metadata store contract.
///
/// A successful store returns only after the value is stable against process
/// crash.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Load the saved hard state, if any.
    async fn load_hard_state(&self) -> Result<Option<HardState>>;

    /// Durably save the hard state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Load the last committed configuration, if any.
    async fn load_configuration(&self) -> Result<Option<Configuration>>;

    /// Durably save a committed configuration.
    async fn save_configuration(&self, config: &Configuration) -> Result<()>;
}

/// The log store contract.
///
/// Entries are densely numbered. The writer is single-producer: all
/// mutations come from the protocol context. Readers (the per-member
/// appenders) observe entries up to the writer's current last index.
#[async_trait]
pub trait LogStore<D: AppData>: Send + Sync + 'static {
    /// The ID of the last entry appended to the log, or the default when the
    /// log is empty. Survives prefix compaction.
    async fn last_log_id(&self) -> Result<LogId>;

    /// The lowest retained index, or 0 when the log is empty.
    async fn first_index(&self) -> Result<u64>;

    /// Get a series of entries `[range.start, range.end)`.
    ///
    /// Entries missing because of prefix compaction are simply absent from
    /// the result; it is the caller's job to detect the gap and switch to
    /// snapshot replication.
    async fn get_log_entries(&self, range: Range<u64>) -> Result<Vec<LogEntry<D>>>;

    /// Get a single entry, `None` when absent or compacted.
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<LogEntry<D>>>;

    /// Append entries to the log.
    async fn append_to_log(&self, entries: &[LogEntry<D>]) -> Result<()>;

    /// Delete the log suffix starting at `from`, inclusive.
    async fn truncate_log(&self, from: u64) -> Result<()>;

    /// Delete the log prefix up to `through`, inclusive. Called after a
    /// snapshot at `through` has been committed.
    async fn purge_log(&self, through: u64) -> Result<()>;
}

/// The snapshot store contract.
///
/// At most one snapshot is current at a time; committing a snapshot
/// atomically supersedes any predecessor.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Atomically commit a snapshot, superseding any earlier one.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// The current snapshot, if any.
    async fn current_snapshot(&self) -> Result<Option<Snapshot>>;

    /// The current snapshot's metadata, without its payload.
    async fn current_snapshot_meta(&self) -> Result<Option<SnapshotMeta>>;
}

/// The umbrella storage bound required by the server: metadata, log and
/// snapshot contracts together.
#[async_trait]
pub trait RaftStorage<D: AppData>: MetaStore + LogStore<D> + SnapshotStore {
    /// Assemble the server's initial state from the three contracts.
    async fn get_initial_state(&self, id: MemberId) -> Result<InitialState> {
        let hard_state = self.load_hard_state().await?.unwrap_or_default();
        let mut configuration = match self.load_configuration().await? {
            Some(config) => config,
            None => Configuration::new_initial(id),
        };
        let snapshot = self.current_snapshot_meta().await?;
        if let Some(meta) = &snapshot {
            if meta.configuration.is_newer_than(&configuration) {
                configuration = meta.configuration.clone();
            }
        }
        let mut last_log_id = self.last_log_id().await?;
        if let Some(meta) = &snapshot {
            last_log_id = std::cmp::max(last_log_id, meta.last_log_id);
        }

        // The log tail may carry a configuration entry which was appended but
        // not committed before the last shutdown; the latest appended
        // configuration is the operative one.
        let first = self.first_index().await?;
        let scan_from = std::cmp::max(first, configuration.index + 1);
        if first > 0 && last_log_id.index >= scan_from {
            let entries = self.get_log_entries(scan_from..last_log_id.index + 1).await?;
            for entry in entries {
                if let EntryPayload::Configuration(config) = entry.payload {
                    if config.is_newer_than(&configuration) {
                        configuration = config;
                    }
                }
            }
        }

        Ok(InitialState {
            last_log_id,
            hard_state,
            configuration,
            snapshot,
        })
    }
}

impl<D: AppData, T: MetaStore + LogStore<D> + SnapshotStore> RaftStorage<D> for T {}
