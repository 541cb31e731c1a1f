//! An in-memory storage system and key-value state machine for demo and
//! testing purposes related to `sessraft`.

#[cfg(test)]
mod test;

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use sessraft::async_trait::async_trait;
use sessraft::membership::Configuration;
use sessraft::sm::ApplyContext;
use sessraft::storage::HardState;
use sessraft::storage::LogEntry;
use sessraft::storage::Snapshot;
use sessraft::storage::SnapshotMeta;
use sessraft::AppData;
use sessraft::AppDataResponse;
use sessraft::AppEvent;
use sessraft::LogId;
use sessraft::LogStore;
use sessraft::MetaStore;
use sessraft::SessionId;
use sessraft::SnapshotStore;
use sessraft::StateMachine;
use tokio::sync::RwLock;

/// The application command type which the memstore works with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Store a value, returning the previous one.
    Put { key: String, value: String },
    /// Store several values in one command, publishing one event per entry.
    PutAll { entries: Vec<(String, String)> },
    /// Remove a key, returning the removed value.
    Delete { key: String },
    /// Read a value.
    Get { key: String },
}

impl AppData for ClientRequest {}

/// The application response type which the memstore works with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub value: Option<String>,
}

impl AppDataResponse for ClientResponse {}

/// An event published to the issuing session whenever a key changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyChanged {
    pub key: String,
    pub value: Option<String>,
}

impl AppEvent for KeyChanged {}

/// A record of one session lifecycle transition observed by the state
/// machine, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub session: SessionId,
    pub kind: &'static str,
}

/// A session-aware key-value state machine.
pub struct MemStateMachine {
    kv: BTreeMap<String, String>,
    lifecycle: Arc<Mutex<Vec<LifecycleEvent>>>,
    /// Counts real invocations of `apply`, so tests can prove that a
    /// retried command was served from the session's result cache.
    applied: Arc<Mutex<u64>>,
}

impl Default for MemStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self {
            kv: BTreeMap::new(),
            lifecycle: Arc::new(Mutex::new(Vec::new())),
            applied: Arc::new(Mutex::new(0)),
        }
    }

    /// A shared handle to the lifecycle transitions observed so far.
    pub fn lifecycle_handle(&self) -> Arc<Mutex<Vec<LifecycleEvent>>> {
        self.lifecycle.clone()
    }

    /// A shared handle to the apply-invocation counter.
    pub fn applied_handle(&self) -> Arc<Mutex<u64>> {
        self.applied.clone()
    }

    fn record(&self, session: SessionId, kind: &'static str) {
        self.lifecycle.lock().unwrap().push(LifecycleEvent { session, kind });
    }
}

#[async_trait]
impl StateMachine<ClientRequest, ClientResponse, KeyChanged> for MemStateMachine {
    fn kind(&self) -> String {
        "kv".to_string()
    }

    async fn apply(
        &mut self,
        _index: u64,
        data: &ClientRequest,
        ctx: &mut ApplyContext<KeyChanged>,
    ) -> Result<ClientResponse, String> {
        *self.applied.lock().unwrap() += 1;
        match data {
            ClientRequest::Put { key, value } => {
                let previous = self.kv.insert(key.clone(), value.clone());
                ctx.publish(KeyChanged {
                    key: key.clone(),
                    value: Some(value.clone()),
                });
                Ok(ClientResponse { value: previous })
            }
            ClientRequest::PutAll { entries } => {
                for (key, value) in entries {
                    self.kv.insert(key.clone(), value.clone());
                    ctx.publish(KeyChanged {
                        key: key.clone(),
                        value: Some(value.clone()),
                    });
                }
                Ok(ClientResponse { value: None })
            }
            ClientRequest::Delete { key } => {
                let previous = self.kv.remove(key);
                ctx.publish(KeyChanged {
                    key: key.clone(),
                    value: None,
                });
                Ok(ClientResponse { value: previous })
            }
            ClientRequest::Get { key } => Ok(ClientResponse {
                value: self.kv.get(key).cloned(),
            }),
        }
    }

    async fn query(&self, data: &ClientRequest) -> Result<ClientResponse, String> {
        match data {
            ClientRequest::Get { key } => Ok(ClientResponse {
                value: self.kv.get(key).cloned(),
            }),
            _ => Err("writes must be submitted as commands".to_string()),
        }
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.kv)?)
    }

    async fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.kv = serde_json::from_slice(data)?;
        Ok(())
    }

    async fn session_opened(&mut self, session: SessionId) {
        self.record(session, "open");
    }

    async fn session_expired(&mut self, session: SessionId) {
        self.record(session, "expire");
    }

    async fn session_closed(&mut self, session: SessionId) {
        self.record(session, "close");
    }
}

/// An in-memory implementation of the metadata, log and snapshot storage
/// contracts.
pub struct MemStore {
    log: RwLock<BTreeMap<u64, LogEntry<ClientRequest>>>,
    /// The last appended log ID; survives prefix compaction.
    last_log_id: RwLock<LogId>,
    hs: RwLock<Option<HardState>>,
    configuration: RwLock<Option<Configuration>>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(BTreeMap::new()),
            last_log_id: RwLock::new(LogId::default()),
            hs: RwLock::new(None),
            configuration: RwLock::new(None),
            snapshot: RwLock::new(None),
        }
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn load_hard_state(&self) -> Result<Option<HardState>> {
        Ok(self.hs.read().await.clone())
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn load_configuration(&self) -> Result<Option<Configuration>> {
        Ok(self.configuration.read().await.clone())
    }

    async fn save_configuration(&self, config: &Configuration) -> Result<()> {
        *self.configuration.write().await = Some(config.clone());
        Ok(())
    }
}

#[async_trait]
impl LogStore<ClientRequest> for MemStore {
    async fn last_log_id(&self) -> Result<LogId> {
        Ok(*self.last_log_id.read().await)
    }

    async fn first_index(&self) -> Result<u64> {
        let log = self.log.read().await;
        Ok(log.keys().next().copied().unwrap_or(0))
    }

    async fn get_log_entries(&self, range: Range<u64>) -> Result<Vec<LogEntry<ClientRequest>>> {
        if range.start > range.end {
            tracing::error!("invalid request, start > stop");
            return Ok(vec![]);
        }
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, index: u64) -> Result<Option<LogEntry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&index).cloned())
    }

    async fn append_to_log(&self, entries: &[LogEntry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        let mut last = self.last_log_id.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry.clone());
            if entry.log_id > *last {
                *last = entry.log_id;
            }
        }
        Ok(())
    }

    async fn truncate_log(&self, from: u64) -> Result<()> {
        let mut log = self.log.write().await;
        log.split_off(&from);
        let mut last = self.last_log_id.write().await;
        *last = log.values().next_back().map(|entry| entry.log_id).unwrap_or_default();
        Ok(())
    }

    async fn purge_log(&self, through: u64) -> Result<()> {
        let mut log = self.log.write().await;
        *log = log.split_off(&(through + 1));
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemStore {
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        *self.snapshot.write().await = Some(snapshot);
        Ok(())
    }

    async fn current_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn current_snapshot_meta(&self) -> Result<Option<SnapshotMeta>> {
        Ok(self.snapshot.read().await.as_ref().map(|s| s.meta.clone()))
    }
}
