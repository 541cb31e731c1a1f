//! The state-machine execution context.
//!
//! Committed entries are applied on a dedicated task, the worker, which owns
//! the application state machine and the client session registry. The
//! protocol context communicates with it exclusively through posted
//! commands; no state is shared mutably across the two contexts.

pub(crate) mod session;
pub(crate) mod worker;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::membership::Configuration;
use crate::raft::CloseSessionResponse;
use crate::raft::CommandResponse;
use crate::raft::KeepAliveResponse;
use crate::raft::MetadataResponse;
use crate::raft::OpenSessionResponse;
use crate::raft::QueryRequest;
use crate::raft::QueryResponse;
use crate::raft::RaftRespTx;
use crate::raft::ResetRequest;
use crate::raft_types::LogId;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::SessionId;

/// The application state machine replicated by the cluster.
///
/// `apply` is invoked once per committed command, in log order, on the
/// state-machine execution context. An `Err` return is an application level
/// failure: it is cached as the command's result and returned again on
/// retries, exactly like a success.
#[async_trait]
pub trait StateMachine<D, R, E>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
{
    /// The name of this state machine. Sessions bind to a state machine by
    /// name when they open.
    fn kind(&self) -> String {
        "default".to_string()
    }

    /// Apply a committed command at the given log index.
    ///
    /// Events published through the context are delivered to the command's
    /// session with indexed, resendable semantics.
    async fn apply(&mut self, index: u64, data: &D, ctx: &mut ApplyContext<E>) -> Result<R, String>;

    /// Execute a read-only query. Consistency gating has already happened by
    /// the time this is invoked.
    async fn query(&self, data: &D) -> Result<R, String>;

    /// Serialize the state machine for snapshotting.
    async fn snapshot(&self) -> anyhow::Result<Vec<u8>>;

    /// Replace the state machine's state from a snapshot.
    async fn restore(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Called when a session binding to this state machine opens.
    async fn session_opened(&mut self, _session: SessionId) {}

    /// Called when a session expires.
    async fn session_expired(&mut self, _session: SessionId) {}

    /// Called when a session closes.
    async fn session_closed(&mut self, _session: SessionId) {}
}

/// The context handed to `StateMachine::apply` for one command.
pub struct ApplyContext<E: AppEvent> {
    session: SessionId,
    index: u64,
    time: u64,
    pub(crate) events: Vec<E>,
}

impl<E: AppEvent> ApplyContext<E> {
    /// Create a context directly, e.g. for unit-testing a state machine
    /// outside a running server.
    pub fn new(session: SessionId, index: u64, time: u64) -> Self {
        Self {
            session,
            index,
            time,
            events: Vec::new(),
        }
    }

    /// The events published so far, most useful in state machine tests.
    pub fn published(&self) -> &[E] {
        &self.events
    }

    /// The session on whose behalf the command is applied.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The log index of the command being applied.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The deterministic state-machine time, in milliseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Publish an event to the command's session.
    ///
    /// Events published while applying the entry at index `I` form a batch
    /// with `event_index = I` and are retained until the client acknowledges
    /// them by index.
    pub fn publish(&mut self, event: E) {
        self.events.push(event);
    }
}

/// The response channel attached to a committed entry, resolved by the
/// worker once the entry is applied.
pub(crate) enum Responder<R: AppDataResponse> {
    Command(RaftRespTx<CommandResponse<R>, ClientError>),
    OpenSession(RaftRespTx<OpenSessionResponse, ClientError>),
    CloseSession(RaftRespTx<CloseSessionResponse, ClientError>),
    KeepAlive(RaftRespTx<KeepAliveResponse, ClientError>),
    Metadata(RaftRespTx<MetadataResponse, ClientError>),
}

/// A command posted from the protocol context to the worker.
pub(crate) enum SmCommand<D: AppData, R: AppDataResponse> {
    /// Apply committed entries up to the given index, resolving the attached
    /// responders as their entries apply.
    Apply {
        upto: u64,
        responders: BTreeMap<u64, Responder<R>>,
    },
    /// Execute or park a client query.
    Query {
        rpc: QueryRequest<D>,
        tx: RaftRespTx<QueryResponse<R>, ClientError>,
    },
    /// Acknowledge events up to an index and resend the remainder.
    Reset {
        rpc: ResetRequest,
        tx: RaftRespTx<(), ClientError>,
    },
    /// The server gained or lost leadership; only the leader transmits
    /// session events.
    LeaderChange { is_leader: bool },
    /// Install a complete snapshot received from the leader, replacing all
    /// state.
    InstallSnapshot { snapshot: Snapshot },
    /// Build and persist a snapshot of the current state.
    BuildSnapshot { configuration: Configuration },
}

/// A notification posted back to the protocol context.
pub(crate) enum Notification {
    /// The state machine has applied up to `last_applied`.
    Applied { last_applied: LogId, sessions: u64 },
    /// A snapshot has been persisted; the log prefix may be compacted.
    SnapshotDone { meta: SnapshotMeta },
    /// A spawned task observed a higher term in a response.
    HigherTerm { term: u64 },
    /// The state machine hit a fatal storage error.
    Fatal(String),
}

/// A handle to the spawned worker.
pub(crate) struct SmHandle<D: AppData, R: AppDataResponse> {
    pub(crate) cmd_tx: mpsc::UnboundedSender<SmCommand<D, R>>,
    #[allow(dead_code)]
    pub(crate) join_handle: JoinHandle<()>,
}

impl<D: AppData, R: AppDataResponse> SmHandle<D, R> {
    pub(crate) fn send(&self, cmd: SmCommand<D, R>) {
        let _ = self.cmd_tx.send(cmd);
    }
}
