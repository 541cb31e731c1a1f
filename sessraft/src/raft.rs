//! Public server interface and wire message types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ClientError;
use crate::error::InitializeError;
use crate::error::MembershipError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Configuration;
use crate::membership::Member;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::raft_types::LogId;
use crate::sm::StateMachine;
use crate::storage::LogEntry;
use crate::storage::RaftStorage;
use crate::storage::SnapshotMeta;
use crate::summary::MessageSummary;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::MemberId;
use crate::RaftNetwork;
use crate::SessionId;

struct RaftInner<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    id: MemberId,
    tx_api: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_e: std::marker::PhantomData<E>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
    marker_m: std::marker::PhantomData<M>,
}

/// The API to a running server.
///
/// This type spawns the server's protocol and state-machine execution
/// contexts and is the handle through which transports deliver peer messages
/// and through which applications submit client operations.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
pub struct Raft<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    inner: Arc<RaftInner<D, R, E, N, S, M>>,
}

impl<D, R, E, N, S, M> Raft<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    /// Create and spawn a new server.
    ///
    /// The `id` must be stable across restarts. `network` is the transport to
    /// peers, `storage` the durable metadata/log/snapshot store, and
    /// `state_machine` the application state machine replicated by the
    /// cluster.
    #[tracing::instrument(level = "debug", skip(config, network, storage, state_machine), fields(cluster=%config.cluster_name))]
    pub fn new(id: MemberId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>, state_machine: M) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, state_machine, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            id,
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_e: std::marker::PhantomData,
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
            marker_m: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// The ID of this server.
    pub fn id(&self) -> MemberId {
        self.inner.id
    }

    /// Submit an append request to this server.
    ///
    /// Sent by the cluster leader to replicate log entries, and as heartbeat.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendRequest<D>) -> Result<AppendResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a vote request to this server.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Vote { rpc, tx }, rx).await
    }

    /// Submit a pre-vote poll to this server.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn poll(&self, rpc: PollRequest) -> Result<PollResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Poll { rpc, tx }, rx).await
    }

    /// Submit a snapshot chunk to this server.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot=%rpc.meta.last_log_id, offset=rpc.offset, done=rpc.done))]
    pub async fn install_snapshot(&self, rpc: InstallRequest) -> Result<InstallResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Submit a configuration update to this server.
    ///
    /// Sent by the leader to reserve members, which do not receive log
    /// entries and learn configuration changes through this channel instead.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(config=%rpc.configuration.summary()))]
    pub async fn configure(&self, rpc: ConfigureRequest) -> Result<ConfigureResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Configure { rpc, tx }, rx).await
    }

    /// Open a new client session.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn open_session(&self, rpc: OpenSessionRequest) -> Result<OpenSessionResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::OpenSession { rpc, tx }, rx).await
    }

    /// Keep a client session alive, acknowledging received results and
    /// events.
    #[tracing::instrument(level = "debug", skip(self), fields(session=rpc.session))]
    pub async fn keep_alive(&self, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::KeepAlive { rpc, tx }, rx).await
    }

    /// Close a client session.
    #[tracing::instrument(level = "debug", skip(self), fields(session=rpc.session))]
    pub async fn close_session(&self, rpc: CloseSessionRequest) -> Result<CloseSessionResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::CloseSession { rpc, tx }, rx).await
    }

    /// Submit a client command.
    ///
    /// The command is appended to the log, committed to the cluster, and
    /// applied to the state machine; the state machine's response is returned.
    /// Commands carry a per-session sequence number: a retry of an already
    /// applied `(session, sequence)` returns the original cached result
    /// without re-invoking the state machine.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(session=rpc.session, sequence=rpc.sequence))]
    pub async fn command(&self, rpc: CommandRequest<D>) -> Result<CommandResponse<R>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Command { rpc, tx }, rx).await
    }

    /// Submit a client query at the requested consistency level.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(session=rpc.session, consistency=?rpc.consistency))]
    pub async fn query(&self, rpc: QueryRequest<D>) -> Result<QueryResponse<R>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Query { rpc, tx }, rx).await
    }

    /// Read the session registry at a single point in the log.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn metadata(&self, rpc: MetadataRequest) -> Result<MetadataResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Metadata { rpc, tx }, rx).await
    }

    /// Acknowledge events up to an index and request redelivery of the rest.
    #[tracing::instrument(level = "debug", skip(self), fields(session=rpc.session, index=rpc.index))]
    pub async fn reset(&self, rpc: ResetRequest) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Reset { rpc, tx }, rx).await
    }

    /// Initialize a pristine server with the given member set.
    ///
    /// This should be called on servers whose log is empty and whose term is
    /// 0. Raft guarantees that the first server to win an election propagates
    /// only its own configuration, so every member of a forming cluster may
    /// call this safely.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: impl IntoIterator<Item = Member> + std::fmt::Debug) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(
            RaftMsg::Initialize {
                members: members.into_iter().collect(),
                tx,
            },
            rx,
        )
        .await
    }

    /// Add a new member to the cluster.
    ///
    /// The member is admitted in the reserve role, receiving configuration
    /// only. The leader promotes it to passive once it has acknowledged the
    /// configuration, and to active once its log is within the configured
    /// promotion lag of the leader's.
    #[tracing::instrument(level = "debug", skip(self), fields(target=member.id))]
    pub async fn join(&self, member: Member) -> Result<MembershipResponse, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Join { member, tx }, rx).await
    }

    /// Remove a member from the cluster.
    ///
    /// If the leader removes itself it steps down after the removal commits.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn leave(&self, member: MemberId) -> Result<MembershipResponse, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Leave { member, tx }, rx).await
    }

    /// Replace the cluster's member set wholesale.
    #[tracing::instrument(level = "debug", skip(self, members))]
    pub async fn reconfigure(&self, members: impl IntoIterator<Item = Member>) -> Result<MembershipResponse, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(
            RaftMsg::Reconfigure {
                members: members.into_iter().collect(),
                tx,
            },
            rx,
        )
        .await
    }

    /// Invoke the protocol context by sending a `RaftMsg` and await the
    /// response.
    pub(crate) async fn call_core<T, Err>(&self, msg: RaftMsg<D, R>, rx: RaftRespRx<T, Err>) -> Result<T, Err>
    where Err: From<RaftError> {
        let summary = msg.summary();

        let send_res = self.inner.tx_api.send(msg);
        if let Err(err) = send_res {
            tracing::error!(%err, msg=%summary, "error sending to raft core, server is shutting down");
            return Err(RaftError::ShuttingDown.into());
        }

        match rx.await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!(%err, msg=%summary, "error receiving from raft core, server is shutting down");
                Err(RaftError::ShuttingDown.into())
            }
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// The ID of the current leader, as far as this server knows.
    pub async fn current_leader(&self) -> Option<MemberId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// Shut this server down.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D, R, E, N, S, M> Clone for Raft<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type RaftRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type RaftRespRx<T, E> = oneshot::Receiver<Result<T, E>>;

/// A message from the API into the protocol context.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendRequest<D>,
        tx: RaftRespTx<AppendResponse, RaftError>,
    },
    Vote {
        rpc: VoteRequest,
        tx: RaftRespTx<VoteResponse, RaftError>,
    },
    Poll {
        rpc: PollRequest,
        tx: RaftRespTx<PollResponse, RaftError>,
    },
    InstallSnapshot {
        rpc: InstallRequest,
        tx: RaftRespTx<InstallResponse, RaftError>,
    },
    Configure {
        rpc: ConfigureRequest,
        tx: RaftRespTx<ConfigureResponse, RaftError>,
    },
    OpenSession {
        rpc: OpenSessionRequest,
        tx: RaftRespTx<OpenSessionResponse, ClientError>,
    },
    CloseSession {
        rpc: CloseSessionRequest,
        tx: RaftRespTx<CloseSessionResponse, ClientError>,
    },
    KeepAlive {
        rpc: KeepAliveRequest,
        tx: RaftRespTx<KeepAliveResponse, ClientError>,
    },
    Command {
        rpc: CommandRequest<D>,
        tx: RaftRespTx<CommandResponse<R>, ClientError>,
    },
    Query {
        rpc: QueryRequest<D>,
        tx: RaftRespTx<QueryResponse<R>, ClientError>,
    },
    Metadata {
        rpc: MetadataRequest,
        tx: RaftRespTx<MetadataResponse, ClientError>,
    },
    Reset {
        rpc: ResetRequest,
        tx: RaftRespTx<(), ClientError>,
    },
    Initialize {
        members: Vec<Member>,
        tx: RaftRespTx<(), InitializeError>,
    },
    Join {
        member: Member,
        tx: RaftRespTx<MembershipResponse, MembershipError>,
    },
    Leave {
        member: MemberId,
        tx: RaftRespTx<MembershipResponse, MembershipError>,
    },
    Reconfigure {
        members: Vec<Member>,
        tx: RaftRespTx<MembershipResponse, MembershipError>,
    },
}

impl<D: AppData, R: AppDataResponse> MessageSummary for RaftMsg<D, R> {
    fn summary(&self) -> String {
        match self {
            RaftMsg::AppendEntries { rpc, .. } => format!("AppendEntries: {}", rpc.summary()),
            RaftMsg::Vote { rpc, .. } => format!("Vote: {:?}", rpc),
            RaftMsg::Poll { rpc, .. } => format!("Poll: {:?}", rpc),
            RaftMsg::InstallSnapshot { rpc, .. } => {
                format!("InstallSnapshot: {} offset {}", rpc.meta.last_log_id, rpc.offset)
            }
            RaftMsg::Configure { rpc, .. } => format!("Configure: {}", rpc.configuration.summary()),
            RaftMsg::OpenSession { rpc, .. } => format!("OpenSession: {:?}", rpc),
            RaftMsg::CloseSession { rpc, .. } => format!("CloseSession: {}", rpc.session),
            RaftMsg::KeepAlive { rpc, .. } => format!("KeepAlive: {}", rpc.session),
            RaftMsg::Command { rpc, .. } => format!("Command: session {} sequence {}", rpc.session, rpc.sequence),
            RaftMsg::Query { rpc, .. } => format!("Query: session {} {:?}", rpc.session, rpc.consistency),
            RaftMsg::Metadata { .. } => "Metadata".to_string(),
            RaftMsg::Reset { rpc, .. } => format!("Reset: session {} index {}", rpc.session, rpc.index),
            RaftMsg::Initialize { members, .. } => format!("Initialize: {:?}", members),
            RaftMsg::Join { member, .. } => format!("Join: {}", member.id),
            RaftMsg::Leave { member, .. } => format!("Leave: {}", member),
            RaftMsg::Reconfigure { members, .. } => format!("Reconfigure: {:?}", members),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the cluster leader to replicate log entries, and as
/// heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader: MemberId,
    /// The ID of the entry immediately preceding `entries`.
    pub prev_log_id: LogId,
    /// The new entries to store. Empty for a heartbeat.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<LogEntry<D>>,
    /// The leader's commit index.
    pub commit_index: u64,
}

impl<D: AppData> MessageSummary for AppendRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev_log_id={}, commit_index={}, entries={}",
            self.term,
            self.leader,
            self.prev_log_id,
            self.commit_index,
            self.entries.as_slice().summary()
        )
    }
}

/// The response to an `AppendRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    /// The responding member's current term.
    pub term: u64,
    /// True if the request matched the member's log and was stored.
    pub succeeded: bool,
    /// The responding member's last log index. On a failed match this is the
    /// hint from which the leader resumes backtracking.
    pub last_log_index: u64,
}

/// An RPC sent by candidates to gather votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate: MemberId,
    /// The ID of the candidate's last log entry.
    pub last_log_id: LogId,
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding member.
    pub term: u64,
    /// Whether the candidate received the member's vote.
    pub voted: bool,
}

/// A pre-vote probe sent by a follower whose heartbeat timer expired, before
/// it disrupts the cluster by starting a real election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    /// The prospective candidate's current term.
    pub term: u64,
    /// The prospective candidate's ID.
    pub candidate: MemberId,
    /// The ID of the prospective candidate's last log entry.
    pub last_log_id: LogId,
}

/// The response to a `PollRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    /// The current term of the responding member.
    pub term: u64,
    /// Whether the member would vote for the candidate in an election.
    pub accepted: bool,
}

/// An RPC sent by the leader to stream a chunk of a snapshot to a member
/// whose log is behind the leader's compacted prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader: MemberId,
    /// Metadata of the snapshot being streamed.
    pub meta: SnapshotMeta,
    /// The byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// The chunk payload.
    pub data: Vec<u8>,
    /// True if this is the last chunk.
    pub done: bool,
}

/// The response to an `InstallRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResponse {
    /// The responding member's current term.
    pub term: u64,
}

/// An RPC sent by the leader to reserve members, carrying the current
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader: MemberId,
    /// The configuration in effect.
    pub configuration: Configuration,
}

/// The response to a `ConfigureRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureResponse {
    /// The responding member's current term.
    pub term: u64,
}

/// A server push of session events to the member through which the session's
/// client is connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest<E: AppEvent> {
    pub session: SessionId,
    /// The log index at which these events were produced.
    pub event_index: u64,
    /// The index of the previous event batch on this session, for gap
    /// detection by the client.
    pub previous_index: u64,
    #[serde(bound = "E: AppEvent")]
    pub events: Vec<E>,
}

/// A client acknowledgment of events up to `index`, requesting redelivery of
/// everything after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub session: SessionId,
    pub index: u64,
}

/// A request to open a new client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    /// The member through which the client is connected.
    pub member: MemberId,
    /// A client-chosen session name.
    pub name: String,
    /// The name of the state machine the session binds to.
    pub kind: String,
    /// The requested session timeout in milliseconds; 0 selects the server
    /// default.
    pub timeout: u64,
}

/// The response to an `OpenSessionRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    /// The new session's ID: the log index of its open-session entry.
    pub session: SessionId,
    /// The granted session timeout in milliseconds.
    pub timeout: u64,
}

/// A request to keep a session alive, acknowledging results and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// Highest command sequence whose result the client has received.
    pub command_ack: u64,
    /// Highest event index the client has received.
    pub event_ack: u64,
}

/// The response to a `KeepAliveRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub session: SessionId,
}

/// A request to close a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session: SessionId,
}

/// The response to a `CloseSessionRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub session: SessionId,
}

/// A client command to be applied to the replicated state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest<D: AppData> {
    pub session: SessionId,
    /// The per-session sequence number of this command, strictly increasing.
    pub sequence: u64,
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// The response to a `CommandRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse<R: AppDataResponse> {
    /// The log index at which the command was applied.
    pub index: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

/// The consistency level of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Linearizable: only the leader answers, after confirming its
    /// leadership with a heartbeat round.
    Strict,
    /// The leader answers locally if it has heard from a majority within the
    /// election timeout. Assumes a monotonic clock; the staleness bound is
    /// the election timeout.
    Lease,
    /// Any server answers locally, gated on the session having observed
    /// the client-supplied minimum sequence and index.
    Eventual,
}

/// A client query against the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest<D: AppData> {
    pub session: SessionId,
    /// The query waits until the session has applied this command sequence.
    pub min_sequence: u64,
    /// The query waits until the state machine has applied this index.
    pub min_index: u64,
    pub consistency: Consistency,
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// The response to a `QueryRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse<R: AppDataResponse> {
    /// The state machine index at which the query executed.
    pub index: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

/// A request to read the session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub session: SessionId,
}

/// Metadata describing one registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session: SessionId,
    pub name: String,
    pub kind: String,
}

/// The response to a `MetadataRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub sessions: Vec<SessionMetadata>,
}

/// The response to a membership change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipResponse {
    /// The log ID of the configuration entry which applied the change.
    pub log_id: LogId,
    /// The configuration now in effect.
    pub configuration: Configuration,
}
