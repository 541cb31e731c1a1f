//! The state-machine worker task.
//!
//! The worker is the single owner of the application state machine and the
//! session registry. It consumes commands posted by the protocol context,
//! applies committed entries in index order, and resolves the response
//! channels attached to them. Session expiration is driven purely by the
//! timestamps carried in entries, so every server expires the same sessions
//! at the same log positions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::ClientError;
use crate::error::RaftError;
use crate::membership::Configuration;
use crate::raft::CloseSessionResponse;
use crate::raft::CommandResponse;
use crate::raft::KeepAliveResponse;
use crate::raft::MetadataResponse;
use crate::raft::OpenSessionResponse;
use crate::raft::PublishRequest;
use crate::raft::QueryRequest;
use crate::raft::QueryResponse;
use crate::raft::RaftRespTx;
use crate::raft::ResetRequest;
use crate::raft::SessionMetadata;
use crate::raft_types::LogId;
use crate::sm::session::EventBatch;
use crate::sm::session::ParkedQuery;
use crate::sm::session::Session;
use crate::sm::session::SessionSnapshot;
use crate::sm::session::SessionState;
use crate::sm::ApplyContext;
use crate::sm::Notification;
use crate::sm::Responder;
use crate::sm::SmCommand;
use crate::sm::SmHandle;
use crate::sm::StateMachine;
use crate::storage::CommandEntry;
use crate::storage::EntryPayload;
use crate::storage::KeepAliveEntry;
use crate::storage::LogEntry;
use crate::storage::OpenSessionEntry;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::summary::MessageSummary;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::MemberId;
use crate::RaftNetwork;
use crate::SessionId;

/// The serialized form of a snapshot: the engine's session registry together
/// with the application's own image.
#[derive(Serialize, Deserialize)]
#[serde(bound = "R: AppDataResponse, E: AppEvent")]
struct SnapshotData<R: AppDataResponse, E: AppEvent> {
    last_applied: LogId,
    time: u64,
    sessions: Vec<SessionSnapshot<R, E>>,
    app: Vec<u8>,
}

pub(crate) struct Worker<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    id: MemberId,
    state_machine: M,
    /// The state machine's registered name; sessions must bind to it.
    sm_kind: String,
    storage: Arc<S>,
    network: Arc<N>,
    config: Arc<Config>,

    cmd_rx: mpsc::UnboundedReceiver<SmCommand<D, R>>,
    notify_tx: mpsc::UnboundedSender<Notification>,

    sessions: BTreeMap<SessionId, Session<D, R, E>>,
    last_applied: LogId,
    /// The deterministic state-machine clock, advanced by entry timestamps.
    time: u64,
    /// Only the leader transmits session events; other servers retain them
    /// silently for correctness on failover.
    is_leader: bool,
}

impl<D, R, E, N, S, M> Worker<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    /// Spawn the worker, returning its command handle.
    pub(crate) fn spawn(
        id: MemberId,
        state_machine: M,
        storage: Arc<S>,
        network: Arc<N>,
        config: Arc<Config>,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> SmHandle<D, R> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let sm_kind = state_machine.kind();
        let worker = Self {
            id,
            state_machine,
            sm_kind,
            storage,
            network,
            config,
            cmd_rx,
            notify_tx,
            sessions: BTreeMap::new(),
            last_applied: LogId::default(),
            time: 0,
            is_leader: false,
        };
        let span = tracing::debug_span!("sm-worker", id);
        let join_handle = tokio::spawn(worker.main().instrument(span));
        SmHandle { cmd_tx, join_handle }
    }

    async fn main(mut self) {
        loop {
            let cmd = match self.cmd_rx.recv().await {
                Some(cmd) => cmd,
                None => {
                    tracing::debug!("command channel closed, state machine worker stopping");
                    return;
                }
            };
            match cmd {
                SmCommand::Apply { upto, responders } => self.apply_upto(upto, responders).await,
                SmCommand::Query { rpc, tx } => self.handle_query(rpc, tx).await,
                SmCommand::Reset { rpc, tx } => self.handle_reset(rpc, tx),
                SmCommand::LeaderChange { is_leader } => self.is_leader = is_leader,
                SmCommand::InstallSnapshot { snapshot } => self.install_snapshot(snapshot).await,
                SmCommand::BuildSnapshot { configuration } => self.build_snapshot(configuration).await,
            }
        }
    }

    /// Apply committed entries up to `upto`, resolving attached responders.
    #[tracing::instrument(level = "trace", skip(self, responders))]
    async fn apply_upto(&mut self, upto: u64, mut responders: BTreeMap<u64, Responder<R>>) {
        let since = self.last_applied.index + 1;
        if upto < since {
            return;
        }
        let entries = match self.storage.get_log_entries(since..upto + 1).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "failed reading log entries for application");
                let _ = self.notify_tx.send(Notification::Fatal(err.to_string()));
                return;
            }
        };
        tracing::trace!(entries = %entries.as_slice().summary(), "applying entries");
        for entry in entries {
            let responder = responders.remove(&entry.log_id.index);
            self.apply_entry(&entry, responder).await;
        }
        self.notify_applied();
    }

    async fn apply_entry(&mut self, entry: &LogEntry<D>, responder: Option<Responder<R>>) {
        let index = entry.log_id.index;
        let timestamp = entry.timestamp();
        if timestamp > self.time {
            self.time = timestamp;
        }
        self.expire_stale_sessions().await;

        match &entry.payload {
            EntryPayload::Initialize { .. } | EntryPayload::Configuration(_) => {}
            EntryPayload::OpenSession(open) => self.apply_open_session(index, open, responder).await,
            EntryPayload::CloseSession(close) => self.apply_close_session(close.session, responder).await,
            EntryPayload::KeepAlive(ka) => self.apply_keep_alive(ka, responder),
            EntryPayload::Command(cmd) => self.apply_command(index, cmd, responder).await,
            EntryPayload::Metadata(_) => self.apply_metadata(responder),
        }

        self.last_applied = entry.log_id;

        // Every open session observes the applied index; this releases
        // queries parked on the index gate.
        let mut ready = Vec::new();
        for session in self.sessions.values_mut() {
            let id = session.id;
            ready.extend(session.set_last_applied(index).into_iter().map(move |q| (id, q)));
        }
        for (_, query) in ready {
            self.run_query(query.data, query.tx).await;
        }
    }

    async fn apply_open_session(&mut self, index: u64, open: &OpenSessionEntry, responder: Option<Responder<R>>) {
        if open.kind != self.sm_kind {
            tracing::warn!(session = index, kind = %open.kind, "open-session names an unknown state machine");
            if let Some(Responder::OpenSession(tx)) = responder {
                let _ = tx.send(Err(ClientError::Raft(RaftError::UnknownStateMachine(open.kind.clone()))));
            }
            return;
        }
        let timeout = if open.timeout == 0 { self.config.session_timeout } else { open.timeout };
        let session = Session::new(index, open.member, open.name.clone(), open.kind.clone(), timeout, self.time);
        self.sessions.insert(index, session);
        self.state_machine.session_opened(index).await;
        tracing::debug!(session = index, member = open.member, "session opened");
        if let Some(Responder::OpenSession(tx)) = responder {
            let _ = tx.send(Ok(OpenSessionResponse { session: index, timeout }));
        }
    }

    async fn apply_close_session(&mut self, id: SessionId, responder: Option<Responder<R>>) {
        match self.sessions.remove(&id) {
            Some(mut session) => {
                session.state = SessionState::Closed;
                self.state_machine.session_closed(id).await;
                for query in session.drain_queries() {
                    let _ = query.tx.send(Err(ClientError::Raft(RaftError::UnknownSession(id))));
                }
                tracing::debug!(session = id, "session closed");
                if let Some(Responder::CloseSession(tx)) = responder {
                    let _ = tx.send(Ok(CloseSessionResponse { session: id }));
                }
            }
            None => {
                if let Some(Responder::CloseSession(tx)) = responder {
                    let _ = tx.send(Err(ClientError::Raft(RaftError::UnknownSession(id))));
                }
            }
        }
    }

    fn apply_keep_alive(&mut self, ka: &KeepAliveEntry, responder: Option<Responder<R>>) {
        let time = self.time;
        match self.sessions.get_mut(&ka.session) {
            Some(session) => {
                session.set_timestamp(time);
                session.clear_results(ka.command_ack);
                session.clear_events(ka.event_ack);
                if let Some(Responder::KeepAlive(tx)) = responder {
                    let _ = tx.send(Ok(KeepAliveResponse { session: ka.session }));
                }
            }
            None => {
                if let Some(Responder::KeepAlive(tx)) = responder {
                    let _ = tx.send(Err(ClientError::Raft(RaftError::UnknownSession(ka.session))));
                }
            }
        }
    }

    async fn apply_command(&mut self, index: u64, cmd: &CommandEntry<D>, responder: Option<Responder<R>>) {
        let time = self.time;

        // Sequence check first: a duplicate returns the original result
        // without re-invoking the state machine.
        match self.sessions.get_mut(&cmd.session) {
            None => {
                if let Some(Responder::Command(tx)) = responder {
                    let _ = tx.send(Err(ClientError::Raft(RaftError::UnknownSession(cmd.session))));
                }
                return;
            }
            Some(session) => {
                if cmd.sequence <= session.command_sequence {
                    if let Some(Responder::Command(tx)) = responder {
                        let res = match session.get_result(cmd.sequence) {
                            Some(cached) => match &cached.result {
                                Ok(data) => Ok(CommandResponse {
                                    index: cached.index,
                                    data: data.clone(),
                                }),
                                Err(msg) => Err(ClientError::Raft(RaftError::ApplicationError(msg.clone()))),
                            },
                            None => Err(ClientError::Raft(RaftError::CommandFailure(
                                "the result for this sequence is no longer cached".to_string(),
                            ))),
                        };
                        let _ = tx.send(res);
                    }
                    return;
                }
                session.set_timestamp(time);
            }
        }

        let mut ctx = ApplyContext::new(cmd.session, index, time);
        let result = self.state_machine.apply(index, &cmd.data, &mut ctx).await;

        let mut outbound = None;
        let mut drained = Vec::new();
        if let Some(session) = self.sessions.get_mut(&cmd.session) {
            for event in ctx.events {
                session.publish(index, event);
            }
            if let Some(batch) = session.commit_events(index) {
                outbound = Some((session.member, session.complete_index, batch));
            }
            session.register_result(cmd.sequence, index, result.clone());
            drained = session.set_command_sequence(cmd.sequence);
        }
        if let Some((member, complete_index, batch)) = outbound {
            self.send_events(cmd.session, member, complete_index, batch);
        }

        if let Some(Responder::Command(tx)) = responder {
            let res = match result {
                Ok(data) => Ok(CommandResponse { index, data }),
                Err(msg) => Err(ClientError::Raft(RaftError::ApplicationError(msg))),
            };
            let _ = tx.send(res);
        }

        for query in drained {
            self.dispatch_parked(cmd.session, query).await;
        }
    }

    fn apply_metadata(&mut self, responder: Option<Responder<R>>) {
        if let Some(Responder::Metadata(tx)) = responder {
            let sessions = self
                .sessions
                .values()
                .filter(|s| s.state == SessionState::Open)
                .map(|s| SessionMetadata {
                    session: s.id,
                    name: s.name.clone(),
                    kind: s.kind.clone(),
                })
                .collect();
            let _ = tx.send(Ok(MetadataResponse { sessions }));
        }
    }

    /// Expire sessions whose timeout elapsed as of the state-machine clock.
    ///
    /// Runs before every applied entry, so expiration is a deterministic
    /// function of the log.
    async fn expire_stale_sessions(&mut self) {
        let now = self.time;
        let stale: Vec<SessionId> = self.sessions.values().filter(|s| s.is_stale(now)).map(|s| s.id).collect();
        for id in stale {
            if let Some(mut session) = self.sessions.remove(&id) {
                session.state = SessionState::Expired;
                self.state_machine.session_expired(id).await;
                session.state = SessionState::Closed;
                self.state_machine.session_closed(id).await;
                for query in session.drain_queries() {
                    let _ = query.tx.send(Err(ClientError::Raft(RaftError::UnknownSession(id))));
                }
                tracing::debug!(session = id, "session expired");
            }
        }
    }

    /// Execute a query or park it on the session's sequence/index gates.
    async fn handle_query(&mut self, rpc: QueryRequest<D>, tx: RaftRespTx<QueryResponse<R>, ClientError>) {
        match self.sessions.get_mut(&rpc.session) {
            None => {
                let _ = tx.send(Err(ClientError::Raft(RaftError::UnknownSession(rpc.session))));
            }
            Some(session) => {
                if rpc.min_sequence > session.command_sequence {
                    session.register_sequence_query(rpc.min_sequence, ParkedQuery {
                        data: rpc.data,
                        min_index: rpc.min_index,
                        tx,
                    });
                } else if rpc.min_index > session.last_applied {
                    session.register_index_query(rpc.min_index, ParkedQuery {
                        data: rpc.data,
                        min_index: rpc.min_index,
                        tx,
                    });
                } else {
                    self.run_query(rpc.data, tx).await;
                }
            }
        }
    }

    /// Re-check a query released from the sequence gate against the index
    /// gate, then run it.
    async fn dispatch_parked(&mut self, session_id: SessionId, query: ParkedQuery<D, R>) {
        match self.sessions.get_mut(&session_id) {
            Some(session) if query.min_index > session.last_applied => {
                session.register_index_query(query.min_index, query);
            }
            Some(_) => {
                self.run_query(query.data, query.tx).await;
            }
            None => {
                let _ = query.tx.send(Err(ClientError::Raft(RaftError::UnknownSession(session_id))));
            }
        }
    }

    async fn run_query(&mut self, data: D, tx: RaftRespTx<QueryResponse<R>, ClientError>) {
        let res = match self.state_machine.query(&data).await {
            Ok(data) => Ok(QueryResponse {
                index: self.last_applied.index,
                data,
            }),
            Err(msg) => Err(ClientError::Raft(RaftError::QueryFailure(msg))),
        };
        let _ = tx.send(res);
    }

    /// Discard event batches acknowledged by the client and retransmit the
    /// remainder.
    fn handle_reset(&mut self, rpc: ResetRequest, tx: RaftRespTx<(), ClientError>) {
        match self.sessions.get_mut(&rpc.session) {
            None => {
                let _ = tx.send(Err(ClientError::Raft(RaftError::UnknownSession(rpc.session))));
            }
            Some(session) => {
                let member = session.member;
                let complete_index = session.complete_index;
                let batches = session.resend_events(rpc.index);
                for batch in batches {
                    self.send_events(rpc.session, member, complete_index, batch);
                }
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Transmit an event batch to the session's member of origin.
    ///
    /// Non-leaders retain batches silently; the registry state is identical
    /// on every server, so a new leader can resend after failover.
    fn send_events(&self, session: SessionId, member: MemberId, complete_index: u64, batch: EventBatch<E>) {
        if !self.is_leader {
            return;
        }
        let rpc = PublishRequest {
            session,
            event_index: batch.event_index,
            previous_index: std::cmp::max(batch.previous_index, complete_index),
            events: batch.events,
        };
        let network = self.network.clone();
        let id = self.id;
        tokio::spawn(
            async move {
                if let Err(err) = network.publish(member, rpc).await {
                    tracing::warn!(error=%err, target=member, "failed to publish session events");
                }
            }
            .instrument(tracing::trace_span!("publish", id, session)),
        );
    }

    /// Replace all state from a complete snapshot.
    async fn install_snapshot(&mut self, snapshot: Snapshot) {
        if snapshot.meta.last_log_id.index <= self.last_applied.index && self.last_applied.index > 0 {
            tracing::debug!(snapshot=%snapshot.meta.last_log_id, "ignoring snapshot older than applied state");
            return;
        }
        let data: SnapshotData<R, E> = match serde_json::from_slice(&snapshot.data) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(error=%err, "failed decoding snapshot");
                let _ = self.notify_tx.send(Notification::Fatal(err.to_string()));
                return;
            }
        };
        if let Err(err) = self.state_machine.restore(&data.app).await {
            tracing::error!(error=%err, "state machine failed to restore snapshot");
            let _ = self.notify_tx.send(Notification::Fatal(err.to_string()));
            return;
        }
        self.sessions = data.sessions.into_iter().map(|s| (s.id, Session::from_snapshot(s))).collect();
        self.time = data.time;
        self.last_applied = data.last_applied;
        tracing::info!(last_applied=%self.last_applied, sessions = self.sessions.len(), "installed snapshot");
        self.notify_applied();
    }

    /// Build and persist a snapshot of the current state.
    async fn build_snapshot(&mut self, configuration: Configuration) {
        if self.last_applied.index == 0 {
            return;
        }
        let app = match self.state_machine.snapshot().await {
            Ok(app) => app,
            Err(err) => {
                tracing::error!(error=%err, "state machine failed to build snapshot");
                return;
            }
        };
        let data = SnapshotData::<R, E> {
            last_applied: self.last_applied,
            time: self.time,
            sessions: self.sessions.values().map(|s| s.to_snapshot()).collect(),
            app,
        };
        let bytes = match serde_json::to_vec(&data) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error=%err, "failed encoding snapshot");
                return;
            }
        };
        let meta = SnapshotMeta {
            id: format!("{}-{}", self.last_applied.term, self.last_applied.index),
            last_log_id: self.last_applied,
            configuration,
        };
        if let Err(err) = self
            .storage
            .save_snapshot(Snapshot {
                meta: meta.clone(),
                data: bytes,
            })
            .await
        {
            tracing::error!(error=%err, "failed persisting snapshot");
            let _ = self.notify_tx.send(Notification::Fatal(err.to_string()));
            return;
        }
        tracing::info!(snapshot=%meta.last_log_id, "snapshot persisted");
        let _ = self.notify_tx.send(Notification::SnapshotDone { meta });
    }

    fn notify_applied(&self) {
        let _ = self.notify_tx.send(Notification::Applied {
            last_applied: self.last_applied,
            sessions: self.sessions.len() as u64,
        });
    }
}
