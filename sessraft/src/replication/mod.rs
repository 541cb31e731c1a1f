//! Per-member replication.
//!
//! The leader runs one appender task per active or passive member, which
//! batches log entries, backtracks to discover the match point, and switches
//! to snapshot installation when the member has fallen behind the log's
//! compacted prefix. Reserve members, which receive only configuration, get
//! a lightweight configurer task instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::FuturesOrdered;
use futures::FutureExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::membership::Configuration;
use crate::raft::AppendRequest;
use crate::raft::AppendResponse;
use crate::raft::ConfigureRequest;
use crate::raft::InstallRequest;
use crate::raft_types::LogId;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppEvent;
use crate::MemberId;
use crate::RaftNetwork;

/// The maximum number of entries read from the log per batch-building pass.
/// Batches are bounded in bytes by config; this merely caps one read.
const READ_WINDOW: u64 = 64;

/// The public handle to a spawned appender.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the appender task.
    pub repl_tx: mpsc::UnboundedSender<ReplicationEvent<D>>,
}

/// An event from the protocol context to an appender.
pub(crate) enum ReplicationEvent<D: AppData> {
    /// A new entry was appended to the leader's log and needs replication.
    Replicate {
        last_log_index: u64,
        commit_index: u64,
    },
    /// The commit index advanced.
    UpdateCommitIndex { commit_index: u64 },
    Terminate(std::marker::PhantomData<D>),
}

/// An event from an appender or configurer back to the protocol context.
pub(crate) enum ReplicaEvent {
    /// The target acknowledged replication up to `matched`.
    UpdateMatched { target: MemberId, matched: LogId },
    /// A reserve member acknowledged the configuration with the given
    /// logical time.
    Configured { target: MemberId, config_time: u64 },
    /// A response carried a higher term; the leader must step down.
    RevertToFollower { target: MemberId, term: u64 },
    /// The target needs a snapshot but none is available; the leader should
    /// trigger a snapshot build.
    NeedsSnapshot { target: MemberId },
    /// The appender hit a fatal storage error.
    Shutdown,
}

#[derive(Debug, Eq, PartialEq)]
enum TargetReplState {
    /// Replicating entries from the log.
    LineRate,
    /// Streaming a snapshot to the target.
    Snapshotting,
    Shutdown,
}

/// The identity of one in-flight append request.
struct InflightAppend {
    /// The last entry carried by the request, `None` for a heartbeat.
    last_log_id: Option<LogId>,
}

type AppendFuture = Pin<Box<dyn Future<Output = (InflightAppend, anyhow::Result<AppendResponse>)> + Send + 'static>>;

/// A task replicating the leader's log to a single target member.
pub(crate) struct ReplicationCore<D, E, N, S>
where
    D: AppData,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
{
    /// The ID of this server.
    id: MemberId,
    /// The member replication is sent to.
    target: MemberId,
    /// The leader's term; the appender never outlives it.
    term: u64,

    network: Arc<N>,
    storage: Arc<S>,
    config: Arc<Config>,

    core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    repl_rx: mpsc::UnboundedReceiver<ReplicationEvent<D>>,

    target_state: TargetReplState,

    /// The index of the last entry in the leader's log.
    last_log_index: u64,
    /// The leader's commit index.
    commit_index: u64,
    /// The last log ID known replicated on the target.
    matched: LogId,
    /// The next index the sequential log reader will read from. Runs ahead of
    /// `matched` while requests are pipelined.
    next_read: u64,
    /// Consecutive transport failures to the target. While non-zero, only
    /// heartbeats are sent.
    failure_count: u64,

    /// The configuration in effect when this appender was spawned, delivered
    /// to the target up front so a freshly promoted learner knows its role
    /// before the first entries arrive.
    configuration: Configuration,

    heartbeat: Interval,
    install_snapshot_timeout: Duration,

    marker_e: std::marker::PhantomData<E>,
}

impl<D, E, N, S> ReplicationCore<D, E, N, S>
where
    D: AppData,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
{
    /// Spawn an appender for the target member.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: MemberId,
        target: MemberId,
        term: u64,
        config: Arc<Config>,
        configuration: Configuration,
        last_log_id: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat = interval(Duration::from_millis(config.heartbeat_interval));
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            core_tx,
            repl_rx,
            target_state: TargetReplState::LineRate,
            last_log_index: last_log_id.index,
            commit_index,
            // Optimistically assume the target matches the leader; the first
            // rejection backtracks to the true match point.
            matched: last_log_id,
            next_read: last_log_id.index + 1,
            failure_count: 0,
            configuration,
            heartbeat,
            install_snapshot_timeout,
            marker_e: std::marker::PhantomData,
        };
        let span = tracing::debug_span!("appender", id, target, term);
        tokio::spawn(this.main().instrument(span));
        ReplicationStream { repl_tx }
    }

    async fn main(mut self) {
        // Deliver the operative configuration up front: a member which was
        // just promoted into the replication path learns its new role from
        // this, not from an entry it cannot yet accept.
        let configure = ConfigureRequest {
            term: self.term,
            leader: self.id,
            configuration: self.configuration.clone(),
        };
        if let Err(err) = self.network.configure(self.target, configure).await {
            tracing::trace!(target = self.target, error=%err, "initial configure failed");
        }

        // An initial heartbeat announces the new leader immediately.
        self.send_heartbeat().await;

        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Snapshotting => self.replicate_snapshot().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    fn set_target_state(&mut self, state: TargetReplState) {
        self.target_state = state;
    }

    fn has_more_entries(&self) -> bool {
        self.next_read <= self.last_log_index
    }

    /// Replicate entries at line rate, pipelining up to the configured number
    /// of in-flight appends.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    async fn line_rate_loop(&mut self) {
        let mut inflight: FuturesOrdered<AppendFuture> = FuturesOrdered::new();

        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // Fill the pipeline. A member with outstanding failures receives
            // heartbeats only, until one succeeds.
            while self.failure_count == 0
                && self.has_more_entries()
                && (inflight.len() as u64) < self.config.max_inflight_appends
            {
                match self.build_append_request().await {
                    Ok(Some(request)) => {
                        let sent = InflightAppend {
                            last_log_id: request.entries.last().map(|e| e.log_id),
                        };
                        inflight.push_back(self.start_append(request, sent));
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(error=%err, "storage error while building append request");
                        self.set_target_state(TargetReplState::Shutdown);
                        let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                        return;
                    }
                }
            }
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            tokio::select! {
                _ = self.heartbeat.tick(), if inflight.is_empty() => {
                    self.send_heartbeat().await;
                }
                Some((sent, res)) = inflight.next() => {
                    let reset = self.handle_append_result(sent, res).await;
                    if reset {
                        // The pipeline is built on a match point which turned
                        // out to be wrong; outstanding requests are moot.
                        inflight = FuturesOrdered::new();
                    }
                }
                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => self.drain_events(event),
                        None => self.set_target_state(TargetReplState::Shutdown),
                    }
                }
            }
        }
    }

    /// Build the next append request from the log, bounded by
    /// `max_batch_bytes`. A single entry larger than the batch limit is sent
    /// alone.
    ///
    /// Returns `None` after scheduling a state change, e.g. when the next
    /// index has been compacted away and replication must switch to snapshot
    /// installation.
    async fn build_append_request(&mut self) -> anyhow::Result<Option<AppendRequest<D>>> {
        let prev_log_id = match self.log_id_at(self.next_read - 1).await? {
            Some(log_id) => log_id,
            None => {
                // The previous entry is gone from the log, so the prefix has
                // been compacted into a snapshot.
                self.set_target_state(TargetReplState::Snapshotting);
                return Ok(None);
            }
        };

        let window_end = std::cmp::min(self.last_log_index, self.next_read + READ_WINDOW - 1) + 1;
        let raw = self.storage.get_log_entries(self.next_read..window_end).await?;

        if raw.first().map(|e| e.log_id.index) != Some(self.next_read) {
            // The expected entry is absent: compacted away while we were
            // reading. Switch to snapshot replication.
            self.set_target_state(TargetReplState::Snapshotting);
            return Ok(None);
        }

        let mut entries = Vec::new();
        let mut size = 0u64;
        for entry in raw {
            let entry_size = entry.size_hint();
            if !entries.is_empty() && size + entry_size > self.config.max_batch_bytes {
                break;
            }
            size += entry_size;
            entries.push(entry);
            if size >= self.config.max_batch_bytes {
                break;
            }
        }

        self.next_read = entries.last().map(|e| e.log_id.index).unwrap_or(self.next_read - 1) + 1;

        Ok(Some(AppendRequest {
            term: self.term,
            leader: self.id,
            prev_log_id,
            entries,
            commit_index: self.commit_index,
        }))
    }

    /// The log ID at `index`, consulting the snapshot metadata for the entry
    /// just below a compacted prefix. `None` when the index is compacted and
    /// unknown.
    async fn log_id_at(&self, index: u64) -> anyhow::Result<Option<LogId>> {
        if index == 0 {
            return Ok(Some(LogId::default()));
        }
        if let Some(entry) = self.storage.try_get_log_entry(index).await? {
            return Ok(Some(entry.log_id));
        }
        if let Some(meta) = self.storage.current_snapshot_meta().await? {
            if meta.last_log_id.index == index {
                return Ok(Some(meta.last_log_id));
            }
        }
        Ok(None)
    }

    fn start_append(&self, request: AppendRequest<D>, sent: InflightAppend) -> AppendFuture {
        let network = self.network.clone();
        let target = self.target;
        let ttl = Duration::from_millis(self.config.heartbeat_interval);
        async move {
            let res = match timeout(ttl, network.append_entries(target, request)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow::anyhow!("timeout while sending append request")),
            };
            (sent, res)
        }
        .boxed()
    }

    /// Send an empty append as heartbeat and process its response inline.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_heartbeat(&mut self) {
        let request = AppendRequest {
            term: self.term,
            leader: self.id,
            prev_log_id: self.matched,
            entries: Vec::new(),
            commit_index: self.commit_index,
        };
        let ttl = Duration::from_millis(self.config.heartbeat_interval);
        let res = match timeout(ttl, self.network.append_entries(self.target, request)).await {
            Ok(res) => res,
            Err(_) => Err(anyhow::anyhow!("timeout while sending heartbeat")),
        };
        self.handle_append_result(InflightAppend { last_log_id: None }, res).await;
    }

    /// Process one append response. Returns true when the pipeline must be
    /// rebuilt from a corrected match point.
    async fn handle_append_result(&mut self, sent: InflightAppend, res: anyhow::Result<AppendResponse>) -> bool {
        let response = match res {
            Ok(response) => response,
            Err(err) => {
                self.fail_attempt(&err.to_string());
                self.next_read = self.matched.index + 1;
                return true;
            }
        };

        // A newer term demotes the leader; this appender is then moot.
        if response.term > self.term {
            tracing::debug!(response.term, "higher term observed in append response");
            let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: response.term,
            });
            self.set_target_state(TargetReplState::Shutdown);
            return true;
        }

        if response.succeeded {
            self.succeed_attempt();
            if let Some(last) = sent.last_log_id {
                self.matched = last;
            }
            // Matched is reported even when unchanged: the leader derives its
            // quorum-contact lease from these acknowledgments.
            self.update_matched();
            return false;
        }

        // Rejected on log matching: adopt the follower-supplied hint and
        // reset the reader.
        self.succeed_attempt();
        let hint = std::cmp::min(response.last_log_index, self.last_log_index);
        if hint == 0 {
            self.matched = LogId::default();
        } else {
            match self.storage.try_get_log_entry(hint).await {
                Ok(Some(entry)) => {
                    self.matched = entry.log_id;
                }
                Ok(None) => {
                    // The hinted index is behind the compacted prefix.
                    self.set_target_state(TargetReplState::Snapshotting);
                    return true;
                }
                Err(err) => {
                    tracing::error!(error=%err, "storage error while resolving append conflict");
                    self.set_target_state(TargetReplState::Shutdown);
                    let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                    return true;
                }
            }
        }
        tracing::debug!(target = self.target, matched = %self.matched, "reset match point from follower hint");
        self.next_read = self.matched.index + 1;
        self.update_matched();
        true
    }

    fn update_matched(&mut self) {
        let _ = self.core_tx.send(ReplicaEvent::UpdateMatched {
            target: self.target,
            matched: self.matched,
        });
    }

    fn succeed_attempt(&mut self) {
        if self.failure_count > 0 {
            tracing::info!(target = self.target, "member is available again");
            self.failure_count = 0;
        }
    }

    /// Account a transport failure. The first three failures are logged,
    /// thereafter every 100th, to keep a down member from flooding the log.
    fn fail_attempt(&mut self, error: &str) {
        self.failure_count += 1;
        if self.failure_count <= 3 || self.failure_count % 100 == 0 {
            tracing::warn!(
                target = self.target,
                failures = self.failure_count,
                "append to member failed: {}",
                error
            );
        }
    }

    /// Fully drain the channel coming in from the protocol context.
    fn drain_events(&mut self, first: ReplicationEvent<D>) {
        let mut event_opt = Some(first);
        loop {
            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            match event {
                ReplicationEvent::Replicate {
                    last_log_index,
                    commit_index,
                } => {
                    self.last_log_index = last_log_index;
                    self.commit_index = commit_index;
                }
                ReplicationEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                ReplicationEvent::Terminate(_) => {
                    self.set_target_state(TargetReplState::Shutdown);
                    return;
                }
            }
            if let Some(event) = self.repl_rx.recv().now_or_never() {
                event_opt = event;
                if event_opt.is_none() {
                    self.set_target_state(TargetReplState::Shutdown);
                    return;
                }
            }
        }
    }

    /// Stream the current snapshot to the target, then return to line rate.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    async fn replicate_snapshot(&mut self) {
        loop {
            if self.target_state != TargetReplState::Snapshotting {
                return;
            }

            let snapshot = match self.storage.current_snapshot().await {
                Ok(Some(snapshot)) if snapshot.meta.last_log_id.index >= self.next_read => Some(snapshot),
                Ok(_) => None,
                Err(err) => {
                    tracing::error!(error=%err, "storage error while reading snapshot");
                    self.set_target_state(TargetReplState::Shutdown);
                    let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                    return;
                }
            };

            match snapshot {
                Some(snapshot) => {
                    if self.stream_snapshot(snapshot).await {
                        return;
                    }
                    // Failed mid-stream; restart from offset 0 after the next
                    // heartbeat interval.
                }
                None => {
                    // No usable snapshot yet; ask the leader loop to build
                    // one and keep the member warm meanwhile.
                    let _ = self.core_tx.send(ReplicaEvent::NeedsSnapshot { target: self.target });
                }
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {}
                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => self.drain_events(event),
                        None => self.set_target_state(TargetReplState::Shutdown),
                    }
                }
            }
        }
    }

    /// Send the snapshot in chunks. Returns true when fully installed; false
    /// restarts the transfer from offset 0.
    async fn stream_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let total = snapshot.data.len() as u64;
        let chunk_size = self.config.snapshot_chunk_bytes;
        let mut offset = 0u64;

        loop {
            let end = std::cmp::min(offset + chunk_size, total);
            let done = end == total;
            let request = InstallRequest {
                term: self.term,
                leader: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data: snapshot.data[offset as usize..end as usize].to_vec(),
                done,
            };
            tracing::debug!(offset, total, done, "sending snapshot chunk");

            let res = match timeout(
                self.install_snapshot_timeout,
                self.network.install_snapshot(self.target, request),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(anyhow::anyhow!("timeout while sending snapshot chunk")),
            };

            let response = match res {
                Ok(response) => response,
                Err(err) => {
                    // The next attempt restarts from offset 0.
                    self.fail_attempt(&err.to_string());
                    return false;
                }
            };

            if response.term > self.term {
                let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: response.term,
                });
                self.set_target_state(TargetReplState::Shutdown);
                return true;
            }

            self.succeed_attempt();

            if done {
                if snapshot.meta.last_log_id > self.matched {
                    self.matched = snapshot.meta.last_log_id;
                    self.update_matched();
                }
                self.next_read = self.matched.index + 1;
                self.set_target_state(TargetReplState::LineRate);
                tracing::debug!(matched = %self.matched, "snapshot installed on target");
                return true;
            }

            offset = end;

            // Stay current with the leader loop between chunks.
            if let Some(Some(event)) = self.repl_rx.recv().now_or_never() {
                self.drain_events(event);
                if self.target_state != TargetReplState::Snapshotting {
                    return true;
                }
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The public handle to a spawned configurer.
pub(crate) struct ConfigurerStream {
    pub conf_tx: mpsc::UnboundedSender<ConfigurerEvent>,
}

/// An event from the protocol context to a configurer.
pub(crate) enum ConfigurerEvent {
    /// The configuration changed and must be redelivered.
    Configure(Configuration),
    Terminate,
}

/// A task keeping one reserve member supplied with the current configuration.
///
/// Reserve members receive neither entries nor snapshots; the configurer's
/// periodic configure requests double as their heartbeat.
pub(crate) struct ConfigurerCore<D, E, N>
where
    D: AppData,
    E: AppEvent,
    N: RaftNetwork<D, E>,
{
    id: MemberId,
    target: MemberId,
    term: u64,
    network: Arc<N>,
    core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    conf_rx: mpsc::UnboundedReceiver<ConfigurerEvent>,
    heartbeat: Interval,
    configuration: Configuration,
    /// The configuration time last acknowledged by the target.
    acked_time: Option<u64>,
    marker_d: std::marker::PhantomData<D>,
    marker_e: std::marker::PhantomData<E>,
}

impl<D, E, N> ConfigurerCore<D, E, N>
where
    D: AppData,
    E: AppEvent,
    N: RaftNetwork<D, E>,
{
    pub(crate) fn spawn(
        id: MemberId,
        target: MemberId,
        term: u64,
        config: Arc<Config>,
        configuration: Configuration,
        network: Arc<N>,
        core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> ConfigurerStream {
        let (conf_tx, conf_rx) = mpsc::unbounded_channel();
        let heartbeat = interval(Duration::from_millis(config.heartbeat_interval));
        let this = Self {
            id,
            target,
            term,
            network,
            core_tx,
            conf_rx,
            heartbeat,
            configuration,
            acked_time: None,
            marker_d: std::marker::PhantomData,
            marker_e: std::marker::PhantomData,
        };
        let span = tracing::debug_span!("configurer", id, target, term);
        tokio::spawn(this.main().instrument(span));
        ConfigurerStream { conf_tx }
    }

    async fn main(mut self) {
        loop {
            tokio::select! {
                _ = self.heartbeat.tick() => {
                    if !self.send_configure().await {
                        return;
                    }
                }
                event = self.conf_rx.recv() => {
                    match event {
                        Some(ConfigurerEvent::Configure(configuration)) => {
                            self.configuration = configuration;
                        }
                        Some(ConfigurerEvent::Terminate) | None => return,
                    }
                }
            }
        }
    }

    /// Deliver the current configuration. Returns false when the task must
    /// stop.
    async fn send_configure(&mut self) -> bool {
        let request = ConfigureRequest {
            term: self.term,
            leader: self.id,
            configuration: self.configuration.clone(),
        };
        match self.network.configure(self.target, request).await {
            Ok(response) => {
                if response.term > self.term {
                    let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                        target: self.target,
                        term: response.term,
                    });
                    return false;
                }
                if self.acked_time != Some(self.configuration.time) {
                    self.acked_time = Some(self.configuration.time);
                    let _ = self.core_tx.send(ReplicaEvent::Configured {
                        target: self.target,
                        config_time: self.configuration.time,
                    });
                }
                true
            }
            Err(err) => {
                tracing::trace!(target = self.target, error=%err, "configure request failed");
                true
            }
        }
    }
}
