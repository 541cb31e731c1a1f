//! The core logic of a server: the protocol execution context.
//!
//! `RaftCore` owns the server-wide volatile state and delegates control to
//! one role loop at a time. All role transitions and all mutations of
//! protocol state happen on this single task; the state-machine context and
//! the per-member appenders communicate with it exclusively through
//! channels.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::ClientError;
use crate::error::InitializeError;
use crate::error::MembershipError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Configuration;
use crate::membership::MemberRole;
use crate::metrics::RaftMetrics;
use crate::raft::Consistency;
use crate::raft::PollResponse;
use crate::raft::RaftMsg;
use crate::raft::VoteResponse;
use crate::raft_types::LogId;
use crate::replication::ConfigurerStream;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationEvent;
use crate::replication::ReplicationStream;
use crate::sm::worker::Worker;
use crate::sm::Notification;
use crate::sm::Responder;
use crate::sm::SmCommand;
use crate::sm::SmHandle;
use crate::sm::StateMachine;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::MemberId;
use crate::RaftNetwork;

/// The milliseconds-since-epoch wall clock used to stamp entries at the
/// leader. Only the leader reads it; every other server derives time from
/// entry timestamps.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// All possible roles of a server.
///
/// The member's declared role in the configuration decides its base state:
/// active members are followers (and may campaign), passive members
/// replicate without voting, reserve members receive configuration only, and
/// anything else is inactive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The server takes no part in the protocol.
    Inactive,
    /// The server receives configuration and heartbeats only.
    Reserve,
    /// The server replicates entries but neither votes nor campaigns.
    Passive,
    /// The server replicates entries from the leader and votes.
    Follower,
    /// The server is campaigning for leadership.
    Candidate,
    /// The server is the cluster leader.
    Leader,
    /// The server is shutting down.
    Shutdown,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }
}

/// An enum describing the way the current leader property is to be updated.
pub(crate) enum UpdateCurrentLeader {
    ThisNode,
    OtherNode(MemberId),
    Unknown,
}

/// Follower-side state for a snapshot being streamed in from the leader.
pub(crate) struct SnapshotStreamState {
    pub id: String,
    pub index: u64,
    pub offset: u64,
    pub buffer: Vec<u8>,
}

/// The core type implementing the protocol.
pub(crate) struct RaftCore<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    /// This server's ID.
    pub(crate) id: MemberId,
    pub(crate) config: Arc<Config>,
    /// The latest configuration this server has seen, committed or not.
    pub(crate) configuration: Configuration,
    pub(crate) network: Arc<N>,
    pub(crate) storage: Arc<S>,

    /// The role the current loop hands control to when it observes a change.
    pub(crate) target_role: Role,

    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<MemberId>,
    pub(crate) current_leader: Option<MemberId>,
    /// The highest index known committed. Starts at 0 on boot; only a
    /// leader's replication rounds re-establish it.
    pub(crate) commit_index: u64,
    /// The index of the latest configuration known committed and persisted.
    pub(crate) committed_config_index: u64,
    pub(crate) last_log_id: LogId,

    /// Mirror of the state-machine context's applied index, via
    /// notifications.
    pub(crate) last_applied: u64,
    pub(crate) session_count: u64,
    /// The index covered by the current snapshot.
    pub(crate) snapshot_index: u64,
    /// True while the state-machine context is building a snapshot.
    pub(crate) snapshot_building: bool,
    /// Streaming state for a snapshot arriving from the leader.
    pub(crate) snapshot_stream: Option<SnapshotStreamState>,

    /// Handle to the state-machine execution context.
    pub(crate) sm: SmHandle<D, R>,
    /// The highest commit index already handed to the state-machine context.
    pub(crate) last_apply_sent: u64,
    pub(crate) tx_notify: mpsc::UnboundedSender<Notification>,
    pub(crate) rx_notify: mpsc::UnboundedReceiver<Notification>,

    /// The last time a valid heartbeat was received from a leader.
    pub(crate) last_heartbeat: Option<Instant>,
    /// The deadline of the follower's randomized heartbeat timer.
    pub(crate) next_election_timeout: Option<Instant>,

    pub(crate) rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    pub(crate) tx_metrics: watch::Sender<RaftMetrics>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,

    marker_m: std::marker::PhantomData<M>,
    marker_e: std::marker::PhantomData<E>,
}

impl<D, R, E, N, S, M> RaftCore<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: MemberId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        state_machine: M,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_notify, rx_notify) = mpsc::unbounded_channel();
        let sm = Worker::spawn(
            id,
            state_machine,
            storage.clone(),
            network.clone(),
            config.clone(),
            tx_notify.clone(),
        );
        let this = Self {
            id,
            config,
            configuration: Configuration::new_initial(id),
            network,
            storage,
            target_role: Role::Inactive,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            committed_config_index: 0,
            last_log_id: LogId::default(),
            last_applied: 0,
            session_count: 0,
            snapshot_index: 0,
            snapshot_building: false,
            snapshot_stream: None,
            sm,
            last_apply_sent: 0,
            tx_notify,
            rx_notify,
            last_heartbeat: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
            marker_m: std::marker::PhantomData,
            marker_e: std::marker::PhantomData,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("raft-core", id)))
    }

    /// The main loop of the protocol context.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("server is initializing");
        let state = self
            .storage
            .get_initial_state(self.id)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.configuration = state.configuration;
        self.committed_config_index = self.configuration.index;
        // The commit index is never persisted; it is re-established by the
        // next leader's replication rounds.
        self.commit_index = 0;

        if let Some(meta) = &state.snapshot {
            self.snapshot_index = meta.last_log_id.index;
            // Rehydrate the state machine and session registry before any
            // entries are applied.
            match self.storage.current_snapshot().await {
                Ok(Some(snapshot)) => self.sm.send(SmCommand::InstallSnapshot { snapshot }),
                Ok(None) => {}
                Err(err) => return Err(self.map_fatal_storage_error(err)),
            }
        }

        // A pristine server stays inactive until it is initialized or joined
        // into a cluster; anything else assumes the base role its membership
        // dictates.
        if self.last_log_id.index == 0 && self.current_term == 0 {
            self.target_role = Role::Inactive;
        } else {
            self.target_role = self.base_role();
        }

        loop {
            match &self.target_role {
                Role::Leader => LeaderState::new(&mut self).run().await?,
                Role::Candidate => CandidateState::new(&mut self).run().await?,
                Role::Follower => FollowerState::new(&mut self).run().await?,
                Role::Passive => PassiveState::new(&mut self).run().await?,
                Role::Reserve => ReserveState::new(&mut self).run().await?,
                Role::Inactive => InactiveState::new(&mut self).run().await?,
                Role::Shutdown => {
                    tracing::info!("server has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// The coarse role dictated by this member's declared role in the
    /// current configuration.
    pub(crate) fn base_role(&self) -> Role {
        match self.configuration.role_of(self.id) {
            MemberRole::Active => Role::Follower,
            MemberRole::Passive => Role::Passive,
            MemberRole::Reserve => Role::Reserve,
            MemberRole::Inactive => Role::Inactive,
        }
    }

    /// Update the target role, ensuring the new role is legal for this
    /// member's declared role.
    pub(crate) fn set_target_role(&mut self, target: Role) {
        if target == Role::Follower {
            self.target_role = self.base_role();
        } else {
            self.target_role = target;
        }
    }

    /// Report a metrics payload on the current state of the server.
    pub(crate) fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            role: self.target_role,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            configuration: self.configuration.clone(),
            session_count: self.session_count,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id = self.id, "error reporting metrics");
        }
    }

    /// Save the server's current hard state to the metadata store.
    ///
    /// Must complete before the action the state covers is externalized.
    pub(crate) async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = crate::storage::HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage
            .save_hard_state(&hs)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Adopt a higher term, clearing the vote. A lower or equal term is a
    /// no-op.
    pub(crate) fn update_current_term(&mut self, new_term: u64, voted_for: Option<MemberId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Update the value of the `current_leader` property.
    pub(crate) fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                // Only members of the configuration can be leaders.
                if self.configuration.contains(target) {
                    self.current_leader = Some(target);
                }
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Get the next election timeout, generating a new value if unset.
    pub(crate) fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Re-arm the randomized heartbeat timer. If `heartbeat` is true, also
    /// record the contact for vote/poll suppression.
    pub(crate) fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Whether a leader has been heard from within the election timeout.
    pub(crate) fn leader_recently_seen(&self) -> bool {
        match &self.last_heartbeat {
            Some(inst) => (inst.elapsed().as_millis() as u64) < self.config.election_timeout,
            None => false,
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage error.
    pub(crate) fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error=%err, id = self.id, "fatal storage error, shutting down");
        self.set_target_role(Role::Shutdown);
        RaftError::Storage(err)
    }

    /// Adopt a configuration newer than the current one, adjusting this
    /// member's role if its declared role changed.
    pub(crate) fn update_configuration(&mut self, config: Configuration) {
        if !config.is_newer_than(&self.configuration) {
            return;
        }
        tracing::debug!(config = %crate::summary::MessageSummary::summary(&config), "adopting configuration");
        self.configuration = config;

        // A sitting leader defers any demotion until the change commits.
        if self.target_role == Role::Leader {
            return;
        }

        let base = self.base_role();
        let compatible = match (base, self.target_role) {
            // An active member may be in any of the voting roles.
            (Role::Follower, Role::Follower | Role::Candidate) => true,
            (base, current) => base == current,
        };
        if !compatible {
            self.set_target_role(base);
        }
    }

    /// Advance the commit index monotonically, persisting a configuration
    /// whose entry the new commit index crossed.
    pub(crate) async fn advance_commit_index(&mut self, new_commit: u64) -> RaftResult<()> {
        let new_commit = std::cmp::min(new_commit, self.last_log_id.index);
        if new_commit <= self.commit_index {
            return Ok(());
        }
        self.commit_index = new_commit;

        if self.configuration.index != 0
            && self.configuration.index <= self.commit_index
            && self.configuration.index > self.committed_config_index
        {
            let config = self.configuration.clone();
            self.storage
                .save_configuration(&config)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.committed_config_index = config.index;
        }
        Ok(())
    }

    /// Hand newly committed entries to the state-machine context, attaching
    /// any response channels collected for them.
    pub(crate) fn drive_state_machine(&mut self, responders: BTreeMap<u64, Responder<R>>) {
        if self.commit_index > self.last_apply_sent || !responders.is_empty() {
            self.last_apply_sent = std::cmp::max(self.last_apply_sent, self.commit_index);
            self.sm.send(SmCommand::Apply {
                upto: self.commit_index,
                responders,
            });
        }
    }

    /// Handle a notification posted by the state-machine context or by a
    /// spawned confirmation task.
    pub(crate) async fn handle_notification(&mut self, notification: Notification) -> RaftResult<()> {
        match notification {
            Notification::Applied { last_applied, sessions } => {
                self.last_applied = last_applied.index;
                self.session_count = sessions;
                self.maybe_trigger_snapshot(false);
                self.report_metrics();
            }
            Notification::SnapshotDone { meta } => {
                self.snapshot_building = false;
                if meta.last_log_id.index > self.snapshot_index {
                    self.snapshot_index = meta.last_log_id.index;
                    self.storage
                        .purge_log(meta.last_log_id.index)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    tracing::debug!(through = meta.last_log_id.index, "compacted log prefix");
                }
            }
            Notification::HigherTerm { term } => {
                if term > self.current_term {
                    self.update_current_term(term, None);
                    self.save_hard_state().await?;
                    self.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.set_target_role(Role::Follower);
                    self.report_metrics();
                }
            }
            Notification::Fatal(msg) => {
                return Err(self.map_fatal_storage_error(anyhow::anyhow!(msg)));
            }
        }
        Ok(())
    }

    /// Ask the state-machine context for a snapshot when the applied log has
    /// outgrown the policy threshold, or unconditionally when forced by a
    /// lagging follower.
    pub(crate) fn maybe_trigger_snapshot(&mut self, force: bool) {
        if self.snapshot_building || self.last_applied == 0 {
            return;
        }
        let since_last = self.last_applied.saturating_sub(self.snapshot_index);
        if !force && since_last < self.config.snapshot_threshold() {
            return;
        }
        if since_last == 0 {
            return;
        }
        self.snapshot_building = true;
        self.sm.send(SmCommand::BuildSnapshot {
            configuration: self.configuration.clone(),
        });
    }

    /// Route a query per its consistency mode on a non-leader server.
    pub(crate) fn handle_query_as_non_leader(
        &mut self,
        rpc: crate::raft::QueryRequest<D>,
        tx: crate::raft::RaftRespTx<crate::raft::QueryResponse<R>, ClientError>,
    ) {
        match rpc.consistency {
            Consistency::Eventual => self.sm.send(SmCommand::Query { rpc, tx }),
            Consistency::Strict | Consistency::Lease => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
        }
    }

    /// Shared handling for every message a non-leader, entry-receiving role
    /// (follower, candidate, passive) can serve. `voter` gates real vote and
    /// poll participation.
    pub(crate) async fn handle_msg_as_non_leader(&mut self, msg: RaftMsg<D, R>, voter: bool) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries(rpc).await);
            }
            RaftMsg::Vote { rpc, tx } => {
                if voter {
                    let _ = tx.send(self.handle_vote_request(rpc).await);
                } else {
                    let _ = tx.send(Ok(VoteResponse {
                        term: self.current_term,
                        voted: false,
                    }));
                }
            }
            RaftMsg::Poll { rpc, tx } => {
                if voter {
                    let _ = tx.send(self.handle_poll_request(rpc).await);
                } else {
                    let _ = tx.send(Ok(PollResponse {
                        term: self.current_term,
                        accepted: false,
                    }));
                }
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.handle_install_snapshot(rpc).await);
            }
            RaftMsg::Configure { rpc, tx } => {
                let _ = tx.send(self.handle_configure(rpc).await);
            }
            RaftMsg::OpenSession { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::CloseSession { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::KeepAlive { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Command { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Query { rpc, tx } => self.handle_query_as_non_leader(rpc, tx),
            RaftMsg::Metadata { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Reset { rpc, tx } => self.sm.send(SmCommand::Reset { rpc, tx }),
            RaftMsg::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
            }
            RaftMsg::Join { tx, .. } => {
                let _ = tx.send(Err(MembershipError::NotLeader(self.current_leader)));
            }
            RaftMsg::Leave { tx, .. } => {
                let _ = tx.send(Err(MembershipError::NotLeader(self.current_leader)));
            }
            RaftMsg::Reconfigure { tx, .. } => {
                let _ = tx.send(Err(MembershipError::NotLeader(self.current_leader)));
            }
        }
        Ok(())
    }

    /// Shared handling for roles outside the replication path (reserve,
    /// inactive): configuration and lifecycle messages only.
    pub(crate) async fn handle_msg_as_lifecycle(&mut self, msg: RaftMsg<D, R>, allow_initialize: bool) -> RaftResult<()> {
        match msg {
            RaftMsg::Configure { rpc, tx } => {
                let _ = tx.send(self.handle_configure(rpc).await);
            }
            RaftMsg::Initialize { members, tx } => {
                if allow_initialize {
                    let _ = tx.send(self.handle_initialize(members).await);
                } else {
                    let _ = tx.send(Err(InitializeError::NotAllowed));
                }
            }
            RaftMsg::AppendEntries { tx, .. } => {
                let _ = tx.send(Err(RaftError::IllegalMemberState));
            }
            RaftMsg::Vote { tx, .. } => {
                let _ = tx.send(Err(RaftError::IllegalMemberState));
            }
            RaftMsg::Poll { tx, .. } => {
                let _ = tx.send(Err(RaftError::IllegalMemberState));
            }
            RaftMsg::InstallSnapshot { tx, .. } => {
                let _ = tx.send(Err(RaftError::IllegalMemberState));
            }
            RaftMsg::OpenSession { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::CloseSession { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::KeepAlive { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Command { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Query { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Metadata { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Reset { tx, .. } => {
                let _ = tx.send(Err(ClientError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Join { tx, .. } => {
                let _ = tx.send(Err(MembershipError::NotLeader(self.current_leader)));
            }
            RaftMsg::Leave { tx, .. } => {
                let _ = tx.send(Err(MembershipError::NotLeader(self.current_leader)));
            }
            RaftMsg::Reconfigure { tx, .. } => {
                let _ = tx.send(Err(MembershipError::NotLeader(self.current_leader)));
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the leader.
pub(crate) struct LeaderState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    pub(super) core: &'a mut RaftCore<D, R, E, N, S, M>,
    /// Appender state per entry-receiving member.
    pub(super) nodes: BTreeMap<MemberId, ReplicationState<D>>,
    /// Configurer state per reserve member.
    pub(super) configurers: BTreeMap<MemberId, ConfigurerStream>,

    /// The stream of events coming from appenders and configurers.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,

    /// Responders for appended entries awaiting commitment, in index order.
    pub(super) awaiting: Vec<AwaitingEntry<R>>,
    /// The single permitted uncommitted configuration change.
    pub(super) pending_config: Option<PendingConfigChange>,
    /// Members working through the reserve → passive → active ladder.
    pub(super) joining: BTreeSet<MemberId>,
    /// Reserve members which have acknowledged the current configuration.
    pub(super) configured: BTreeSet<MemberId>,
    /// The last acknowledgment instant per member, for the leader's
    /// quorum-contact lease.
    pub(super) last_ack: BTreeMap<MemberId, Instant>,
    /// When this server became leader; members without an acknowledgment yet
    /// are measured against this instant.
    pub(super) started: Instant,
}

/// A struct tracking the state of an appender from the leader's perspective.
pub(crate) struct ReplicationState<D: AppData> {
    pub matched: LogId,
    /// When set, terminate the appender once the member has replicated up to
    /// this index; used for members removed from the configuration.
    pub remove_after_commit: Option<u64>,
    pub repl: ReplicationStream<D>,
}

/// A responder for an appended entry, resolved once the entry commits.
pub(crate) struct AwaitingEntry<R: AppDataResponse> {
    pub index: u64,
    pub responder: Responder<R>,
}

/// The leader's record of an uncommitted configuration entry.
pub(crate) struct PendingConfigChange {
    pub index: u64,
    pub tx: Option<crate::raft::RaftRespTx<crate::raft::MembershipResponse, MembershipError>>,
}

impl<'a, D, R, E, N, S, M> LeaderState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    pub(self) fn new(core: &'a mut RaftCore<D, R, E, N, S, M>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            configurers: BTreeMap::new(),
            replication_rx,
            replication_tx,
            awaiting: Vec::new(),
            pending_config: None,
            joining: BTreeSet::new(),
            configured: BTreeSet::new(),
            last_ack: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication to every entry-receiving member and configurers
        // for every reserve member.
        for target in self.core.configuration.replication_targets(self.core.id) {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }
        for target in self.core.configuration.reserve_ids(self.core.id) {
            let stream = self.spawn_configurer(target);
            self.configurers.insert(target, stream);
        }

        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.sm.send(SmCommand::LeaderChange { is_leader: true });
        self.core.report_metrics();

        // Commit an initial entry to establish this term's commit proof
        // before accepting client writes.
        self.commit_initial_leader_entry().await?;

        let mut lease_check = tokio::time::interval(Duration::from_millis(self.core.config.heartbeat_interval));

        loop {
            if !self.core.target_role.is_leader() {
                self.terminate_replication();
                self.core.sm.send(SmCommand::LeaderChange { is_leader: false });
                self.fail_awaiting();
                return Ok(());
            }

            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => {
                    self.handle_msg(msg).await?;
                }
                Some(event) = self.replication_rx.recv() => {
                    self.handle_replica_event(event).await?;
                }
                Some(notification) = self.core.rx_notify.recv() => {
                    self.core.handle_notification(notification).await?;
                }
                _ = lease_check.tick() => {
                    self.check_leader_lease();
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }

    /// Dispatch one API message in the leader role.
    async fn handle_msg(&mut self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_entries(rpc).await);
            }
            RaftMsg::Vote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc).await);
            }
            RaftMsg::Poll { rpc, tx } => {
                let _ = tx.send(self.core.handle_poll_request(rpc).await);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.core.handle_install_snapshot(rpc).await);
            }
            RaftMsg::Configure { rpc, tx } => {
                let _ = tx.send(self.core.handle_configure(rpc).await);
            }
            RaftMsg::OpenSession { rpc, tx } => self.handle_open_session(rpc, tx).await,
            RaftMsg::CloseSession { rpc, tx } => self.handle_close_session(rpc, tx).await,
            RaftMsg::KeepAlive { rpc, tx } => self.handle_keep_alive(rpc, tx).await,
            RaftMsg::Command { rpc, tx } => self.handle_client_command(rpc, tx).await,
            RaftMsg::Query { rpc, tx } => self.handle_client_query(rpc, tx).await,
            RaftMsg::Metadata { rpc, tx } => self.handle_metadata(rpc, tx).await,
            RaftMsg::Reset { rpc, tx } => self.core.sm.send(SmCommand::Reset { rpc, tx }),
            RaftMsg::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
            }
            RaftMsg::Join { member, tx } => self.handle_join(member, tx).await,
            RaftMsg::Leave { member, tx } => self.handle_leave(member, tx).await,
            RaftMsg::Reconfigure { members, tx } => self.handle_reconfigure(members, tx).await,
        }
        Ok(())
    }

    /// Step down when a quorum of active members has not acknowledged within
    /// the lease timeout.
    fn check_leader_lease(&mut self) {
        let lease = Duration::from_millis(self.core.config.leader_lease_timeout);
        let active = self.core.configuration.active_ids();
        if active.len() <= 1 {
            return;
        }
        let now = Instant::now();
        // The leader always counts itself; members which have not yet
        // acknowledged anything are measured from the start of the term.
        let mut fresh = 1usize;
        for id in &active {
            if *id == self.core.id {
                continue;
            }
            let at = self.last_ack.get(id).copied().unwrap_or(self.started);
            if now.duration_since(at) < lease {
                fresh += 1;
            }
        }
        if fresh < crate::quorum::majority_of(active.len()) {
            tracing::warn!("leader lost contact with a quorum, stepping down");
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
        }
    }

    /// Whether a majority of active members acknowledged within the election
    /// timeout; the basis for lease reads.
    pub(super) fn has_lease_quorum(&self) -> bool {
        let active = self.core.configuration.active_ids();
        if active.len() <= 1 {
            return true;
        }
        let bound = Duration::from_millis(self.core.config.election_timeout);
        let now = Instant::now();
        let mut fresh = 1usize;
        for id in &active {
            if *id == self.core.id {
                continue;
            }
            // A member with no acknowledgment yet counts while the term is
            // younger than the bound: the election itself was a quorum
            // contact.
            let at = self.last_ack.get(id).copied().unwrap_or(self.started);
            if now.duration_since(at) < bound {
                fresh += 1;
            }
        }
        fresh >= crate::quorum::majority_of(active.len())
    }

    /// Terminate all appenders and configurers.
    fn terminate_replication(&mut self) {
        for node in self.nodes.values() {
            let _ = node.repl.repl_tx.send(ReplicationEvent::<D>::Terminate(std::marker::PhantomData));
        }
        for configurer in self.configurers.values() {
            let _ = configurer.conf_tx.send(crate::replication::ConfigurerEvent::Terminate);
        }
    }

    /// Fail every request still waiting on commitment; the client retries
    /// against the next leader.
    fn fail_awaiting(&mut self) {
        for entry in self.awaiting.drain(..) {
            match entry.responder {
                Responder::Command(tx) => {
                    let _ = tx.send(Err(ClientError::ForwardToLeader(None)));
                }
                Responder::OpenSession(tx) => {
                    let _ = tx.send(Err(ClientError::ForwardToLeader(None)));
                }
                Responder::CloseSession(tx) => {
                    let _ = tx.send(Err(ClientError::ForwardToLeader(None)));
                }
                Responder::KeepAlive(tx) => {
                    let _ = tx.send(Err(ClientError::ForwardToLeader(None)));
                }
                Responder::Metadata(tx) => {
                    let _ = tx.send(Err(ClientError::ForwardToLeader(None)));
                }
            }
        }
        if let Some(pending) = self.pending_config.take() {
            if let Some(tx) = pending.tx {
                let _ = tx.send(Err(MembershipError::NotLeader(None)));
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a candidate.
pub(crate) struct CandidateState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    core: &'a mut RaftCore<D, R, E, N, S, M>,
    /// Votes granted so far, including our own.
    pub(super) votes_granted: usize,
    /// Votes needed for a majority of active members.
    pub(super) votes_needed: usize,
}

impl<'a, D, R, E, N, S, M> CandidateState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    pub(self) fn new(core: &'a mut RaftCore<D, R, E, N, S, M>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop. Each iteration of the outer loop represents a
    /// new term.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_role.is_candidate() {
                return Ok(());
            }

            // Setup a new term: advance, vote for ourselves, persist.
            self.votes_granted = 1;
            self.votes_needed = self.core.configuration.quorum();
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            tracing::debug!(term = self.core.current_term, "campaigning for leadership");
            self.core.report_metrics();

            if self.votes_granted >= self.votes_needed {
                // Single active member: win immediately.
                self.core.set_target_role(Role::Leader);
                continue;
            }

            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this term.
            loop {
                if !self.core.target_role.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                tokio::select! {
                    // The election timed out; start over with a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => {
                        self.handle_vote_response(res, peer).await?;
                        if self.core.target_role.is_leader() || !self.core.target_role.is_candidate() {
                            break;
                        }
                    }
                    Some(msg) = self.core.rx_api.recv() => {
                        self.core.handle_msg_as_non_leader(msg, true).await?;
                    }
                    Some(notification) = self.core.rx_notify.recv() => {
                        self.core.handle_notification(notification).await?;
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_role(Role::Shutdown);
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a follower.
pub(crate) struct FollowerState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    core: &'a mut RaftCore<D, R, E, N, S, M>,
    /// State of an in-progress pre-vote round, if any.
    poll: Option<PollTally>,
}

/// The follower's running tally of one pre-vote round.
pub(super) struct PollTally {
    pub accepted: usize,
    pub rejected: usize,
    pub needed: usize,
    pub total: usize,
    pub rx: mpsc::Receiver<(PollResponse, MemberId)>,
}

impl<'a, D, R, E, N, S, M> FollowerState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    pub(self) fn new(core: &'a mut RaftCore<D, R, E, N, S, M>) -> Self {
        Self { core, poll: None }
    }

    /// Run the follower loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_role.is_follower() {
                return Ok(());
            }

            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                // The heartbeat timer expired: clear the leader hint and
                // poll the cluster before campaigning.
                _ = election_timeout => {
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.update_next_election_timeout(false);
                    self.start_poll_round();
                }
                Some((res, peer)) = poll_recv(&mut self.poll) => {
                    self.handle_poll_response(res, peer).await?;
                }
                Some(msg) = self.core.rx_api.recv() => {
                    self.core.handle_msg_as_non_leader(msg, true).await?;
                }
                Some(notification) = self.core.rx_notify.recv() => {
                    self.core.handle_notification(notification).await?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}

/// Await the next poll response if a poll round is running; pends forever
/// otherwise so the select arm stays quiet.
async fn poll_recv(poll: &mut Option<PollTally>) -> Option<(PollResponse, MemberId)> {
    match poll {
        Some(tally) => tally.rx.recv().await,
        None => std::future::pending().await,
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a passive member: replicates entries, never
/// votes, never campaigns.
pub(crate) struct PassiveState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    core: &'a mut RaftCore<D, R, E, N, S, M>,
}

impl<'a, D, R, E, N, S, M> PassiveState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    pub(self) fn new(core: &'a mut RaftCore<D, R, E, N, S, M>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "passive"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if self.core.target_role != Role::Passive {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => {
                    self.core.handle_msg_as_non_leader(msg, false).await?;
                }
                Some(notification) = self.core.rx_notify.recv() => {
                    self.core.handle_notification(notification).await?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a reserve member: configuration and lifecycle
/// messages only.
pub(crate) struct ReserveState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    core: &'a mut RaftCore<D, R, E, N, S, M>,
}

impl<'a, D, R, E, N, S, M> ReserveState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    pub(self) fn new(core: &'a mut RaftCore<D, R, E, N, S, M>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "reserve"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if self.core.target_role != Role::Reserve {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => {
                    self.core.handle_msg_as_lifecycle(msg, false).await?;
                }
                Some(notification) = self.core.rx_notify.recv() => {
                    self.core.handle_notification(notification).await?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state of an inactive server: a placeholder which can only be
/// initialized or configured into the cluster.
pub(crate) struct InactiveState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    core: &'a mut RaftCore<D, R, E, N, S, M>,
}

impl<'a, D, R, E, N, S, M> InactiveState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    pub(self) fn new(core: &'a mut RaftCore<D, R, E, N, S, M>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "inactive"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if self.core.target_role != Role::Inactive {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => {
                    self.core.handle_msg_as_lifecycle(msg, true).await?;
                }
                Some(notification) = self.core.rx_notify.recv() => {
                    self.core.handle_notification(notification).await?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}
