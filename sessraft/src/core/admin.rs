//! Cluster bootstrap and membership reconfiguration.

use crate::core::LeaderState;
use crate::core::PendingConfigChange;
use crate::core::RaftCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::InitializeError;
use crate::error::MembershipError;
use crate::error::RaftResult;
use crate::membership::Configuration;
use crate::membership::Member;
use crate::membership::MemberRole;
use crate::raft::ConfigureRequest;
use crate::raft::ConfigureResponse;
use crate::raft::MembershipResponse;
use crate::raft::RaftRespTx;
use crate::raft_types::LogId;
use crate::replication::ConfigurerEvent;
use crate::replication::ReplicationEvent;
use crate::sm::StateMachine;
use crate::storage::EntryPayload;
use crate::storage::LogEntry;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::MemberId;
use crate::RaftNetwork;

impl<D, R, E, N, S, M> RaftCore<D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    /// Bootstrap a pristine server with an initial member set.
    ///
    /// Only legal while the log is empty and the term is 0; a cluster in
    /// motion must be changed through the membership protocol instead. The
    /// configuration is adopted in memory only: Raft guarantees that the
    /// first leader to be elected propagates its own configuration.
    #[tracing::instrument(level = "debug", skip(self, members))]
    pub(super) async fn handle_initialize(&mut self, mut members: Vec<Member>) -> Result<(), InitializeError> {
        if self.last_log_id.index != 0 || self.current_term != 0 {
            tracing::warn!(
                { last_log_index = self.last_log_id.index, self.current_term },
                "rejecting initialize request, server is not pristine"
            );
            return Err(InitializeError::NotAllowed);
        }

        if !members.iter().any(|m| m.id == self.id) {
            members.push(Member::new(self.id, MemberRole::Active));
        }
        self.configuration = Configuration::with_members(members);

        match self.configuration.role_of(self.id) {
            MemberRole::Active => {
                if self.configuration.active_ids().len() == 1 {
                    // A lone voter elects itself without campaigning.
                    self.current_term += 1;
                    self.voted_for = Some(self.id);
                    self.save_hard_state().await.map_err(InitializeError::Raft)?;
                    self.set_target_role(Role::Leader);
                } else {
                    self.set_target_role(Role::Candidate);
                }
            }
            _ => {
                let base = self.base_role();
                self.set_target_role(base);
            }
        }
        self.report_metrics();
        Ok(())
    }

    /// A configuration update pushed by the leader.
    ///
    /// This is how reserve members, which receive no log entries, track the
    /// cluster; it is also how a joining member first learns its role.
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(term = rpc.term, leader = rpc.leader))]
    pub(super) async fn handle_configure(&mut self, rpc: ConfigureRequest) -> RaftResult<ConfigureResponse> {
        if rpc.term < self.current_term {
            return Ok(ConfigureResponse {
                term: self.current_term,
            });
        }

        self.update_next_election_timeout(true);
        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.save_hard_state().await?;
        }
        self.update_configuration(rpc.configuration.clone());
        if self.current_leader != Some(rpc.leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader));
        }

        // Members outside the replication path have no log to recover the
        // configuration from, so it is persisted here.
        if !self.configuration.role_of(self.id).receives_entries() {
            let config = self.configuration.clone();
            self.storage
                .save_configuration(&config)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
        }
        self.report_metrics();

        Ok(ConfigureResponse {
            term: self.current_term,
        })
    }
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
    /// Admit a new member into the cluster in the reserve role.
    ///
    /// The member works through the promotion ladder from there: passive
    /// once it has acknowledged the configuration, active once its log has
    /// caught up to within the configured lag of the leader's.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target = member.id))]
    pub(super) async fn handle_join(&mut self, member: Member, tx: RaftRespTx<MembershipResponse, MembershipError>) {
        if self.core.configuration.contains(member.id) {
            let _ = tx.send(Err(MembershipError::MemberExists(member.id)));
            return;
        }
        if let Some(pending) = &self.pending_config {
            let _ = tx.send(Err(MembershipError::ChangeInProgress {
                config_log_id: LogId::new(self.core.current_term, pending.index),
            }));
            return;
        }

        let mut member = member;
        member.role = MemberRole::Reserve;
        self.joining.insert(member.id);
        let config = self.core.configuration.to_added(member);
        if let Err(err) = self.append_configuration_entry(config, Some(tx)).await {
            tracing::error!(error=%err, "failed appending join configuration");
        }
    }

    /// Remove a member from the cluster.
    ///
    /// A leader removing itself steps down only after the removal commits.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_leave(&mut self, member: MemberId, tx: RaftRespTx<MembershipResponse, MembershipError>) {
        if !self.core.configuration.contains(member) {
            let _ = tx.send(Err(MembershipError::UnknownMember(member)));
            return;
        }
        if let Some(pending) = &self.pending_config {
            let _ = tx.send(Err(MembershipError::ChangeInProgress {
                config_log_id: LogId::new(self.core.current_term, pending.index),
            }));
            return;
        }

        let config = self.core.configuration.to_removed(member);
        if config.active_ids().is_empty() {
            let _ = tx.send(Err(MembershipError::EmptyConfiguration));
            return;
        }
        self.joining.remove(&member);
        self.configured.remove(&member);
        if let Err(err) = self.append_configuration_entry(config, Some(tx)).await {
            tracing::error!(error=%err, "failed appending leave configuration");
        }
    }

    /// Replace the member set wholesale.
    #[tracing::instrument(level = "debug", skip(self, members, tx))]
    pub(super) async fn handle_reconfigure(
        &mut self,
        members: Vec<Member>,
        tx: RaftRespTx<MembershipResponse, MembershipError>,
    ) {
        if let Some(pending) = &self.pending_config {
            let _ = tx.send(Err(MembershipError::ChangeInProgress {
                config_log_id: LogId::new(self.core.current_term, pending.index),
            }));
            return;
        }
        let config = self.core.configuration.to_members(members);
        if config.active_ids().is_empty() {
            let _ = tx.send(Err(MembershipError::EmptyConfiguration));
            return;
        }
        if let Err(err) = self.append_configuration_entry(config, Some(tx)).await {
            tracing::error!(error=%err, "failed appending reconfigure entry");
        }
    }

    /// Append a configuration entry and put it into effect immediately.
    ///
    /// A server always operates under the latest configuration it has seen,
    /// committed or not, so the replication pool is reshaped on append. The
    /// response channel, if any, is resolved when the entry commits; at most
    /// one such change may be uncommitted at a time.
    pub(super) async fn append_configuration_entry(
        &mut self,
        mut config: Configuration,
        tx: Option<RaftRespTx<MembershipResponse, MembershipError>>,
    ) -> RaftResult<()> {
        let index = self.core.last_log_id.index + 1;
        config.index = index;
        let entry = LogEntry {
            log_id: LogId::new(self.core.current_term, index),
            payload: EntryPayload::Configuration(config.clone()),
        };
        self.core
            .storage
            .append_to_log(&[entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = LogId::new(self.core.current_term, index);

        self.core.update_configuration(config);
        self.apply_configuration_to_pool();
        self.pending_config = Some(PendingConfigChange { index, tx });

        self.replicate_entries();
        self.update_commit_index().await?;
        self.core.report_metrics();
        Ok(())
    }

    /// Reconcile appenders and configurers with the current configuration.
    pub(super) fn apply_configuration_to_pool(&mut self) {
        let targets = self.core.configuration.replication_targets(self.core.id);
        let reserves = self.core.configuration.reserve_ids(self.core.id);
        let config_index = self.core.configuration.index;

        for target in &targets {
            if !self.nodes.contains_key(target) {
                // A promoted reserve member graduates from its configurer to
                // a full appender.
                if let Some(configurer) = self.configurers.remove(target) {
                    let _ = configurer.conf_tx.send(ConfigurerEvent::Terminate);
                }
                let state = self.spawn_replication_stream(*target);
                self.nodes.insert(*target, state);
            }
        }

        for target in &reserves {
            if !self.configurers.contains_key(target) {
                let stream = self.spawn_configurer(*target);
                self.configurers.insert(*target, stream);
            }
        }

        // Members dropped from the replication path keep their appender
        // until they have replicated the configuration which removed them.
        let mut to_remove = Vec::new();
        for (id, state) in self.nodes.iter_mut() {
            if !targets.contains(id) {
                if state.matched.index >= config_index {
                    to_remove.push(*id);
                } else {
                    state.remove_after_commit = Some(config_index);
                }
            }
        }
        for id in to_remove {
            if let Some(node) = self.nodes.remove(&id) {
                let _ = node.repl.repl_tx.send(ReplicationEvent::<D>::Terminate(std::marker::PhantomData));
            }
        }

        let stale: Vec<MemberId> = self.configurers.keys().filter(|id| !reserves.contains(id)).copied().collect();
        for id in stale {
            if let Some(configurer) = self.configurers.remove(&id) {
                let _ = configurer.conf_tx.send(ConfigurerEvent::Terminate);
            }
            self.configured.remove(&id);
        }

        let config = self.core.configuration.clone();
        for configurer in self.configurers.values() {
            let _ = configurer.conf_tx.send(ConfigurerEvent::Configure(config.clone()));
        }
    }

    /// Resolve a configuration change whose entry has committed.
    pub(super) async fn handle_config_commit(&mut self) -> RaftResult<()> {
        let pending = match self.pending_config.take() {
            Some(pending) if pending.index <= self.core.commit_index => pending,
            Some(pending) => {
                self.pending_config = Some(pending);
                return Ok(());
            }
            None => return Ok(()),
        };
        tracing::debug!(index = pending.index, "configuration change committed");

        if let Some(tx) = pending.tx {
            let _ = tx.send(Ok(MembershipResponse {
                log_id: LogId::new(self.core.current_term, pending.index),
                configuration: self.core.configuration.clone(),
            }));
        }

        // The ladder may have a next step waiting on this commit.
        self.try_promote().await?;

        // A leader which is no longer an active member steps down now that
        // the change is safely committed.
        if self.core.configuration.role_of(self.core.id) != MemberRole::Active {
            tracing::info!("leader is no longer an active member, stepping down");
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
        }
        Ok(())
    }

    /// Advance one joining member a single rung up the promotion ladder:
    /// reserve → passive once it acknowledged the configuration, passive →
    /// active once its log is within the configured lag of the leader's.
    pub(super) async fn try_promote(&mut self) -> RaftResult<()> {
        if self.pending_config.is_some() {
            return Ok(());
        }
        for id in self.joining.clone() {
            match self.core.configuration.role_of(id) {
                MemberRole::Reserve if self.configured.contains(&id) => {
                    tracing::info!(member = id, "promoting reserve member to passive");
                    let config = self.core.configuration.to_role(id, MemberRole::Passive);
                    Box::pin(self.append_configuration_entry(config, None)).await?;
                    return Ok(());
                }
                MemberRole::Passive => {
                    let matched = match self.nodes.get(&id) {
                        Some(node) => node.matched.index,
                        None => continue,
                    };
                    let lag = self.core.last_log_id.index.saturating_sub(matched);
                    if lag <= self.core.config.promotion_lag_threshold {
                        tracing::info!(member = id, lag, "promoting passive member to active");
                        self.joining.remove(&id);
                        let config = self.core.configuration.to_role(id, MemberRole::Active);
                        Box::pin(self.append_configuration_entry(config, None)).await?;
                        return Ok(());
                    }
                }
                MemberRole::Active | MemberRole::Inactive => {
                    self.joining.remove(&id);
                }
                MemberRole::Reserve => {}
            }
        }
        Ok(())
    }
}
