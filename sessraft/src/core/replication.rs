//! Leader-side replication bookkeeping: appender lifecycle, match-index
//! accounting and commit advancement.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::quorum;
use crate::raft_types::LogId;
use crate::replication::ConfigurerCore;
use crate::replication::ConfigurerStream;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationCore;
use crate::replication::ReplicationEvent;
use crate::sm::StateMachine;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::MemberId;
use crate::RaftNetwork;

impl<'a, D, R, E, N, S, M> LeaderState<'a, D, R, E, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    N: RaftNetwork<D, E>,
    S: RaftStorage<D>,
    M: StateMachine<D, R, E>,
{
    /// Spawn an appender for the target, returning its state handle.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: MemberId) -> ReplicationState<D> {
        let repl = ReplicationCore::spawn(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.configuration.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            remove_after_commit: None,
            repl,
        }
    }

    /// Spawn a configurer for a reserve member.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_configurer(&self, target: MemberId) -> ConfigurerStream {
        ConfigurerCore::<D, E, N>::spawn(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.configuration.clone(),
            self.core.network.clone(),
            self.replication_tx.clone(),
        )
    }

    /// Push the latest log/commit position to every appender.
    pub(super) fn replicate_entries(&mut self) {
        for node in self.nodes.values() {
            let _ = node.repl.repl_tx.send(ReplicationEvent::<D>::Replicate {
                last_log_index: self.core.last_log_id.index,
                commit_index: self.core.commit_index,
            });
        }
    }

    /// Handle an event coming from an appender or configurer.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatched { target, matched } => self.handle_update_matched(target, matched).await,
            ReplicaEvent::Configured { target, .. } => {
                self.last_ack.insert(target, Instant::now());
                self.configured.insert(target);
                self.try_promote().await
            }
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::NeedsSnapshot { .. } => {
                self.core.maybe_trigger_snapshot(true);
                Ok(())
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_role(Role::Shutdown);
                Ok(())
            }
        }
    }

    /// An appender observed a higher term; step down.
    async fn handle_revert_to_follower(&mut self, _: MemberId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
        }
        Ok(())
    }

    /// Record a member's acknowledged match point and drive the commit
    /// index, pending responders, removals and promotions from it.
    async fn handle_update_matched(&mut self, target: MemberId, matched: LogId) -> RaftResult<()> {
        self.last_ack.insert(target, Instant::now());

        let mut needs_removal = false;
        match self.nodes.get_mut(&target) {
            Some(state) => {
                state.matched = matched;
                if let Some(threshold) = &state.remove_after_commit {
                    if matched.index >= *threshold {
                        needs_removal = true;
                    }
                }
            }
            None => return Ok(()),
        }

        if needs_removal {
            if let Some(node) = self.nodes.remove(&target) {
                tracing::debug!(target, "removed member has replicated its removal, stopping appender");
                let _ = node.repl.repl_tx.send(ReplicationEvent::<D>::Terminate(std::marker::PhantomData));
            }
        }

        self.update_commit_index().await?;
        self.try_promote().await?;
        Ok(())
    }

    /// Advance the commit index to the greatest index replicated on a
    /// majority of active members at the current term, then resolve
    /// everything waiting on commitment.
    pub(super) async fn update_commit_index(&mut self) -> RaftResult<()> {
        let active = self.core.configuration.active_ids();
        let matched: Vec<LogId> = active
            .iter()
            .map(|id| {
                if *id == self.core.id {
                    self.core.last_log_id
                } else {
                    self.nodes.get(id).map(|n| n.matched).unwrap_or_default()
                }
            })
            .collect();

        let new_commit = quorum::commit_index_from_matched(matched, self.core.commit_index, self.core.current_term);
        if new_commit <= self.core.commit_index {
            return Ok(());
        }

        self.core.advance_commit_index(new_commit).await?;

        for node in self.nodes.values() {
            let _ = node.repl.repl_tx.send(ReplicationEvent::<D>::UpdateCommitIndex {
                commit_index: self.core.commit_index,
            });
        }

        // Hand the responders of newly committed entries to the
        // state-machine context along with the apply order.
        let commit_index = self.core.commit_index;
        let mut responders = BTreeMap::new();
        let mut keep = Vec::with_capacity(self.awaiting.len());
        for entry in self.awaiting.drain(..) {
            if entry.index <= commit_index {
                responders.insert(entry.index, entry.responder);
            } else {
                keep.push(entry);
            }
        }
        self.awaiting = keep;
        self.core.drive_state_machine(responders);

        self.handle_config_commit().await?;
        self.core.report_metrics();
        Ok(())
    }
}
