//! Follower-side snapshot installation.

use crate::core::RaftCore;
use crate::core::Role;
use crate::core::SnapshotStreamState;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::InstallRequest;
use crate::raft::InstallResponse;
use crate::sm::SmCommand;
use crate::sm::StateMachine;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
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
    /// An RPC invoked by the leader to stream a snapshot to a member whose
    /// log is behind the leader's compacted prefix.
    ///
    /// Chunks accumulate in memory against the declared `(id, index)` pair;
    /// the final chunk commits the snapshot atomically, compacts the covered
    /// log prefix and hands the image to the state-machine context before
    /// any further entries are applied.
    #[tracing::instrument(level = "trace", skip(self, req), fields(snapshot = %req.meta.last_log_id, offset = req.offset, done = req.done))]
    pub(super) async fn handle_install_snapshot(&mut self, req: InstallRequest) -> RaftResult<InstallResponse> {
        if req.term < self.current_term {
            return Ok(InstallResponse {
                term: self.current_term,
            });
        }

        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(req.leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader));
            report_metrics = true;
        }
        if matches!(self.target_role, Role::Candidate | Role::Leader) {
            self.set_target_role(Role::Follower);
            report_metrics = true;
        }
        if report_metrics {
            self.report_metrics();
        }

        // A new (id, index) pair or offset 0 starts a fresh stream.
        let fresh = match &self.snapshot_stream {
            None => true,
            Some(stream) => {
                req.offset == 0 || stream.id != req.meta.id || stream.index != req.meta.last_log_id.index
            }
        };
        if fresh {
            if req.offset != 0 {
                return Err(RaftError::Protocol(format!(
                    "snapshot stream for {} must start at offset 0, got {}",
                    req.meta.id, req.offset
                )));
            }
            self.snapshot_stream = Some(SnapshotStreamState {
                id: req.meta.id.clone(),
                index: req.meta.last_log_id.index,
                offset: 0,
                buffer: Vec::new(),
            });
        }

        let Some(stream) = self.snapshot_stream.as_mut() else {
            return Err(RaftError::Protocol("no snapshot stream in progress".to_string()));
        };
        if req.offset != stream.offset {
            // The leader restarts from offset 0 on any error response.
            return Err(RaftError::Protocol(format!(
                "snapshot chunk at offset {} does not continue stream at {}",
                req.offset, stream.offset
            )));
        }
        stream.buffer.extend_from_slice(&req.data);
        stream.offset += req.data.len() as u64;

        if req.done {
            if let Some(stream) = self.snapshot_stream.take() {
                self.finalize_snapshot_installation(req, stream.buffer).await?;
            }
        }

        Ok(InstallResponse {
            term: self.current_term,
        })
    }

    /// Commit a fully received snapshot.
    async fn finalize_snapshot_installation(&mut self, req: InstallRequest, buffer: Vec<u8>) -> RaftResult<()> {
        let snapshot = Snapshot {
            meta: req.meta.clone(),
            data: buffer,
        };
        self.storage
            .save_snapshot(snapshot.clone())
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let snapshot_index = req.meta.last_log_id.index;
        self.storage
            .purge_log(snapshot_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if self.last_log_id.index < snapshot_index {
            self.last_log_id = req.meta.last_log_id;
        }
        self.snapshot_index = snapshot_index;

        self.update_configuration(req.meta.configuration.clone());

        // Everything the snapshot covers is committed by definition.
        self.advance_commit_index(snapshot_index).await?;
        self.last_apply_sent = std::cmp::max(self.last_apply_sent, snapshot_index);
        self.sm.send(SmCommand::InstallSnapshot { snapshot });

        tracing::info!(snapshot = %req.meta.last_log_id, "snapshot installed");
        self.report_metrics();
        Ok(())
    }
}
