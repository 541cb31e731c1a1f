//! Follower-side append handling.

use std::collections::BTreeMap;

use crate::core::RaftCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendRequest;
use crate::raft::AppendResponse;
use crate::raft_types::LogId;
use crate::sm::StateMachine;
use crate::storage::EntryPayload;
use crate::storage::LogEntry;
use crate::storage::RaftStorage;
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
    /// An RPC invoked by the leader to replicate log entries; also used as
    /// heartbeat.
    ///
    /// A valid-term request always resets the heartbeat timer and refreshes
    /// the leader hint, even when it is rejected on log matching. The
    /// rejection carries this server's last log index as the hint from which
    /// the leader backtracks.
    #[tracing::instrument(
        level = "trace",
        skip(self, msg),
        fields(term = msg.term, leader = msg.leader, prev_log_id = %msg.prev_log_id, commit_index = msg.commit_index),
    )]
    pub(super) async fn handle_append_entries(&mut self, msg: AppendRequest<D>) -> RaftResult<AppendResponse> {
        // A stale leader does not get to reset our timer.
        if msg.term < self.current_term {
            tracing::trace!({ self.current_term, rpc_term = msg.term }, "append term is less than current term");
            return Ok(AppendResponse {
                term: self.current_term,
                succeeded: false,
                last_log_index: self.last_log_id.index,
            });
        }

        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(msg.leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader));
            report_metrics = true;
        }
        if matches!(self.target_role, Role::Candidate | Role::Leader) {
            self.set_target_role(Role::Follower);
            report_metrics = true;
        }

        // Log-matching check, applied to heartbeats as well so that a
        // diverged follower is discovered without payload traffic.
        if let Some(hint) = self.check_prev_entry(msg.prev_log_id).await? {
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendResponse {
                term: self.current_term,
                succeeded: false,
                last_log_index: hint,
            });
        }

        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
        }

        self.advance_commit_index(msg.commit_index).await?;
        self.drive_state_machine(BTreeMap::new());
        if report_metrics {
            self.report_metrics();
        }

        Ok(AppendResponse {
            term: self.current_term,
            succeeded: true,
            last_log_index: self.last_log_id.index,
        })
    }

    /// Verify that `prev_log_id` matches this server's log. Returns the
    /// backtracking hint on mismatch.
    async fn check_prev_entry(&mut self, prev_log_id: LogId) -> RaftResult<Option<u64>> {
        if prev_log_id.index == 0 {
            return Ok(None);
        }
        // Committed and compacted prefixes are known to match by the Log
        // Matching property; only the live suffix needs a term comparison.
        if prev_log_id.index <= std::cmp::max(self.snapshot_index, self.commit_index) {
            return Ok(None);
        }
        if prev_log_id.index > self.last_log_id.index {
            return Ok(Some(self.last_log_id.index));
        }
        let existing = self
            .storage
            .try_get_log_entry(prev_log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        match existing {
            Some(entry) if entry.log_id.term == prev_log_id.term => Ok(None),
            // A conflicting term at the previous index: hint one below it so
            // the leader converges on the divergence point.
            Some(_) => Ok(Some(prev_log_id.index - 1)),
            None => Ok(Some(self.last_log_id.index)),
        }
    }

    /// Store replicated entries, truncating a conflicting uncommitted
    /// suffix first. Configuration entries take effect as soon as they are
    /// appended.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[LogEntry<D>]) -> RaftResult<()> {
        // Find the first entry this server does not already hold.
        let mut first_new = None;
        for (pos, entry) in entries.iter().enumerate() {
            if entry.log_id.index > self.last_log_id.index {
                first_new = Some(pos);
                break;
            }
            let existing = self
                .storage
                .try_get_log_entry(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                Some(local) if local.log_id.term == entry.log_id.term => continue,
                None => continue,
                Some(_) => {
                    // A conflicting suffix; it must be uncommitted.
                    if entry.log_id.index <= self.commit_index {
                        return Err(RaftError::Protocol(format!(
                            "append would replace committed entry at {}",
                            entry.log_id.index
                        )));
                    }
                    self.storage
                        .truncate_log(entry.log_id.index)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    tracing::debug!(from = entry.log_id.index, "truncated conflicting log suffix");
                    first_new = Some(pos);
                    break;
                }
            }
        }

        let Some(pos) = first_new else {
            return Ok(());
        };
        let slice = &entries[pos..];
        self.storage
            .append_to_log(slice)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = slice.last() {
            self.last_log_id = entry.log_id;
        }

        // Adopt the most recent configuration among the appended entries;
        // a server always operates under the latest one it has seen.
        let last_config = slice
            .iter()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::Configuration(config) => Some(config),
                _ => None,
            })
            .last();
        if let Some(config) = last_config {
            self.update_configuration(config.clone());
            self.report_metrics();
        }
        Ok(())
    }
}
