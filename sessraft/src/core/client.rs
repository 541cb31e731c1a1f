//! Leader-side handling of client requests: sessions, commands and queries.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::core::now_ms;
use crate::core::AwaitingEntry;
use crate::core::LeaderState;
use crate::error::ClientError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendRequest;
use crate::raft::CloseSessionRequest;
use crate::raft::CloseSessionResponse;
use crate::raft::CommandRequest;
use crate::raft::CommandResponse;
use crate::raft::Consistency;
use crate::raft::KeepAliveRequest;
use crate::raft::KeepAliveResponse;
use crate::raft::MetadataRequest;
use crate::raft::MetadataResponse;
use crate::raft::OpenSessionRequest;
use crate::raft::OpenSessionResponse;
use crate::raft::QueryRequest;
use crate::raft::QueryResponse;
use crate::raft::RaftRespTx;
use crate::raft_types::LogId;
use crate::sm::Notification;
use crate::sm::Responder;
use crate::sm::SmCommand;
use crate::sm::StateMachine;
use crate::storage::CloseSessionEntry;
use crate::storage::CommandEntry;
use crate::storage::EntryPayload;
use crate::storage::KeepAliveEntry;
use crate::storage::LogEntry;
use crate::storage::MetadataEntry;
use crate::storage::OpenSessionEntry;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
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
    /// Commit the initial entry which new leaders are obligated to create
    /// when first coming to power; no client write can commit before it.
    ///
    /// A brand new cluster commits its bootstrap configuration instead of a
    /// plain initialize entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        if self.core.last_log_id.index == 0 {
            let config = self.core.configuration.clone();
            self.append_configuration_entry(config, None).await?;
        } else {
            self.append_payload_to_log(EntryPayload::Initialize { timestamp: now_ms() }).await?;
            self.replicate_entries();
        }
        self.update_commit_index().await?;
        self.core.report_metrics();
        Ok(())
    }

    /// Transform the given payload into an entry, assign it the next index
    /// at the current term, and append it to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<LogEntry<D>> {
        let entry = LogEntry {
            log_id: LogId::new(self.core.current_term, self.core.last_log_id.index + 1),
            payload,
        };
        self.core
            .storage
            .append_to_log(&[entry.clone()])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;
        Ok(entry)
    }

    /// Append a client operation, register its responder for commitment,
    /// and kick replication.
    async fn append_client_entry(&mut self, payload: EntryPayload<D>, responder: Responder<R>) -> RaftResult<()> {
        let entry = self.append_payload_to_log(payload).await?;
        self.awaiting.push(AwaitingEntry {
            index: entry.log_id.index,
            responder,
        });
        self.replicate_entries();
        self.update_commit_index().await?;
        Ok(())
    }

    pub(super) async fn handle_open_session(
        &mut self,
        rpc: OpenSessionRequest,
        tx: RaftRespTx<OpenSessionResponse, ClientError>,
    ) {
        let member = if rpc.member == 0 { self.core.id } else { rpc.member };
        let payload = EntryPayload::OpenSession(OpenSessionEntry {
            member,
            name: rpc.name,
            kind: rpc.kind,
            timeout: rpc.timeout,
            timestamp: now_ms(),
        });
        if let Err(err) = self.append_client_entry(payload, Responder::OpenSession(tx)).await {
            tracing::error!(error=%err, "failed appending open-session entry");
        }
    }

    pub(super) async fn handle_close_session(
        &mut self,
        rpc: CloseSessionRequest,
        tx: RaftRespTx<CloseSessionResponse, ClientError>,
    ) {
        let payload = EntryPayload::CloseSession(CloseSessionEntry {
            session: rpc.session,
            timestamp: now_ms(),
        });
        if let Err(err) = self.append_client_entry(payload, Responder::CloseSession(tx)).await {
            tracing::error!(error=%err, "failed appending close-session entry");
        }
    }

    pub(super) async fn handle_keep_alive(
        &mut self,
        rpc: KeepAliveRequest,
        tx: RaftRespTx<KeepAliveResponse, ClientError>,
    ) {
        let payload = EntryPayload::KeepAlive(KeepAliveEntry {
            session: rpc.session,
            command_ack: rpc.command_ack,
            event_ack: rpc.event_ack,
            timestamp: now_ms(),
        });
        if let Err(err) = self.append_client_entry(payload, Responder::KeepAlive(tx)).await {
            tracing::error!(error=%err, "failed appending keep-alive entry");
        }
    }

    pub(super) async fn handle_client_command(
        &mut self,
        rpc: CommandRequest<D>,
        tx: RaftRespTx<CommandResponse<R>, ClientError>,
    ) {
        let payload = EntryPayload::Command(CommandEntry {
            session: rpc.session,
            sequence: rpc.sequence,
            data: rpc.data,
            timestamp: now_ms(),
        });
        if let Err(err) = self.append_client_entry(payload, Responder::Command(tx)).await {
            tracing::error!(error=%err, "failed appending command entry");
        }
    }

    pub(super) async fn handle_metadata(&mut self, rpc: MetadataRequest, tx: RaftRespTx<MetadataResponse, ClientError>) {
        let payload = EntryPayload::Metadata(MetadataEntry {
            session: rpc.session,
            timestamp: now_ms(),
        });
        if let Err(err) = self.append_client_entry(payload, Responder::Metadata(tx)).await {
            tracing::error!(error=%err, "failed appending metadata entry");
        }
    }

    /// Route a query per its consistency mode.
    ///
    /// Strict queries execute only after a heartbeat round proves this
    /// server is still the leader. Lease queries execute locally while a
    /// majority has been heard from within the election timeout, and fall
    /// back to the strict path when the lease has lapsed.
    pub(super) async fn handle_client_query(
        &mut self,
        rpc: QueryRequest<D>,
        tx: RaftRespTx<QueryResponse<R>, ClientError>,
    ) {
        match rpc.consistency {
            Consistency::Eventual => self.core.sm.send(SmCommand::Query { rpc, tx }),
            Consistency::Lease if self.has_lease_quorum() => self.core.sm.send(SmCommand::Query { rpc, tx }),
            Consistency::Lease | Consistency::Strict => self.confirm_leadership_then_query(rpc, tx),
        }
    }

    /// Confirm leadership with an empty append round to a majority of
    /// active members, then hand the query to the state-machine context.
    ///
    /// From the Raft paper (§8): a leader must exchange heartbeats with a
    /// majority of the cluster before answering read-only requests, to
    /// guard against serving stale reads after being deposed.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    fn confirm_leadership_then_query(&mut self, rpc: QueryRequest<D>, tx: RaftRespTx<QueryResponse<R>, ClientError>) {
        let active = self.core.configuration.active_ids();
        let needed = crate::quorum::majority_of(active.len());

        // The leader counts itself; a single-member cluster needs no round.
        if needed <= 1 {
            self.core.sm.send(SmCommand::Query { rpc, tx });
            return;
        }

        let term = self.core.current_term;
        let leader = self.core.id;
        let commit_index = self.core.commit_index;
        let network = self.core.network.clone();
        let sm_tx = self.core.sm.cmd_tx.clone();
        let notify_tx = self.core.tx_notify.clone();
        let ttl = Duration::from_millis(self.core.config.heartbeat_interval);

        let targets: Vec<_> = active
            .iter()
            .filter(|id| **id != leader)
            .map(|id| {
                let matched = self.nodes.get(id).map(|n| n.matched).unwrap_or_default();
                (*id, matched)
            })
            .collect();

        tokio::spawn(
            async move {
                let mut confirmed = 1usize;
                let mut pending = FuturesUnordered::new();
                for (target, matched) in targets {
                    let rpc = AppendRequest {
                        term,
                        leader,
                        prev_log_id: matched,
                        entries: Vec::new(),
                        commit_index,
                    };
                    let network = network.clone();
                    pending.push(async move { (target, timeout(ttl, network.append_entries(target, rpc)).await) });
                }

                while let Some((target, res)) = pending.next().await {
                    let response = match res {
                        Ok(Ok(response)) => response,
                        Ok(Err(err)) => {
                            tracing::warn!(target, error=%err, "error while confirming leadership");
                            continue;
                        }
                        Err(_) => {
                            tracing::warn!(target, "timeout while confirming leadership");
                            continue;
                        }
                    };
                    if response.term > term {
                        let _ = notify_tx.send(Notification::HigherTerm { term: response.term });
                        let _ = tx.send(Err(ClientError::ForwardToLeader(None)));
                        return;
                    }
                    confirmed += 1;
                    if confirmed >= needed {
                        let _ = sm_tx.send(SmCommand::Query { rpc, tx });
                        return;
                    }
                }

                let _ = tx.send(Err(ClientError::Raft(RaftError::QueryFailure(
                    "could not confirm leadership with a majority".to_string(),
                ))));
            }
            .instrument(tracing::trace_span!("confirm-leadership", leader, term)),
        );
    }
}
