//! Vote and pre-vote poll handling.

use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::FollowerState;
use crate::core::PollTally;
use crate::core::RaftCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::PollRequest;
use crate::raft::PollResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::sm::StateMachine;
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
    /// An RPC invoked by candidates to gather votes.
    ///
    /// A vote is granted only when the candidate's log is at least as
    /// up-to-date as ours, we have not voted for anyone else this term, and
    /// no live leader has been heard from within the election timeout. The
    /// vote is persisted before the response leaves this server.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(candidate = msg.candidate, term = msg.term))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        if msg.term < self.current_term {
            tracing::trace!(
                { candidate = msg.candidate, self.current_term, rpc_term = msg.term },
                "vote request term is less than current term"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            });
        }

        // Do not grant votes while a live leader is heard from; this keeps a
        // partitioned member from disrupting a stable cluster on rejoin.
        if self.leader_recently_seen() {
            tracing::trace!(
                { candidate = msg.candidate },
                "rejecting vote request received within election timeout of a leader"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            });
        }

        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.set_target_role(Role::Follower);
            self.save_hard_state().await?;
        }

        // Candidates with stale logs are rejected regardless of term.
        if msg.last_log_id < self.last_log_id {
            tracing::trace!(
                { candidate = msg.candidate },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            });
        }

        match &self.voted_for {
            Some(candidate) if *candidate == msg.candidate => Ok(VoteResponse {
                term: self.current_term,
                voted: true,
            }),
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            }),
            None => {
                self.voted_for = Some(msg.candidate);
                self.set_target_role(Role::Follower);
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                tracing::debug!({ candidate = msg.candidate, msg.term }, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    voted: true,
                })
            }
        }
    }

    /// A pre-vote probe from a timed-out follower.
    ///
    /// Acceptance signals that we would grant a real vote, without mutating
    /// any vote state; the prober only campaigns after a majority accepts.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(candidate = msg.candidate, term = msg.term))]
    pub(super) async fn handle_poll_request(&mut self, msg: PollRequest) -> RaftResult<PollResponse> {
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.set_target_role(Role::Follower);
            self.save_hard_state().await?;
        }

        let accepted =
            msg.term >= self.current_term && !self.leader_recently_seen() && msg.last_log_id >= self.last_log_id;

        Ok(PollResponse {
            term: self.current_term,
            accepted,
        })
    }
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
    /// Handle a response to a vote request sent to a peer.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: MemberId) -> RaftResult<()> {
        // A higher term in any response demotes the candidate.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
            self.core.save_hard_state().await?;
            tracing::debug!("reverting to follower due to higher term in vote response");
            return Ok(());
        }

        if res.voted && self.core.configuration.role_of(target).is_voter() {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::debug!(term = self.core.current_term, "won election, becoming leader");
                self.core.set_target_role(Role::Leader);
            }
        }
        Ok(())
    }

    /// Spawn parallel vote requests to all other active members.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, MemberId)> {
        let targets: Vec<MemberId> =
            self.core.configuration.active_ids().into_iter().filter(|id| *id != self.core.id).collect();
        let (tx, rx) = mpsc::channel(std::cmp::max(targets.len(), 1));
        for member in targets {
            let rpc = VoteRequest {
                term: self.core.current_term,
                candidate: self.core.id,
                last_log_id: self.core.last_log_id,
            };
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            tokio::spawn(
                async move {
                    match network.vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, peer=member}, "error requesting vote from peer"),
                    }
                }
                .instrument(tracing::trace_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }
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
    /// Poll all other active members to determine whether an election would
    /// succeed, before disrupting the cluster with a real term advance.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn start_poll_round(&mut self) {
        let targets: Vec<MemberId> =
            self.core.configuration.active_ids().into_iter().filter(|id| *id != self.core.id).collect();

        // A lone active member needs nobody's permission.
        if targets.is_empty() {
            self.poll = None;
            self.core.set_target_role(Role::Candidate);
            return;
        }

        tracing::debug!(term = self.core.current_term, "heartbeat timed out, polling members");

        let (tx, rx) = mpsc::channel(targets.len());
        let total = targets.len() + 1;
        for member in targets {
            let rpc = PollRequest {
                term: self.core.current_term,
                candidate: self.core.id,
                last_log_id: self.core.last_log_id,
            };
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            tokio::spawn(
                async move {
                    match network.poll(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::trace!({error=%err, peer=member}, "error polling peer"),
                    }
                }
                .instrument(tracing::trace_span!("polling peer", target = member)),
            );
        }
        self.poll = Some(PollTally {
            accepted: 1,
            rejected: 0,
            needed: self.core.configuration.quorum(),
            total,
            rx,
        });
    }

    /// Handle one poll response; a majority of acceptances makes this member
    /// a candidate, a majority of rejections re-arms the heartbeat timer.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_poll_response(&mut self, res: PollResponse, peer: MemberId) -> RaftResult<()> {
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
        }

        // A leader re-appeared while the round was in flight; the round is
        // void.
        if self.core.leader_recently_seen() {
            self.poll = None;
            return Ok(());
        }

        let Some(tally) = self.poll.as_mut() else {
            return Ok(());
        };
        if res.accepted && res.term == self.core.current_term {
            tracing::trace!(peer, "poll accepted");
            tally.accepted += 1;
        } else {
            tracing::trace!(peer, "poll rejected");
            tally.rejected += 1;
        }

        if tally.accepted >= tally.needed {
            self.poll = None;
            tracing::debug!("poll round succeeded, becoming candidate");
            self.core.set_target_role(Role::Candidate);
        } else if tally.total - tally.rejected < tally.needed {
            self.poll = None;
            tracing::debug!("poll round failed, staying follower");
            self.core.update_next_election_timeout(false);
        }
        Ok(())
    }
}
