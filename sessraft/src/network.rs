//! The network interface between cluster members.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendRequest;
use crate::raft::AppendResponse;
use crate::raft::ConfigureRequest;
use crate::raft::ConfigureResponse;
use crate::raft::InstallRequest;
use crate::raft::InstallResponse;
use crate::raft::PollRequest;
use crate::raft::PollResponse;
use crate::raft::PublishRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppEvent;
use crate::MemberId;

/// A trait defining the interface for the message transport between cluster
/// members.
///
/// Any reliable unicast request/response transport suffices. All calls are
/// asynchronous and non-blocking; an `Err` means the request could not be
/// delivered or the peer failed to answer, and is accounted as a transport
/// failure by the caller.
#[async_trait]
pub trait RaftNetwork<D, E>: Send + Sync + 'static
where
    D: AppData,
    E: AppEvent,
{
    /// Send an append request, used both to replicate entries and as the
    /// leader's heartbeat.
    async fn append_entries(&self, target: MemberId, rpc: AppendRequest<D>) -> Result<AppendResponse>;

    /// Send a chunk of a snapshot to a lagging member.
    async fn install_snapshot(&self, target: MemberId, rpc: InstallRequest) -> Result<InstallResponse>;

    /// Send a vote request on behalf of a candidate.
    async fn vote(&self, target: MemberId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a pre-vote poll on behalf of a timed-out follower.
    async fn poll(&self, target: MemberId, rpc: PollRequest) -> Result<PollResponse>;

    /// Send the current configuration to a reserve member.
    async fn configure(&self, target: MemberId, rpc: ConfigureRequest) -> Result<ConfigureResponse>;

    /// Push session events to the member through which the session's client
    /// is connected. Fire-and-forget; redelivery is driven by the client's
    /// reset requests.
    async fn publish(&self, target: MemberId, rpc: PublishRequest<E>) -> Result<()>;
}
