//! Error types exposed by this crate.

use crate::raft_types::LogId;
use crate::MemberId;
use crate::SessionId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of the protocol.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// No leader is known to this server and the request cannot be served
    /// locally.
    #[error("cluster has no known leader")]
    NoLeader,

    /// The request is not legal for the member's current role.
    #[error("request is not legal in the member's current state")]
    IllegalMemberState,

    /// The named session is not registered, has expired or was closed.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The session named a state machine this server does not host.
    #[error("unknown state machine {0:?}")]
    UnknownStateMachine(String),

    /// A command could not be completed, and its result is no longer cached.
    #[error("command failed: {0}")]
    CommandFailure(String),

    /// A query could not be completed.
    #[error("query failed: {0}")]
    QueryFailure(String),

    /// The state machine reported an application level error. The error text
    /// is cached like a normal result and is returned again on retry.
    #[error("application error: {0}")]
    ApplicationError(String),

    /// A peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error which has come from the storage layer. Storage errors are
    /// fatal: the server transitions to inactive and reports upward.
    #[error("{0}")]
    Storage(anyhow::Error),

    /// An error which has come from the network layer.
    #[error("{0}")]
    Network(anyhow::Error),

    /// The server is shutting down.
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// An error related to a client-facing request: sessions, commands, queries.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Raft(#[from] RaftError),

    /// The request must be forwarded to the cluster leader; the hint is the
    /// most recently observed leader, if any.
    #[error("the request must be forwarded to the cluster leader {0:?}")]
    ForwardToLeader(Option<MemberId>),
}

/// Error variants related to configuration validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// An election timeout at or below the heartbeat interval would cause
    /// endless elections. A recommended election timeout is about 3 times the
    /// heartbeat interval.
    #[error("election_timeout must be > heartbeat_interval")]
    ElectionTimeoutLessThanHeartbeatInterval,

    /// The given value for `max_batch_bytes` must be > 0.
    #[error("the given value for max_batch_bytes is too small, must be > 0")]
    MaxBatchBytesTooSmall,

    /// The given value for `max_inflight_appends` must be >= 1.
    #[error("the given value for max_inflight_appends is too small, must be >= 1")]
    MaxInflightAppendsTooSmall,

    /// The given value for `snapshot_chunk_bytes` must be > 0.
    #[error("the given value for snapshot_chunk_bytes is too small, must be > 0")]
    SnapshotChunkBytesTooSmall,
}

/// The set of errors which may take place when initializing a pristine
/// server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InitializeError {
    #[error("{0}")]
    Raft(#[from] RaftError),

    /// The server already carries log entries or a term, so the cluster is
    /// in motion and must be changed through the membership protocol instead.
    #[error("the server is not pristine and cannot be initialized")]
    NotAllowed,
}

/// The set of errors which may take place when requesting a membership
/// change.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MembershipError {
    #[error("{0}")]
    Raft(#[from] RaftError),

    /// The request was sent to a server which is not the leader. The ID of
    /// the current leader is returned if known.
    #[error("this server is not the leader")]
    NotLeader(Option<MemberId>),

    /// A previous configuration change has not yet committed. Only one
    /// uncommitted configuration may exist at a time.
    #[error("a configuration change is already in progress at log {config_log_id}")]
    ChangeInProgress { config_log_id: LogId },

    /// The target member is not part of the current configuration.
    #[error("member {0} is not part of the configuration")]
    UnknownMember(MemberId),

    /// The target member already exists in the configuration.
    #[error("member {0} already exists in the configuration")]
    MemberExists(MemberId),

    /// The learner is too far behind to be promoted.
    #[error("member {member} is lagging {distance} entries behind")]
    Lagging { member: MemberId, distance: u64 },

    /// The proposed configuration would leave the cluster without active
    /// members.
    #[error("the proposed configuration has no active members")]
    EmptyConfiguration,
}

impl From<ClientError> for MembershipError {
    fn from(src: ClientError) -> Self {
        match src {
            ClientError::Raft(err) => Self::Raft(err),
            ClientError::ForwardToLeader(id) => Self::NotLeader(id),
        }
    }
}
