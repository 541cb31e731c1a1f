//! A Raft consensus engine with first-class client sessions.
//!
//! `sessraft` replicates an application-provided state machine across a small
//! cluster of members. On top of the classic Raft roles it supports four
//! member roles — active voters, passive learners which receive all committed
//! entries, reserve members which receive only configuration, and inactive
//! placeholders — together with a single-change membership protocol and a
//! reserve → passive → active promotion ladder for joining members.
//!
//! Clients interact through sessions: commands are deduplicated per
//! `(session, sequence)` for linearizable semantics, queries run at a
//! configurable consistency level, and state machines may push events to
//! sessions with indexed, resendable delivery.

pub mod config;
mod core;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod raft;
mod quorum;
mod replication;
pub mod sm;
pub mod storage;
mod summary;

mod raft_types;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::Role;
pub use crate::error::ClientError;
pub use crate::error::ConfigError;
pub use crate::error::InitializeError;
pub use crate::error::MembershipError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::membership::Configuration;
pub use crate::membership::Member;
pub use crate::membership::MemberRole;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::sm::StateMachine;
pub use crate::storage::LogStore;
pub use crate::storage::MetaStore;
pub use crate::storage::RaftStorage;
pub use crate::storage::SnapshotStore;
pub use crate::summary::MessageSummary;

/// A cluster member's ID.
pub type MemberId = u64;

/// A client session's ID.
///
/// A session ID equals the log index of the open-session entry which
/// registered it, and is therefore unique across the lifetime of the cluster.
pub type SessionId = u64;

/// A trait defining application specific command data.
///
/// Applications present their command types as-is to the engine. The engine
/// carries them through the log and hands them back to the application's
/// state machine when the corresponding entry commits, without intermediate
/// serialization on the local path.
pub trait AppData: Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// This is the type a state machine returns from applying a command. Response
/// values are cached per `(session, sequence)` so that a retried command
/// observes the original result.
pub trait AppDataResponse:
    Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A trait defining application specific event data pushed to sessions.
///
/// Events are published by the state machine during command application and
/// delivered to the session's member of origin in `event_index` order.
pub trait AppEvent: Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}
