//! Client command and query behavior.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::new_cluster;
use fixtures::open_session;
use fixtures::test_config;
use fixtures::RaftRouter;
use sessraft::raft::CommandRequest;
use sessraft::raft::Consistency;
use sessraft::raft::QueryRequest;
use sessraft::ClientError;
use sessraft::RaftError;
use sessraft_memstore::ClientRequest;

/// A retried command with the same `(session, sequence)` returns the
/// original result without re-invoking the state machine.
#[tokio::test(flavor = "multi_thread")]
async fn command_retry_returns_cached_result() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;

    let session = open_session(&node.raft, "client-a", 0).await?;

    let rpc = CommandRequest {
        session,
        sequence: 1,
        data: ClientRequest::Put {
            key: "1234".to_string(),
            value: "4321".to_string(),
        },
    };
    let first = node.raft.command(rpc.clone()).await.unwrap();
    assert_eq!(first.data.value, None);

    let applied_after_first = *node.applied.lock().unwrap();

    // The retry is answered from the session's result cache.
    let retry = node.raft.command(rpc).await.unwrap();
    assert_eq!(first, retry);
    assert_eq!(*node.applied.lock().unwrap(), applied_after_first);

    // A later sequence is applied normally and observes the first write.
    let second = node
        .raft
        .command(CommandRequest {
            session,
            sequence: 2,
            data: ClientRequest::Put {
                key: "1234".to_string(),
                value: "5678".to_string(),
            },
        })
        .await
        .unwrap();
    assert_eq!(second.data.value, Some("4321".to_string()));
    Ok(())
}

/// Commands submitted to a follower are refused with the leader hint.
#[tokio::test(flavor = "multi_thread")]
async fn follower_forwards_commands_to_leader() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let follower = (0..3).find(|id| *id != leader).unwrap();
    let node = router.get(follower)?;
    node.raft
        .wait(Some(Duration::from_secs(5)))
        .current_leader(leader, "follower knows leader")
        .await?;

    let err = node
        .raft
        .command(CommandRequest {
            session: 1,
            sequence: 1,
            data: ClientRequest::Get { key: "x".to_string() },
        })
        .await
        .unwrap_err();
    match err {
        ClientError::ForwardToLeader(hint) => assert_eq!(hint, Some(leader)),
        other => panic!("expected ForwardToLeader, got {:?}", other),
    }
    Ok(())
}

/// Strict and lease queries on the leader observe committed writes; an
/// eventual query on a follower observes them once its session has caught
/// up to the requested index.
#[tokio::test(flavor = "multi_thread")]
async fn queries_honor_consistency_modes() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;

    let session = open_session(&node.raft, "client-q", 0).await?;
    let write = node
        .raft
        .command(CommandRequest {
            session,
            sequence: 1,
            data: ClientRequest::Put {
                key: "k".to_string(),
                value: "v".to_string(),
            },
        })
        .await
        .unwrap();

    for consistency in [Consistency::Strict, Consistency::Lease] {
        let res = node
            .raft
            .query(QueryRequest {
                session,
                min_sequence: 1,
                min_index: write.index,
                consistency,
                data: ClientRequest::Get { key: "k".to_string() },
            })
            .await
            .unwrap();
        assert_eq!(res.data.value, Some("v".to_string()));
    }

    // A follower serves the eventual read once its state machine has applied
    // past the write.
    let follower = (0..3).find(|id| *id != leader).unwrap();
    let fnode = router.get(follower)?;
    fnode
        .raft
        .wait(Some(Duration::from_secs(5)))
        .applied(write.index, "follower applies the write")
        .await?;
    let res = fnode
        .raft
        .query(QueryRequest {
            session,
            min_sequence: 1,
            min_index: write.index,
            consistency: Consistency::Eventual,
            data: ClientRequest::Get { key: "k".to_string() },
        })
        .await
        .unwrap();
    assert_eq!(res.data.value, Some("v".to_string()));
    Ok(())
}

/// A query naming an unregistered session fails with `UnknownSession`.
#[tokio::test(flavor = "multi_thread")]
async fn query_on_unknown_session_fails() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 1).await?;
    let node = router.get(leader)?;

    let err = node
        .raft
        .query(QueryRequest {
            session: 42,
            min_sequence: 0,
            min_index: 0,
            consistency: Consistency::Eventual,
            data: ClientRequest::Get { key: "k".to_string() },
        })
        .await
        .unwrap_err();
    match err {
        ClientError::Raft(RaftError::UnknownSession(42)) => {}
        other => panic!("expected UnknownSession, got {:?}", other),
    }
    Ok(())
}

/// Application errors from the state machine are returned to the client and
/// repeat identically on retry.
#[tokio::test(flavor = "multi_thread")]
async fn application_error_is_cached_like_a_result() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 1).await?;
    let node = router.get(leader)?;

    let session = open_session(&node.raft, "client-err", 0).await?;
    // A write submitted through the query path is an application error.
    let err = node
        .raft
        .query(QueryRequest {
            session,
            min_sequence: 0,
            min_index: 0,
            consistency: Consistency::Eventual,
            data: ClientRequest::Put {
                key: "k".to_string(),
                value: "v".to_string(),
            },
        })
        .await
        .unwrap_err();
    match err {
        ClientError::Raft(RaftError::QueryFailure(msg)) => {
            assert!(msg.contains("command"));
        }
        other => panic!("expected QueryFailure, got {:?}", other),
    }
    Ok(())
}
