//! Session lifecycle, expiration and event delivery.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::new_cluster;
use fixtures::open_session;
use fixtures::test_config;
use fixtures::RaftRouter;
use sessraft::raft::CloseSessionRequest;
use sessraft::raft::CommandRequest;
use sessraft::raft::KeepAliveRequest;
use sessraft::raft::MetadataRequest;
use sessraft::raft::ResetRequest;
use sessraft_memstore::ClientRequest;

/// Open → keep-alive → close produces exactly one open and one close
/// lifecycle transition, with no expiration in between.
#[tokio::test(flavor = "multi_thread")]
async fn session_lifecycle_open_keepalive_close() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;

    let session = open_session(&node.raft, "client-l", 300).await?;

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        node.raft
            .keep_alive(KeepAliveRequest {
                session,
                command_ack: 0,
                event_ack: 0,
            })
            .await
            .unwrap();
    }

    // The session is visible in the registry while open.
    let metadata = node.raft.metadata(MetadataRequest { session }).await.unwrap();
    assert!(metadata.sessions.iter().any(|s| s.session == session && s.name == "client-l"));

    node.raft.close_session(CloseSessionRequest { session }).await.unwrap();

    let lifecycle = node.lifecycle.lock().unwrap().clone();
    let transitions: Vec<&str> =
        lifecycle.iter().filter(|e| e.session == session).map(|e| e.kind).collect();
    assert_eq!(transitions, vec!["open", "close"]);
    Ok(())
}

/// A session which stops sending keep-alives expires deterministically:
/// expire then close, on every server.
#[tokio::test(flavor = "multi_thread")]
async fn session_expires_without_keepalive() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;

    let doomed = open_session(&node.raft, "client-doomed", 100).await?;
    let survivor = open_session(&node.raft, "client-survivor", 60_000).await?;

    // Let the doomed session's timeout lapse, then advance the state-machine
    // clock with activity on the surviving session.
    tokio::time::sleep(Duration::from_millis(300)).await;
    node.raft
        .command(CommandRequest {
            session: survivor,
            sequence: 1,
            data: ClientRequest::Put {
                key: "tick".to_string(),
                value: "tock".to_string(),
            },
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let lifecycle = node.lifecycle.lock().unwrap().clone();
        let transitions: Vec<&str> =
            lifecycle.iter().filter(|e| e.session == doomed).map(|e| e.kind).collect();
        if transitions == vec!["open", "expire", "close"] {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("doomed session did not expire, transitions: {:?}", transitions);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Expiration is replicated: followers observe the same transitions.
    let follower = (0..3).find(|id| *id != leader).unwrap();
    let fnode = router.get(follower)?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let lifecycle = fnode.lifecycle.lock().unwrap().clone();
        let transitions: Vec<&str> =
            lifecycle.iter().filter(|e| e.session == doomed).map(|e| e.kind).collect();
        if transitions == vec!["open", "expire", "close"] {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("follower did not observe expiration, transitions: {:?}", transitions);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Events published while applying a single command arrive as one indexed
/// batch; a reset below the batch index redelivers it, and a reset at the
/// batch index discards it.
#[tokio::test(flavor = "multi_thread")]
async fn events_are_batched_acknowledged_and_resent() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;

    let session = open_session(&node.raft, "client-e", 0).await?;

    let write = node
        .raft
        .command(CommandRequest {
            session,
            sequence: 1,
            data: ClientRequest::PutAll {
                entries: vec![
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "2".to_string()),
                ],
            },
        })
        .await
        .unwrap();

    // Both events arrive in one batch tagged with the command's index.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let batches = router.published_for(session);
        if !batches.is_empty() {
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].event_index, write.index);
            assert_eq!(batches[0].previous_index, session);
            assert_eq!(batches[0].events.len(), 2);
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no events published");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A reset which acknowledges nothing triggers redelivery of the batch.
    node.raft.reset(ResetRequest { session, index: session }).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if router.published_for(session).len() == 2 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("batch was not redelivered after reset");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Acknowledging the batch discards it; a further reset redelivers
    // nothing.
    node.raft.reset(ResetRequest { session, index: write.index }).await.unwrap();
    node.raft.reset(ResetRequest { session, index: write.index }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(router.published_for(session).len(), 2);
    Ok(())
}
