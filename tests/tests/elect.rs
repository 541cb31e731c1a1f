//! Leader election behavior.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::new_cluster;
use fixtures::test_config;
use fixtures::RaftRouter;
use sessraft::Role;

/// Three active members elect exactly one leader, and every member's leader
/// hint converges on it.
#[tokio::test(flavor = "multi_thread")]
async fn three_members_elect_single_leader() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;

    // Every member eventually agrees on the leader and its term.
    let leader_metrics = router.get(leader)?.raft.metrics().borrow().clone();
    assert!(leader_metrics.current_term >= 1);
    for id in 0..3 {
        let node = router.get(id)?;
        node.raft
            .wait(Some(Duration::from_secs(5)))
            .current_leader(leader, "leader hint")
            .await?;
        let metrics = node.raft.metrics().borrow().clone();
        assert_eq!(metrics.current_term, leader_metrics.current_term, "node {} term", id);
    }

    // Exactly one member reports itself leader.
    let leaders = (0..3)
        .filter(|id| router.get(*id).unwrap().raft.metrics().borrow().role == Role::Leader)
        .count();
    assert_eq!(leaders, 1);
    Ok(())
}

/// Partitioning the leader away yields a new leader at a higher term among
/// the remaining members, and the old leader rejoins as a follower of it.
#[tokio::test(flavor = "multi_thread")]
async fn partitioned_leader_is_replaced() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let old_leader = new_cluster(&router, 3).await?;
    let old_term = router.get(old_leader)?.raft.metrics().borrow().current_term;

    router.isolate(old_leader);

    // One of the remaining members must take over at a higher term.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let new_leader = loop {
        let candidate = (0..3).find(|id| {
            let m = router.get(*id).unwrap().raft.metrics().borrow().clone();
            *id != old_leader && m.role == Role::Leader && m.current_term > old_term
        });
        if let Some(id) = candidate {
            break id;
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("no new leader elected after partition");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    // The other healthy member's hint points at the new leader.
    let other = (0..3).find(|id| *id != old_leader && *id != new_leader).unwrap();
    router
        .get(other)?
        .raft
        .wait(Some(Duration::from_secs(5)))
        .current_leader(new_leader, "follower learns new leader")
        .await?;

    // The deposed leader steps down once its lease lapses, and adopts the
    // new leader after healing.
    router
        .get(old_leader)?
        .raft
        .wait(Some(Duration::from_secs(5)))
        .metrics(|m| m.role != Role::Leader, "old leader steps down")
        .await?;
    router.restore(old_leader);
    router
        .get(old_leader)?
        .raft
        .wait(Some(Duration::from_secs(5)))
        .current_leader(new_leader, "old leader adopts new leader")
        .await?;
    Ok(())
}
