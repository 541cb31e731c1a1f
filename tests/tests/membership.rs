//! Membership changes and the learner promotion ladder.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::new_cluster;
use fixtures::test_config;
use fixtures::RaftRouter;
use sessraft::membership::Member;
use sessraft::membership::MemberRole;
use sessraft::MembershipError;
use sessraft::Role;

/// A joined member starts in the reserve role and is promoted through
/// passive to active once it has caught up; it then counts toward quorum.
#[tokio::test(flavor = "multi_thread")]
async fn joined_member_climbs_promotion_ladder() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;

    // Membership changes are refused while the bootstrap configuration is
    // still uncommitted.
    node.raft
        .wait(Some(Duration::from_secs(5)))
        .metrics(|m| m.commit_index >= 1, "bootstrap configuration committed")
        .await?;

    // Spawn the new server; it stays inactive until the leader configures it.
    router.new_node(3);

    let res = node.raft.join(Member::new(3, MemberRole::Reserve)).await.unwrap();
    assert_eq!(res.configuration.role_of(3), MemberRole::Reserve);

    // The ladder runs without further intervention.
    node.raft
        .wait(Some(Duration::from_secs(10)))
        .metrics(
            |m| m.configuration.role_of(3) == MemberRole::Active,
            "member 3 promoted to active",
        )
        .await?;

    // The new member itself settles into the follower role and catches up.
    let joined = router.get(3)?;
    joined.raft.wait(Some(Duration::from_secs(10))).role(Role::Follower, "joined member").await?;
    let leader_applied = node.raft.metrics().borrow().last_applied;
    joined
        .raft
        .wait(Some(Duration::from_secs(10)))
        .applied(leader_applied, "joined member catches up")
        .await?;
    Ok(())
}

/// Only one configuration change may be uncommitted at a time; a second
/// join is refused while the first is still being driven.
#[tokio::test(flavor = "multi_thread")]
async fn join_of_existing_member_is_refused() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;

    let err = node.raft.join(Member::new(0, MemberRole::Reserve)).await.unwrap_err();
    match err {
        MembershipError::MemberExists(0) => {}
        other => panic!("expected MemberExists, got {:?}", other),
    }
    Ok(())
}

/// A leader which removes itself steps down after the removal commits, and
/// the remaining members elect a successor.
#[tokio::test(flavor = "multi_thread")]
async fn leaving_leader_steps_down() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let old_leader = new_cluster(&router, 3).await?;
    let node = router.get(old_leader)?;
    node.raft
        .wait(Some(Duration::from_secs(5)))
        .metrics(|m| m.commit_index >= 1, "bootstrap configuration committed")
        .await?;

    let res = node.raft.leave(old_leader).await.unwrap();
    assert!(!res.configuration.contains(old_leader));

    node.raft
        .wait(Some(Duration::from_secs(5)))
        .metrics(|m| m.role == Role::Inactive, "removed leader becomes inactive")
        .await?;

    // The survivors elect a new leader among themselves.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(new_leader) = router.current_leader() {
            if new_leader != old_leader {
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("no successor elected after leader left");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// A wholesale reconfiguration can demote a voter to a learner; the demoted
/// member keeps replicating but drops out of the voting set.
#[tokio::test(flavor = "multi_thread")]
async fn reconfigure_demotes_voter_to_learner() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;
    let demoted = (0..3).find(|id| *id != leader).unwrap();
    node.raft
        .wait(Some(Duration::from_secs(5)))
        .metrics(|m| m.commit_index >= 1, "bootstrap configuration committed")
        .await?;

    let members: Vec<Member> = (0..3)
        .map(|id| {
            if id == demoted {
                Member::new(id, MemberRole::Passive)
            } else {
                Member::new(id, MemberRole::Active)
            }
        })
        .collect();
    let res = node.raft.reconfigure(members).await.unwrap();
    assert_eq!(res.configuration.role_of(demoted), MemberRole::Passive);
    assert_eq!(res.configuration.active_ids().len(), 2);

    // The demoted member adopts the passive role once the entry reaches it.
    router
        .get(demoted)?
        .raft
        .wait(Some(Duration::from_secs(5)))
        .role(Role::Passive, "demoted member")
        .await?;
    Ok(())
}

/// Removing a follower stops replication to it without disturbing the rest
/// of the cluster.
#[tokio::test(flavor = "multi_thread")]
async fn removed_follower_leaves_configuration() -> Result<()> {
    init_tracing();
    let router = RaftRouter::new(test_config());
    let leader = new_cluster(&router, 3).await?;
    let node = router.get(leader)?;
    let target = (0..3).find(|id| *id != leader).unwrap();
    node.raft
        .wait(Some(Duration::from_secs(5)))
        .metrics(|m| m.commit_index >= 1, "bootstrap configuration committed")
        .await?;

    let res = node.raft.leave(target).await.unwrap();
    assert!(!res.configuration.contains(target));
    assert_eq!(res.configuration.active_ids().len(), 2);

    // The leader keeps its role; quorum is now 2 of 2.
    assert_eq!(node.raft.metrics().borrow().role, Role::Leader);
    Ok(())
}
