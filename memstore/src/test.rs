use pretty_assertions::assert_eq;
use sessraft::membership::Member;
use sessraft::membership::MemberRole;
use sessraft::storage::EntryPayload;
use sessraft::storage::RaftStorage;

use super::*;

const NODE_ID: u64 = 0;

fn entry(term: u64, index: u64) -> LogEntry<ClientRequest> {
    LogEntry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Command(sessraft::storage::CommandEntry {
            session: 1,
            sequence: index,
            data: ClientRequest::Put {
                key: format!("k{}", index),
                value: format!("v{}", index),
            },
            timestamp: index,
        }),
    }
}

#[tokio::test]
async fn test_get_initial_state_default() -> anyhow::Result<()> {
    let store = MemStore::new();
    let initial = store.get_initial_state(NODE_ID).await?;

    assert_eq!(initial.last_log_id, LogId::default());
    assert_eq!(initial.hard_state, HardState::default());
    assert!(initial.configuration.contains(NODE_ID));
    assert_eq!(initial.configuration.role_of(NODE_ID), MemberRole::Active);
    assert!(initial.snapshot.is_none());
    Ok(())
}

#[tokio::test]
async fn test_get_initial_state_with_save_hard_state() -> anyhow::Result<()> {
    let store = MemStore::new();
    let hs = HardState {
        current_term: 3,
        voted_for: Some(2),
    };
    store.save_hard_state(&hs).await?;

    let initial = store.get_initial_state(NODE_ID).await?;
    assert_eq!(initial.hard_state, hs);
    Ok(())
}

#[tokio::test]
async fn test_get_initial_state_prefers_config_appended_to_log() -> anyhow::Result<()> {
    let store = MemStore::new();
    let committed = Configuration::with_members(vec![Member::new(0, MemberRole::Active)]);
    store.save_configuration(&committed).await?;

    let mut newer = committed.to_added(Member::new(1, MemberRole::Reserve));
    newer.index = 5;
    store
        .append_to_log(&[LogEntry {
            log_id: LogId::new(2, 5),
            payload: EntryPayload::Configuration(newer.clone()),
        }])
        .await?;

    let initial = store.get_initial_state(NODE_ID).await?;
    assert_eq!(initial.configuration, newer);
    Ok(())
}

#[tokio::test]
async fn test_append_and_read_log_entries() -> anyhow::Result<()> {
    let store = MemStore::new();
    store.append_to_log(&[entry(1, 1), entry(1, 2), entry(1, 3)]).await?;

    assert_eq!(store.last_log_id().await?, LogId::new(1, 3));
    assert_eq!(store.first_index().await?, 1);

    let read = store.get_log_entries(2..4).await?;
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].log_id, LogId::new(1, 2));
    assert_eq!(read[1].log_id, LogId::new(1, 3));

    assert!(store.try_get_log_entry(2).await?.is_some());
    assert!(store.try_get_log_entry(9).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_truncate_log_removes_suffix() -> anyhow::Result<()> {
    let store = MemStore::new();
    store.append_to_log(&[entry(1, 1), entry(1, 2), entry(2, 3)]).await?;

    store.truncate_log(2).await?;
    assert_eq!(store.last_log_id().await?, LogId::new(1, 1));
    assert!(store.try_get_log_entry(2).await?.is_none());
    assert!(store.try_get_log_entry(1).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_purge_log_keeps_last_log_id() -> anyhow::Result<()> {
    let store = MemStore::new();
    store.append_to_log(&[entry(1, 1), entry(1, 2), entry(1, 3)]).await?;

    store.purge_log(2).await?;
    assert_eq!(store.first_index().await?, 3);
    // The last log ID survives compaction of the prefix.
    assert_eq!(store.last_log_id().await?, LogId::new(1, 3));
    assert!(store.try_get_log_entry(1).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_snapshot_supersedes_predecessor() -> anyhow::Result<()> {
    let store = MemStore::new();
    let config = Configuration::with_members(vec![Member::new(0, MemberRole::Active)]);

    store
        .save_snapshot(Snapshot {
            meta: SnapshotMeta {
                id: "1-5".to_string(),
                last_log_id: LogId::new(1, 5),
                configuration: config.clone(),
            },
            data: b"one".to_vec(),
        })
        .await?;
    store
        .save_snapshot(Snapshot {
            meta: SnapshotMeta {
                id: "2-9".to_string(),
                last_log_id: LogId::new(2, 9),
                configuration: config,
            },
            data: b"two".to_vec(),
        })
        .await?;

    let current = store.current_snapshot().await?.unwrap();
    assert_eq!(current.meta.id, "2-9");
    assert_eq!(current.data, b"two".to_vec());
    assert_eq!(store.current_snapshot_meta().await?.unwrap().last_log_id, LogId::new(2, 9));
    Ok(())
}

#[tokio::test]
async fn test_state_machine_round_trip() -> anyhow::Result<()> {
    let mut sm = MemStateMachine::new();
    let mut ctx = ApplyContext::new(1, 10, 0);

    let res = sm
        .apply(
            10,
            &ClientRequest::Put {
                key: "a".to_string(),
                value: "1".to_string(),
            },
            &mut ctx,
        )
        .await
        .unwrap();
    assert_eq!(res.value, None);
    assert_eq!(ctx.published().len(), 1);

    let snap = sm.snapshot().await?;
    let mut restored = MemStateMachine::new();
    restored.restore(&snap).await?;
    let read = restored
        .query(&ClientRequest::Get { key: "a".to_string() })
        .await
        .unwrap();
    assert_eq!(read.value, Some("1".to_string()));

    let err = restored
        .query(&ClientRequest::Put {
            key: "b".to_string(),
            value: "2".to_string(),
        })
        .await
        .unwrap_err();
    assert!(err.contains("command"));
    Ok(())
}
