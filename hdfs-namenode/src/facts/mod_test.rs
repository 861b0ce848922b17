use anyhow::Result;
use serde_json::json;

use crate::config::Config;
use crate::database::Database;
use crate::facts::{ApplyOutcome, Broadcast, FactStore, Flag, Version};
use hdfs_core::model::FactKey;

fn broadcast(key: FactKey, term: u64, seq: u64, value: serde_json::Value) -> Broadcast {
    Broadcast {
        key,
        version: Version { term, seq },
        value,
    }
}

#[tokio::test]
async fn apply_detects_changes_by_content() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;

    let value = json!([{"host": "10.0.0.5", "port": 2181}]);
    let first = facts.apply(broadcast(FactKey::Zookeeper, 1, 1, value.clone()))?;
    let second = facts.apply(broadcast(FactKey::Zookeeper, 1, 2, value))?;
    let third = facts.apply(broadcast(FactKey::Zookeeper, 1, 3, json!([{"host": "10.0.0.5", "port": 2181}, {"host": "10.0.0.6", "port": 2181}])))?;

    assert_eq!(first, ApplyOutcome::Changed, "expected first broadcast to change the replica");
    assert_eq!(second, ApplyOutcome::Unchanged, "expected identical broadcast to be detected as unchanged");
    assert_eq!(third, ApplyOutcome::Changed, "expected new member set to change the replica");
    let zks = facts.zookeepers()?.unwrap_or_default();
    assert_eq!(zks.len(), 2, "expected 2 zookeeper members on record, got {}", zks.len());

    Ok(())
}

#[tokio::test]
async fn apply_rejects_stale_versions() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;

    facts.apply(broadcast(FactKey::Zookeeper, 2, 1, json!([{"host": "10.0.0.6", "port": 2181}])))?;
    let outcome = facts.apply(broadcast(FactKey::Zookeeper, 1, 9, json!([{"host": "10.0.0.5", "port": 2181}])))?;

    assert!(matches!(outcome, ApplyOutcome::Rejected(_)), "expected stale broadcast to be rejected, got {:?}", outcome);
    let zks = facts.zookeepers()?.unwrap_or_default();
    assert_eq!(zks[0].host, "10.0.0.6", "expected the newer broadcast to remain on record");

    Ok(())
}

#[tokio::test]
async fn apply_never_unformats_hdfs() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;

    assert!(!facts.is_formatted()?, "expected hdfs to be unformatted by default");
    facts.apply(broadcast(FactKey::HdfsFormatted, 1, 1, json!(true)))?;
    let outcome = facts.apply(broadcast(FactKey::HdfsFormatted, 2, 1, json!(false)))?;

    assert!(matches!(outcome, ApplyOutcome::Rejected(_)), "expected unformat broadcast to be rejected, got {:?}", outcome);
    assert!(facts.is_formatted()?, "expected hdfs to remain formatted");

    Ok(())
}

#[tokio::test]
async fn apply_keeps_frozen_peer_lists() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;

    facts.apply(broadcast(FactKey::Cluster, 1, 1, json!(["a", "c", "b"])))?;
    let outcome = facts.apply(broadcast(FactKey::Cluster, 2, 1, json!(["b", "a", "c"])))?;

    assert!(matches!(outcome, ApplyOutcome::Rejected(_)), "expected reordered list to be rejected, got {:?}", outcome);
    let cluster = facts.peer_list(FactKey::Cluster)?.map(|list| list.members().to_vec());
    assert_eq!(cluster, Some(vec!["a".to_string(), "c".to_string(), "b".to_string()]));

    Ok(())
}

#[tokio::test]
async fn apply_refuses_malformed_peer_lists() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;

    let res = facts.apply(broadcast(FactKey::Journal, 1, 1, json!(["a", "b"])));

    assert!(res.is_err(), "expected a 2 member journal list to be refused");
    assert!(facts.get(FactKey::Journal)?.is_none(), "expected nothing to be recorded for a malformed list");

    Ok(())
}

#[tokio::test]
async fn next_version_moves_past_recorded_versions() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;

    facts.apply(broadcast(FactKey::SshKeyPub, 3, 7, json!("ssh-rsa AAAA")))?;
    let v1 = facts.next_version(3)?;
    let v2 = facts.next_version(3)?;
    let v3 = facts.next_version(4)?;

    assert_eq!(v1, Version { term: 3, seq: 8 });
    assert!(v2 > v1, "expected versions to be monotonic, got {:?} then {:?}", v1, v2);
    assert!(v3 > v2, "expected a later term to order after an earlier one, got {:?} then {:?}", v2, v3);

    Ok(())
}

#[tokio::test]
async fn apply_refuses_versions_with_an_exhausted_counter() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;

    let outcome = facts.apply(broadcast(FactKey::Zookeeper, 1, u64::MAX, json!([{"host": "10.0.0.9", "port": 2181}])))?;

    assert!(matches!(outcome, ApplyOutcome::Rejected(_)), "expected an exhausted counter to be rejected, got {:?}", outcome);
    assert!(facts.get(FactKey::Zookeeper)?.is_none(), "expected nothing to be recorded");
    let version = facts.next_version(1)?;
    assert_eq!(version, Version { term: 1, seq: 1 });

    Ok(())
}

#[tokio::test]
async fn next_version_errors_once_the_counter_is_exhausted() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let facts = FactStore::new(&db).await?;
    facts.put_local("broadcast_seq", &u64::MAX)?;

    let res = facts.next_version(1);

    let err = res.expect_err("expected an exhausted counter to fail");
    assert!(err.to_string().contains("exhausted"), "unexpected error {}", err);
    Ok(())
}

#[tokio::test]
async fn flags_survive_reopening_the_store() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    {
        let facts = FactStore::new(&db).await?;
        facts.set_flag(Flag::JournalStarted)?;
        facts.set_flag(Flag::NamenodeReady)?;
        facts.clear_flag(Flag::NamenodeReady)?;
    }

    let facts = FactStore::new(&db).await?;
    assert!(facts.flag(Flag::JournalStarted)?, "expected journal.started to be persisted");
    assert!(!facts.flag(Flag::NamenodeReady)?, "expected namenode.ready to be cleared");

    Ok(())
}
