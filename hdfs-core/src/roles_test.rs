use anyhow::Result;

use crate::model::{PeerList, Role, SetupMode, ZkMember};
use crate::roles::*;

fn peers() -> Result<PeerList> {
    Ok(PeerList::new(vec!["nn-a.local".into(), "nn-c.local".into(), "nn-b.local".into()])?)
}

#[test]
fn assign_role_maps_positions_to_distinct_roles() -> Result<()> {
    let peers = peers()?;

    assert_eq!(assign_role("nn-a.local", &peers), Role::Primary);
    assert_eq!(assign_role("nn-c.local", &peers), Role::Secondary);
    assert_eq!(assign_role("nn-b.local", &peers), Role::JournalOnly);
    assert_eq!(assign_role("nn-z.local", &peers), Role::Unranked);

    // Identical inputs always yield identical outputs.
    for _ in 0..10 {
        assert_eq!(assign_role("nn-c.local", &peers), Role::Secondary);
    }
    Ok(())
}

#[test]
fn require_role_rejects_unranked_units() -> Result<()> {
    let peers = peers()?;
    let err = require_role("nn-z.local", &peers).expect_err("expected unranked unit to be rejected");
    assert!(err.is_protocol_violation(), "expected protocol violation, got {:?}", err);
    Ok(())
}

#[test]
fn peer_list_rejects_invalid_sizes_and_duplicates() {
    let too_short = PeerList::new(vec!["a".into(), "b".into()]);
    assert!(matches!(too_short, Err(ref err) if err.is_protocol_violation()), "expected size violation, got {:?}", too_short);

    let dup = PeerList::new(vec!["a".into(), "b".into(), "a".into()]);
    assert!(matches!(dup, Err(ref err) if err.is_protocol_violation()), "expected duplicate violation, got {:?}", dup);

    let decoded: Result<PeerList, _> = serde_json::from_str(r#"["a","b","c","d"]"#);
    assert!(decoded.is_err(), "expected oversized list to fail to decode");
}

#[test]
fn shared_edits_uri_uses_frozen_order() -> Result<()> {
    let uri = shared_edits_uri(&peers()?);
    assert_eq!(uri, "qjournal://nn-a.local:8485;nn-c.local:8485;nn-b.local:8485/ha-nn-uri");
    Ok(())
}

#[test]
fn build_overrides_manual_ha() -> Result<()> {
    let extra = build_overrides(SetupMode::ManualHa, &peers()?, None)?;

    assert_eq!(extra.get(KEY_STANDBY_HEAD_NODE), Some(&OverrideValue::from("nn-c.local")));
    assert_eq!(extra.get(KEY_HA_MODE), Some(&OverrideValue::from("manual")));
    assert_eq!(extra.get(KEY_SSHFENCE_USER), Some(&OverrideValue::from("hdfs")));
    assert_eq!(
        extra.get(KEY_NAMENODE_HOST),
        Some(&OverrideValue::List(vec!["nn-a.local".into(), "nn-c.local".into()]))
    );
    assert_eq!(
        extra.get(KEY_ROLES),
        Some(&OverrideValue::List(vec!["namenode".into(), "mapred-app".into(), "standby-namenode".into()]))
    );
    assert!(extra.get(KEY_ZK_QUORUM).is_none(), "manual HA must not carry a zookeeper quorum");
    Ok(())
}

#[test]
fn build_overrides_auto_ha_only_changes_failover_fields() -> Result<()> {
    let peers = peers()?;
    let manual = build_overrides(SetupMode::ManualHa, &peers, None)?;
    let auto = build_overrides(SetupMode::AutoHa, &peers, Some("10.0.0.5:2181"))?;

    assert_eq!(auto.get(KEY_HA_MODE), Some(&OverrideValue::from("auto")));
    assert_eq!(auto.get(KEY_ZK_QUORUM), Some(&OverrideValue::from("10.0.0.5:2181")));
    for key in [KEY_SHARED_EDITS_DIR, KEY_SSHFENCE_PRIVKEY, KEY_SSHFENCE_PUBKEY, KEY_SSHFENCE_USER, KEY_STANDBY_HEAD_NODE] {
        assert_eq!(auto.get(key), manual.get(key), "expected {} to be unaffected by failover mode", key);
    }

    let err = build_overrides(SetupMode::AutoHa, &peers, None).expect_err("expected missing quorum to be rejected");
    assert!(err.is_protocol_violation(), "expected protocol violation, got {:?}", err);
    Ok(())
}

#[test]
fn build_overrides_non_ha_is_empty() -> Result<()> {
    let extra = build_overrides(SetupMode::NonHa, &peers()?, None)?;
    assert!(extra.is_empty(), "expected no overrides for non-HA, got {:?}", extra);
    Ok(())
}

#[test]
fn quorum_connection_string_is_canonical() {
    let a = quorum_connection_string(vec![("10.0.0.7", 2181), ("10.0.0.5", 2181)]);
    let b = quorum_connection_string(vec![("10.0.0.5", 2181), ("10.0.0.7", 2181), ("10.0.0.5", 2181)]);
    assert_eq!(a, "10.0.0.5:2181,10.0.0.7:2181");
    assert_eq!(a, b);
}

#[test]
fn zk_member_accepts_string_ports() -> Result<()> {
    let members: Vec<ZkMember> = serde_json::from_str(r#"[{"host":"10.0.0.5","port":"2181"},{"host":"10.0.0.6","port":2181}]"#)?;
    assert_eq!(members, vec![ZkMember::new("10.0.0.5", 2181), ZkMember::new("10.0.0.6", 2181)]);
    Ok(())
}
