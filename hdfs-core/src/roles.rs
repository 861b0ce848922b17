//! Role assignment and installer override derivation.
//!
//! Everything here is a pure function of the frozen peer list, the setup mode and the
//! ZooKeeper quorum. Given the same inputs, every unit of the deployment derives the same
//! roles and the same configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{PeerList, Role, SetupMode};
use crate::AppError;

/// The port on which journal nodes accept shared edits.
pub const JOURNAL_PORT: u16 = 8485;
/// The HA nameservice id used in the shared edits URI and the namenode URI.
pub const NAMESERVICE_ID: &str = "ha-nn-uri";
/// The HA service id of the first namenode, as assigned by the installer.
pub const FIRST_NAMENODE_SERVICE_ID: &str = "nn1";
/// The roles applied when installing an HA namenode.
///
/// The journal node is deliberately absent so that it is not restarted by the installer.
pub const HA_NAMENODE_ROLES: [&str; 3] = ["namenode", "mapred-app", "standby-namenode"];
/// The roles applied when installing a non-HA namenode.
pub const NAMENODE_ROLES: [&str; 2] = ["namenode", "mapred-app"];
/// The roles applied when installing a journal node.
pub const JOURNAL_ROLES: [&str; 1] = ["journalnode"];

pub const KEY_STANDBY_HEAD_NODE: &str = "bigtop::standby_head_node";
pub const KEY_ROLES: &str = "bigtop::roles";
pub const KEY_HA_MODE: &str = "hadoop::common_hdfs::ha";
pub const KEY_SSHFENCE_USER_HOME: &str = "hadoop::common_hdfs::hadoop_ha_sshfence_user_home";
pub const KEY_SSHFENCE_PRIVKEY: &str = "hadoop::common_hdfs::sshfence_privkey";
pub const KEY_SSHFENCE_PUBKEY: &str = "hadoop::common_hdfs::sshfence_pubkey";
pub const KEY_SSHFENCE_USER: &str = "hadoop::common_hdfs::sshfence_user";
pub const KEY_NAMESERVICE_ID: &str = "hadoop::common_hdfs::hadoop_ha_nameservice_id";
pub const KEY_NAMENODE_URI: &str = "hadoop_cluster_node::hadoop_namenode_uri";
pub const KEY_NAMENODE_HOST: &str = "hadoop::common_hdfs::hadoop_namenode_host";
pub const KEY_SHARED_EDITS_DIR: &str = "hadoop::common_hdfs::shared_edits_dir";
pub const KEY_ZK_QUORUM: &str = "hadoop::zk";

/// A single installer override value.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OverrideValue {
    Str(String),
    List(Vec<String>),
}

impl From<&str> for OverrideValue {
    fn from(val: &str) -> Self {
        Self::Str(val.to_string())
    }
}

impl From<String> for OverrideValue {
    fn from(val: String) -> Self {
        Self::Str(val)
    }
}

impl From<Vec<String>> for OverrideValue {
    fn from(val: Vec<String>) -> Self {
        Self::List(val)
    }
}

/// Installer overrides, ordered by key for deterministic rendering.
pub type Overrides = BTreeMap<String, OverrideValue>;

/// Assign a role to the given unit based on its position in the frozen peer list.
pub fn assign_role(unit: &str, peers: &PeerList) -> Role {
    match peers.position(unit) {
        Some(0) => Role::Primary,
        Some(1) => Role::Secondary,
        Some(2) => Role::JournalOnly,
        _ => Role::Unranked,
    }
}

/// Assign a role, treating a unit outside of the frozen list as a protocol violation.
pub fn require_role(unit: &str, peers: &PeerList) -> Result<Role, AppError> {
    match assign_role(unit, peers) {
        Role::Unranked => Err(AppError::ProtocolViolation(format!(
            "unit {} is not a member of the frozen peer list {:?}",
            unit,
            peers.members()
        ))),
        role => Ok(role),
    }
}

/// Build the shared edits URI of the journal quorum, in frozen list order.
pub fn shared_edits_uri(peers: &PeerList) -> String {
    format!(
        "qjournal://{}:{port};{}:{port};{}:{port}/{}",
        peers.primary(),
        peers.secondary(),
        peers.third(),
        NAMESERVICE_ID,
        port = JOURNAL_PORT,
    )
}

/// Build the overrides common to every HA role: standby designation, fencing and shared edits.
///
/// These values do not depend on the failover mode, which is why journal node installation
/// can use them before a ZooKeeper quorum is known.
pub fn base_ha_overrides(peers: &PeerList) -> Overrides {
    let mut extra = Overrides::new();
    extra.insert(KEY_STANDBY_HEAD_NODE.into(), peers.secondary().into());
    extra.insert(KEY_HA_MODE.into(), "manual".into());
    extra.insert(KEY_SSHFENCE_USER_HOME.into(), "/var/lib/hadoop-hdfs".into());
    extra.insert(KEY_SSHFENCE_PRIVKEY.into(), "id_rsa".into());
    extra.insert(KEY_SSHFENCE_PUBKEY.into(), "id_rsa.pub".into());
    extra.insert(KEY_SSHFENCE_USER.into(), "hdfs".into());
    extra.insert(KEY_NAMESERVICE_ID.into(), NAMESERVICE_ID.into());
    extra.insert(KEY_NAMENODE_URI.into(), "hdfs://%{hiera('hadoop_ha_nameservice_id')}:8020".into());
    extra.insert(KEY_NAMENODE_HOST.into(), vec![peers.primary().to_string(), peers.secondary().to_string()].into());
    extra.insert(KEY_SHARED_EDITS_DIR.into(), shared_edits_uri(peers).into());
    extra
}

/// Build the overrides used to install a namenode in the given setup mode.
///
/// `AutoHa` requires the ZooKeeper quorum connection string; it switches the HA mode to
/// `auto` and injects the quorum. A non-HA setup has no overrides at all.
pub fn build_overrides(mode: SetupMode, peers: &PeerList, zk_quorum: Option<&str>) -> Result<Overrides, AppError> {
    let mut extra = match mode {
        SetupMode::NonHa => return Ok(Overrides::new()),
        SetupMode::ManualHa | SetupMode::AutoHa => base_ha_overrides(peers),
    };
    if mode == SetupMode::AutoHa {
        let quorum = match zk_quorum {
            Some(quorum) if !quorum.is_empty() => quorum,
            _ => return Err(AppError::ProtocolViolation("auto failover requires a zookeeper quorum".into())),
        };
        extra.insert(KEY_HA_MODE.into(), "auto".into());
        extra.insert(KEY_ZK_QUORUM.into(), quorum.into());
    }
    extra.insert(
        KEY_ROLES.into(),
        HA_NAMENODE_ROLES.iter().map(|role| role.to_string()).collect::<Vec<_>>().into(),
    );
    Ok(extra)
}

/// Build the canonical quorum connection string from resolved `(address, port)` pairs.
///
/// Members are rendered as `address:port`, sorted lexicographically and comma-joined, so
/// that the same member set always yields the same string.
pub fn quorum_connection_string<'a, I>(members: I) -> String
where
    I: IntoIterator<Item = (&'a str, u16)>,
{
    let mut zks: Vec<String> = members.into_iter().map(|(addr, port)| format!("{}:{}", addr, port)).collect();
    zks.sort();
    zks.dedup();
    zks.join(",")
}
