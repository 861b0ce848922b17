//! Data models shared between the namenode agent components.

use std::collections::{BTreeMap, HashSet};
use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{AppError, HA_CLUSTER_SIZE};

/// The class of role for which units announce readiness to the leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleClass {
    /// Namenode cluster membership.
    Cluster,
    /// Units with a running journal node.
    Journal,
}

impl RoleClass {
    /// The number of members required before the leader freezes the class's peer list.
    pub fn required(&self) -> usize {
        HA_CLUSTER_SIZE
    }

    /// The broadcast fact under which the frozen peer list of this class is published.
    pub fn fact_key(&self) -> FactKey {
        match self {
            Self::Cluster => FactKey::Cluster,
            Self::Journal => FactKey::Journal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Journal => "journal",
        }
    }
}

impl fmt::Display for RoleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The keys of the leader-held broadcast data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FactKey {
    /// JSON array of the 3 namenode cluster FQDNs.
    #[serde(rename = "cluster")]
    Cluster,
    /// JSON array of the 3 journal node FQDNs.
    #[serde(rename = "journal")]
    Journal,
    /// JSON array of `{host, port}` ZooKeeper members.
    #[serde(rename = "zookeeper")]
    Zookeeper,
    /// Set once HDFS has been formatted by the leader.
    #[serde(rename = "hdfs_formatted")]
    HdfsFormatted,
    /// The public half of the fencing key pair.
    #[serde(rename = "ssh-key-pub")]
    SshKeyPub,
    /// The private half of the fencing key pair.
    #[serde(rename = "ssh-key-priv")]
    SshKeyPriv,
}

impl FactKey {
    pub const ALL: [FactKey; 6] = [
        FactKey::Cluster,
        FactKey::Journal,
        FactKey::Zookeeper,
        FactKey::HdfsFormatted,
        FactKey::SshKeyPub,
        FactKey::SshKeyPriv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Journal => "journal",
            Self::Zookeeper => "zookeeper",
            Self::HdfsFormatted => "hdfs_formatted",
            Self::SshKeyPub => "ssh-key-pub",
            Self::SshKeyPriv => "ssh-key-priv",
        }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frozen, ordered list of namenode peers.
///
/// The list always holds exactly `HA_CLUSTER_SIZE` distinct members. Position determines
/// role: index 0 is the primary (the leader which froze the list), index 1 the secondary and
/// index 2 is journal-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PeerList(Vec<String>);

impl PeerList {
    /// Create a new instance, validating the size and uniqueness of the given members.
    pub fn new(members: Vec<String>) -> Result<Self, AppError> {
        if members.len() != HA_CLUSTER_SIZE {
            return Err(AppError::ProtocolViolation(format!(
                "peer list must contain exactly {} members, got {}",
                HA_CLUSTER_SIZE,
                members.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = members.iter().find(|member| !seen.insert(member.as_str())) {
            return Err(AppError::ProtocolViolation(format!("peer list contains duplicate member {}", dup)));
        }
        if members.iter().any(|member| member.is_empty()) {
            return Err(AppError::ProtocolViolation("peer list contains an empty member".into()));
        }
        Ok(Self(members))
    }

    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    pub fn secondary(&self) -> &str {
        &self.0[1]
    }

    pub fn third(&self) -> &str {
        &self.0[2]
    }

    /// The position of the given unit in this list, if it is a member.
    pub fn position(&self, unit: &str) -> Option<usize> {
        self.0.iter().position(|member| member == unit)
    }

    pub fn members(&self) -> &[String] {
        &self.0
    }
}

impl TryFrom<Vec<String>> for PeerList {
    type Error = AppError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerList> for Vec<String> {
    fn from(list: PeerList) -> Self {
        list.0
    }
}

/// A ZooKeeper quorum member as reported over the zookeeper relation.
///
/// Ordering is by host then port, which gives the canonical order of the quorum.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct ZkMember {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
}

impl ZkMember {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

/// Relation data carries ports as either numbers or strings.
fn deserialize_port<'de, D: serde::Deserializer<'de>>(val: D) -> Result<u16, D::Error> {
    use serde::de::Error as DeError;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(u16),
        Str(String),
    }
    match Port::deserialize(val)? {
        Port::Num(port) => Ok(port),
        Port::Str(port) => port.trim().parse().map_err(|_| DeError::custom(format!("invalid port {:?}", port))),
    }
}

/// The deployment's setup mode, fixed at first evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupMode {
    /// A single namenode, no journal quorum.
    NonHa,
    /// Three namenode units with operator-triggered failover.
    ManualHa,
    /// Three namenode units with ZooKeeper-coordinated failover.
    AutoHa,
}

impl SetupMode {
    /// Derive the setup mode from the charm config flags.
    pub fn from_flags(ha_setup: bool, auto_failover: bool) -> Self {
        match (ha_setup, auto_failover) {
            (false, _) => Self::NonHa,
            (true, false) => Self::ManualHa,
            (true, true) => Self::AutoHa,
        }
    }

    pub fn is_ha(&self) -> bool {
        !matches!(self, Self::NonHa)
    }
}

impl fmt::Display for SetupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NonHa => "non-ha",
            Self::ManualHa => "manual-ha",
            Self::AutoHa => "auto-ha",
        })
    }
}

/// The role of a unit in an HA deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Index 0 of the frozen list; formats HDFS and runs the first namenode.
    Primary,
    /// Index 1; bootstraps from the primary and runs the standby namenode.
    Secondary,
    /// Index 2; runs only the journal node.
    JournalOnly,
    /// Not a member of the frozen list.
    Unranked,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::JournalOnly => "journal-only",
            Self::Unranked => "unranked",
        })
    }
}

/// The downstream relations served by the namenode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Downstream {
    /// The dfs-slave relation of datanodes.
    Datanode,
    /// The dfs relation of clients (plugins, resource managers, ...).
    Client,
}

impl Downstream {
    pub fn relation_name(&self) -> &'static str {
        match self {
            Self::Datanode => "datanode",
            Self::Client => "namenode",
        }
    }
}

/// Relation data sent from the namenode to its datanodes and clients.
///
/// Early install info only carries the namenodes (when known) and ports; all other fields are
/// populated once the namenode has started.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamenodeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namenodes: Option<Vec<String>>,
    pub hdfs_port: u16,
    pub webhdfs_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts_map: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}
