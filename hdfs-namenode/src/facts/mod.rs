//! The fact store.
//!
//! Two kinds of facts are kept here, each in its own DB tree:
//!
//! - The unit's replica of the leader broadcast data. Every broadcast fact is stored as a
//! versioned envelope. The version is `(term, seq)` where `term` is the leadership term of the
//! publishing leader and `seq` is that leader's publish counter. A replica only ever moves
//! forward: broadcasts carrying an older version than the one on record are rejected, which is
//! how late publishes of a deposed leader are discarded.
//! - Unit-local flags and bookkeeping values, which are never broadcast.
//!
//! Every mutation is flushed before returning, so a completed step survives a crash.

#[cfg(test)]
mod mod_test;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::database::{Database, Tree};
use crate::error::{AppError, ShutdownError, ERR_DB_FLUSH};
use crate::gateway::Relations;
use hdfs_core::model::{FactKey, PeerList, ZkMember};

/// The local key of the leader's broadcast publish counter.
const KEY_BROADCAST_SEQ: &str = "broadcast_seq";

/// The version of a broadcast fact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Version {
    /// The leadership term of the publishing leader.
    pub term: u64,
    /// The publish counter of the publishing leader.
    pub seq: u64,
}

/// A versioned broadcast fact, as published by the leader.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Broadcast {
    pub key: FactKey,
    pub version: Version,
    pub value: serde_json::Value,
}

/// The outcome of applying a broadcast to the local replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The fact's value changed, transitions depending on it may fire.
    Changed,
    /// The fact's value is identical to the one on record.
    Unchanged,
    /// The broadcast was discarded, e.g. it is stale or would break a one-way fact.
    Rejected(String),
}

/// Unit-local lifecycle flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    /// The fencing key dir is served to the installer.
    FilesMountAdded,
    /// The journal node has been installed and started on this unit.
    JournalStarted,
    /// The fencing public key has been installed.
    SshPubReady,
    /// The fencing private key has been installed.
    SshPrivReady,
    /// The leader's format of HDFS succeeded, whether or not it has been published yet.
    FormatCompleted,
    /// The standby bootstrap has completed on this (secondary) unit.
    StandbyBootstrapped,
    /// The namenode install sub-machine has completed.
    NamenodeInstalled,
    /// The namenode has been started (or deliberately stopped, for journal-only units).
    NamenodeStarted,
    /// This unit only runs a journal node.
    JournalOnly,
    /// HDFS is ready to serve, i.e. at least one datanode is related.
    NamenodeReady,
    /// The failover daemon was stopped for a quorum rewrite and must be started again.
    ZkfcRestartPending,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FilesMountAdded => "flag/puppet.files_mount",
            Self::JournalStarted => "flag/journal.started",
            Self::SshPubReady => "flag/ssh_pub.ready",
            Self::SshPrivReady => "flag/ssh_priv.ready",
            Self::FormatCompleted => "flag/hdfs.format_completed",
            Self::StandbyBootstrapped => "flag/standby.bootstrapped",
            Self::NamenodeInstalled => "flag/namenode.installed",
            Self::NamenodeStarted => "flag/namenode.started",
            Self::JournalOnly => "flag/journalnode.only",
            Self::NamenodeReady => "flag/namenode.ready",
            Self::ZkfcRestartPending => "flag/zkfc.restart_pending",
        }
    }
}

/// Durable key/value state of this unit.
#[derive(Clone)]
pub struct FactStore {
    /// This unit's replica of the leader broadcast data.
    leadership: Tree,
    /// This unit's local state.
    local: Tree,
}

impl FactStore {
    /// Create a new instance over the given database.
    pub async fn new(db: &Database) -> Result<Self> {
        let leadership = db.get_leadership_tree().await?;
        let local = db.get_local_tree().await?;
        Ok(Self { leadership, local })
    }

    //////////////////////////////////////////////////////////////////////////
    // Broadcast Replica /////////////////////////////////////////////////////

    /// Get the broadcast envelope of the given fact, if any has been received.
    pub fn get(&self, key: FactKey) -> Result<Option<Broadcast>> {
        let raw = match self.leadership.get(key.as_str()).context("error reading broadcast fact")? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let broadcast = serde_json::from_slice(&raw).map_err(|err| AppError::InvalidFact {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Some(broadcast))
    }

    /// Get the decoded value of the given fact, if any has been received.
    pub fn get_value<T: DeserializeOwned>(&self, key: FactKey) -> Result<Option<T>> {
        match self.get(key)? {
            Some(broadcast) => Ok(Some(decode_value(key, broadcast.value)?)),
            None => Ok(None),
        }
    }

    /// The frozen peer list published under the given key.
    pub fn peer_list(&self, key: FactKey) -> Result<Option<PeerList>> {
        self.get_value(key)
    }

    /// The ZooKeeper members published by the leader, `None` when unpublished or empty.
    pub fn zookeepers(&self) -> Result<Option<Vec<ZkMember>>> {
        Ok(self.get_value::<Vec<ZkMember>>(FactKey::Zookeeper)?.filter(|members| !members.is_empty()))
    }

    /// Check if the leader has recorded HDFS as formatted.
    pub fn is_formatted(&self) -> Result<bool> {
        Ok(self.get_value::<bool>(FactKey::HdfsFormatted)?.unwrap_or(false))
    }

    /// Apply the given broadcast to the local replica.
    ///
    /// Structurally invalid facts are errors, as acting on them would mean guessing. Stale
    /// versions and attempts to move a one-way fact backwards are rejected and left for the
    /// caller to log.
    #[tracing::instrument(level = "debug", skip(self, broadcast), fields(key = %broadcast.key))]
    pub fn apply(&self, broadcast: Broadcast) -> Result<ApplyOutcome> {
        validate_broadcast(&broadcast)?;
        if broadcast.version.seq == u64::MAX {
            return Ok(ApplyOutcome::Rejected(format!("version {:?} leaves no room for a later publish", broadcast.version)));
        }
        let current = self.get(broadcast.key)?;
        if let Some(current) = current.as_ref() {
            if broadcast.version < current.version {
                return Ok(ApplyOutcome::Rejected(format!(
                    "stale version {:?}, have {:?}",
                    broadcast.version, current.version
                )));
            }
            if broadcast.value == current.value {
                return Ok(ApplyOutcome::Unchanged);
            }
            match broadcast.key {
                FactKey::Cluster | FactKey::Journal => {
                    return Ok(ApplyOutcome::Rejected("frozen peer list can not change".into()));
                }
                FactKey::HdfsFormatted if current.value == serde_json::Value::Bool(true) => {
                    return Ok(ApplyOutcome::Rejected("hdfs can not become unformatted".into()));
                }
                _ => (),
            }
        }

        let raw = serde_json::to_vec(&broadcast).context("error encoding broadcast fact")?;
        self.leadership
            .insert(broadcast.key.as_str(), raw)
            .context("error writing broadcast fact")?;
        flush(&self.leadership)?;
        Ok(ApplyOutcome::Changed)
    }

    /// Build the version for the next publish of the leader in the given term.
    ///
    /// The counter is durable, and is always bumped past every version already on record so
    /// that a publish is never rejected as stale by this unit's own replica.
    pub fn next_version(&self, term: u64) -> Result<Version> {
        let mut seq = self.get_local::<u64>(KEY_BROADCAST_SEQ)?.unwrap_or(0);
        for key in FactKey::ALL.iter() {
            if let Some(current) = self.get(*key)? {
                if current.version.term == term {
                    seq = seq.max(current.version.seq);
                }
            }
        }
        let seq = seq
            .checked_add(1)
            .ok_or_else(|| AppError::ProtocolViolation(format!("publish counter of term {} is exhausted", term)))?;
        let version = Version { term, seq };
        self.put_local(KEY_BROADCAST_SEQ, &version.seq)?;
        Ok(version)
    }

    /// Publish the given fact as the leader of the given term.
    ///
    /// The fact is handed to the relation transport first and only then applied to the local
    /// replica, so a failed send leaves the replica untouched and the publish is retried on the
    /// next pass. Publishing a value identical to the one on record is a no-op.
    #[tracing::instrument(level = "debug", skip(self, relations, value))]
    pub async fn publish(&self, relations: &dyn Relations, term: u64, key: FactKey, value: serde_json::Value) -> Result<ApplyOutcome> {
        if let Some(current) = self.get(key)? {
            if current.value == value {
                return Ok(ApplyOutcome::Unchanged);
            }
        }
        let broadcast = Broadcast {
            key,
            version: self.next_version(term)?,
            value,
        };
        validate_broadcast(&broadcast)?;
        relations
            .leader_set(&broadcast)
            .await
            .map_err(|err| AppError::action("leader-set", err))?;
        let outcome = self.apply(broadcast)?;
        if let ApplyOutcome::Rejected(reason) = &outcome {
            tracing::warn!(%key, %reason, "own publish rejected by local replica");
        }
        Ok(outcome)
    }

    //////////////////////////////////////////////////////////////////////////
    // Local State ///////////////////////////////////////////////////////////

    /// Check the given local flag.
    pub fn flag(&self, flag: Flag) -> Result<bool> {
        Ok(self.local.contains_key(flag.as_str()).context("error reading local flag")?)
    }

    /// Set the given local flag.
    pub fn set_flag(&self, flag: Flag) -> Result<()> {
        self.local
            .insert(flag.as_str(), vec![1u8])
            .context("error writing local flag")?;
        flush(&self.local)?;
        Ok(())
    }

    /// Clear the given local flag.
    pub fn clear_flag(&self, flag: Flag) -> Result<()> {
        self.local.remove(flag.as_str()).context("error clearing local flag")?;
        flush(&self.local)?;
        Ok(())
    }

    /// Get a JSON encoded local value.
    pub fn get_local<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.local.get(key).context("error reading local value")? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).with_context(|| format!("error decoding local value {}", key))?)),
            None => Ok(None),
        }
    }

    /// Store a JSON encoded local value.
    pub fn put_local<T: Serialize>(&self, key: &str, val: &T) -> Result<()> {
        let raw = serde_json::to_vec(val).context("error encoding local value")?;
        self.local.insert(key, raw).context("error writing local value")?;
        flush(&self.local)?;
        Ok(())
    }

    /// Remove a local value.
    pub fn remove_local(&self, key: &str) -> Result<()> {
        self.local.remove(key).context("error removing local value")?;
        flush(&self.local)?;
        Ok(())
    }
}

/// Flush the given tree. A failed flush leaves the database unusable, so it requires shutdown.
fn flush(tree: &Tree) -> Result<()> {
    tree.flush().map_err(|err| ShutdownError(anyhow::Error::from(err).context(ERR_DB_FLUSH)))?;
    Ok(())
}

/// Decode the value of a broadcast fact.
fn decode_value<T: DeserializeOwned>(key: FactKey, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|err| {
        AppError::InvalidFact {
            key: key.to_string(),
            reason: err.to_string(),
        }
        .into()
    })
}

/// Validate the shape of the given broadcast's value for its key.
fn validate_broadcast(broadcast: &Broadcast) -> Result<()> {
    let value = broadcast.value.clone();
    match broadcast.key {
        FactKey::Cluster | FactKey::Journal => {
            let members: Vec<String> = decode_value(broadcast.key, value)?;
            PeerList::new(members)?;
        }
        FactKey::Zookeeper => {
            let _: Vec<ZkMember> = decode_value(broadcast.key, value)?;
        }
        FactKey::HdfsFormatted => {
            let _: bool = decode_value(broadcast.key, value)?;
        }
        FactKey::SshKeyPub | FactKey::SshKeyPriv => {
            let _: String = decode_value(broadcast.key, value)?;
        }
    }
    Ok(())
}
