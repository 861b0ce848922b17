//! Datanode & client relation handling.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::config::Config;
use crate::facts::{FactStore, Flag};
use crate::gateway::{Gateway, Status};
use hdfs_core::model::{Downstream, FactKey, NamenodeInfo, Role, SetupMode};

/// The local key of the set of related datanode units.
const KEY_DATANODES: &str = "downstream/datanodes";
/// The local key of the hosts map, address to hostname.
const KEY_HOSTS_MAP: &str = "downstream/hosts_map";
/// The local key set while at least one client is related.
const KEY_CLIENTS: &str = "downstream/clients";

/// Placeholder sent to datanodes, which requires the field but does not use it.
const SSH_KEY_PLACEHOLDER: &str = "invalid";

/// Record a joined datanode and its host entry.
pub(super) fn datanode_joined(facts: &FactStore, unit: &str, address: Option<&str>, hostname: Option<&str>) -> Result<()> {
    let mut datanodes = datanodes(facts)?;
    datanodes.insert(unit.to_string());
    facts.put_local(KEY_DATANODES, &datanodes)?;
    if let (Some(address), Some(hostname)) = (address, hostname) {
        let mut hosts = hosts_map(facts)?;
        hosts.insert(address.to_string(), hostname.to_string());
        facts.put_local(KEY_HOSTS_MAP, &hosts)?;
    }
    Ok(())
}

/// Forget a departing datanode and remove its host entries.
pub(super) fn datanode_departed(facts: &FactStore, unit: &str, hostname: Option<&str>) -> Result<()> {
    tracing::info!(unit, "datanode leaving");
    let mut datanodes = datanodes(facts)?;
    datanodes.remove(unit);
    facts.put_local(KEY_DATANODES, &datanodes)?;
    if let Some(hostname) = hostname {
        let mut hosts = hosts_map(facts)?;
        hosts.retain(|_, name| name != hostname);
        facts.put_local(KEY_HOSTS_MAP, &hosts)?;
    }
    Ok(())
}

/// Forget every datanode, as the relation is gone.
pub(super) fn datanodes_gone(facts: &FactStore) -> Result<()> {
    facts.remove_local(KEY_DATANODES)
}

pub(super) fn clients_changed(facts: &FactStore, joined: bool) -> Result<()> {
    if joined {
        facts.put_local(KEY_CLIENTS, &true)
    } else {
        facts.remove_local(KEY_CLIENTS)
    }
}

fn datanodes(facts: &FactStore) -> Result<BTreeSet<String>> {
    Ok(facts.get_local(KEY_DATANODES)?.unwrap_or_default())
}

fn hosts_map(facts: &FactStore) -> Result<BTreeMap<String, String>> {
    Ok(facts.get_local(KEY_HOSTS_MAP)?.unwrap_or_default())
}

/// The namenodes known to this unit.
///
/// A non-HA deployment only has this unit. An HA deployment has the first two members of the
/// frozen cluster list, and none before that list exists.
pub fn namenodes(config: &Config, mode: SetupMode, facts: &FactStore) -> Result<Option<Vec<String>>> {
    if !mode.is_ha() {
        return Ok(Some(vec![config.fqdn.clone()]));
    }
    Ok(facts
        .peer_list(FactKey::Cluster)?
        .map(|list| vec![list.primary().to_string(), list.secondary().to_string()]))
}

/// Serve the datanode & client relations, returning the status to report once running.
///
/// Before the namenode has started, related units only get enough info to start their own
/// install. Afterwards they get everything, and readiness follows the datanode relation. The
/// status of a running unit names the role it runs in.
#[tracing::instrument(level = "debug", skip(config, facts, gateway))]
pub(super) async fn serve(config: &Config, mode: SetupMode, role: Option<Role>, facts: &FactStore, gateway: &Gateway) -> Result<Option<Status>> {
    let datanodes = datanodes(facts)?;
    let has_clients = facts.get_local::<bool>(KEY_CLIENTS)?.unwrap_or(false);
    let namenodes = namenodes(config, mode, facts)?;

    if !facts.flag(Flag::NamenodeStarted)? {
        let early = NamenodeInfo {
            namenodes,
            hdfs_port: config.hdfs_port,
            webhdfs_port: config.webhdfs_port,
            ..Default::default()
        };
        if !datanodes.is_empty() {
            gateway.relations.send_namenode_info(Downstream::Datanode, &early).await?;
        }
        if has_clients {
            gateway.relations.send_namenode_info(Downstream::Client, &early).await?;
        }
        return Ok(None);
    }

    let mut hosts = hosts_map(facts)?;
    if let Some(address) = config.private_address.as_ref() {
        hosts.insert(address.clone(), config.fqdn.clone());
    }
    let status = if datanodes.is_empty() {
        facts.clear_flag(Flag::NamenodeReady)?;
        running_status(role, "hdfs requires a datanode relation")
    } else {
        let info = NamenodeInfo {
            namenodes: namenodes.clone(),
            hdfs_port: config.hdfs_port,
            webhdfs_port: config.webhdfs_port,
            spec_version: Some(config.spec_version.clone()),
            hosts_map: Some(hosts.clone()),
            cluster_name: Some(config.cluster_name.clone()),
            ssh_key: Some(SSH_KEY_PLACEHOLDER.into()),
            ready: None,
        };
        gateway.relations.send_namenode_info(Downstream::Datanode, &info).await?;
        facts.set_flag(Flag::NamenodeReady)?;
        if facts.flag(Flag::JournalOnly)? {
            Status::active("ready - journal node only")
        } else {
            let count = datanodes.len();
            running_status(role, &format!("ready ({} datanode{})", count, if count > 1 { "s" } else { "" }))
        }
    };

    if has_clients {
        let info = NamenodeInfo {
            namenodes,
            hdfs_port: config.hdfs_port,
            webhdfs_port: config.webhdfs_port,
            spec_version: Some(config.spec_version.clone()),
            hosts_map: Some(hosts),
            cluster_name: Some(config.cluster_name.clone()),
            ssh_key: None,
            ready: Some(facts.flag(Flag::NamenodeReady)?),
        };
        gateway.relations.send_namenode_info(Downstream::Client, &info).await?;
    }
    Ok(Some(status))
}

fn running_status(role: Option<Role>, detail: &str) -> Status {
    match role {
        Some(Role::JournalOnly) => Status::active(format!("{} - journal node only", detail)),
        Some(role) => Status::active(format!("{} - {} namenode", detail, role)),
        None => Status::active(detail),
    }
}
