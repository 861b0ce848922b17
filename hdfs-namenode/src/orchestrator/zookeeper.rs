//! ZooKeeper quorum hookup for automatic failover.
//!
//! The leader republishes the members reported over the zookeeper relation whenever the set
//! changes. Every unit converges its failover daemon onto the published quorum with a
//! stop-rewrite-start cycle. The restart is tracked by a durable flag, so a pass aborted
//! after the stop still restarts the daemon on the next pass.

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::{anyhow, Context, Result};

use crate::error::AppError;
use crate::facts::{ApplyOutcome, FactStore, Flag};
use crate::gateway::{Gateway, CORE_SITE, SERVICE_ZKFC};
use hdfs_core::model::{FactKey, ZkMember};
use hdfs_core::roles::quorum_connection_string;

/// The local key of the ZooKeeper members last reported to the leader.
pub(super) const KEY_ZK_REPORTED: &str = "zookeeper/reported";
/// The local key of the quorum string last written for the failover daemon.
pub(super) const KEY_ZKFC_APPLIED_QUORUM: &str = "zookeeper/applied_quorum";
/// The site property holding the failover daemon's quorum.
const PROP_ZK_QUORUM: &str = "ha.zookeeper.quorum";

/// Record the members currently reported over the zookeeper relation. Leader only.
pub(super) fn record_members(facts: &FactStore, mut members: Vec<ZkMember>) -> Result<()> {
    members.sort();
    members.dedup();
    facts.put_local(KEY_ZK_REPORTED, &members)
}

/// Publish the reported members if they differ from the published set. Leader only.
///
/// An empty member set is never published.
#[tracing::instrument(level = "debug", skip(facts, gateway))]
pub(super) async fn publish_members(facts: &FactStore, gateway: &Gateway, term: u64) -> Result<bool> {
    let members: Vec<ZkMember> = facts.get_local(KEY_ZK_REPORTED)?.unwrap_or_default();
    if members.is_empty() {
        return Ok(false);
    }
    let value = serde_json::to_value(&members).context("error encoding zookeeper members")?;
    match facts.publish(gateway.relations.as_ref(), term, FactKey::Zookeeper, value).await? {
        ApplyOutcome::Changed => {
            tracing::info!(?members, "zookeeper members published");
            Ok(true)
        }
        ApplyOutcome::Unchanged => Ok(false),
        ApplyOutcome::Rejected(reason) => Err(AppError::ProtocolViolation(format!("zookeeper publish rejected: {}", reason)).into()),
    }
}

/// Build the quorum connection string of the given members, resolving hosts to addresses.
pub async fn resolve_quorum(members: &[ZkMember]) -> Result<String> {
    let mut resolved = Vec::with_capacity(members.len());
    for member in members {
        resolved.push((resolve_address(&member.host, member.port).await?, member.port));
    }
    Ok(quorum_connection_string(resolved.iter().map(|(addr, port)| (addr.as_str(), *port))))
}

/// Resolve the given host to an address, passing IP addresses through untouched.
async fn resolve_address(host: &str, port: u16) -> Result<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("error resolving zookeeper host {}", host))?;
    addrs
        .next()
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| anyhow!("zookeeper host {} resolved to no address", host))
}

/// Converge the failover daemon of this unit onto the published quorum.
///
/// Returns `true` if the quorum property was rewritten. Nothing happens while no quorum has
/// been published, or when the published quorum is the one already applied.
#[tracing::instrument(level = "debug", skip(facts, gateway))]
pub(super) async fn reconcile(facts: &FactStore, gateway: &Gateway) -> Result<bool> {
    let members = match facts.zookeepers()? {
        Some(members) => members,
        None => return Ok(false),
    };
    let quorum = resolve_quorum(&members).await?;
    let applied: Option<String> = facts.get_local(KEY_ZKFC_APPLIED_QUORUM)?;
    let mut pending = facts.flag(Flag::ZkfcRestartPending)?;
    if applied.as_deref() == Some(quorum.as_str()) && !pending {
        return Ok(false);
    }

    if !pending && gateway.services.is_running(SERVICE_ZKFC).await? {
        facts.set_flag(Flag::ZkfcRestartPending)?;
        pending = true;
        tracing::info!(%quorum, "stopping failover daemon for quorum update");
        gateway
            .services
            .stop(SERVICE_ZKFC)
            .await
            .map_err(|err| AppError::action("stop failover daemon", err))?;
    }

    let mut props = BTreeMap::new();
    props.insert(PROP_ZK_QUORUM.to_string(), quorum.clone());
    gateway
        .site
        .set_properties(CORE_SITE, &props)
        .await
        .map_err(|err| AppError::action("rewrite zookeeper quorum", err))?;
    facts.put_local(KEY_ZKFC_APPLIED_QUORUM, &quorum)?;

    if pending {
        gateway
            .services
            .start(SERVICE_ZKFC)
            .await
            .map_err(|err| AppError::action("restart failover daemon", err))?;
        facts.clear_flag(Flag::ZkfcRestartPending)?;
        tracing::info!(%quorum, "failover daemon restarted with new quorum");
    }
    Ok(true)
}
