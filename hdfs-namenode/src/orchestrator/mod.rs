//! The HA orchestrator.
//!
//! ## Convergence
//! Every inbound event triggers exactly one evaluation pass, and passes never run
//! concurrently. A pass derives the unit's phase purely from durable facts, performs the single
//! action that phase calls for, records its completion, and derives the phase again, until a
//! phase is reached which has to wait on another unit. Re-running a pass in a later phase has
//! no side effects beyond re-sending relation data.
//!
//! ```text
//! AwaitingClusterPeers -> AwaitingKeys -> InstallingJournal -> AwaitingJournalPeers
//!     -> [AwaitingZookeeper] -> AwaitingFormat | Formatting -> InstallingNamenode -> Running
//! ```
//!
//! The leader additionally runs its duties at every step: fencing key generation, freezing
//! the cluster & journal lists, publishing the ZooKeeper members and, in a non-HA setup,
//! recording the format of HDFS.
//!
//! ## Format
//! HDFS is formatted at most once per deployment. Only the leader formats, only when it is the
//! primary of the frozen journal list, and only while no format has been recorded. Success is
//! recorded locally before it is published, so a failed publish is retried without a second
//! format.

mod downstream;
mod zookeeper;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::error::{AppError, ShutdownError};
use crate::facts::{ApplyOutcome, Broadcast, FactStore, Flag};
use crate::gateway::{Gateway, InstallRequest, Status, HDFS_SITE, HDFS_USER, SERVICE_NAMENODE, SERVICE_ZKFC};
use crate::registry::PeerRegistry;
use hdfs_core::model::{FactKey, PeerList, Role, RoleClass, SetupMode, ZkMember};
use hdfs_core::roles::{self, Overrides, FIRST_NAMENODE_SERVICE_ID, HA_NAMENODE_ROLES, JOURNAL_ROLES, NAMENODE_ROLES};

pub(self) const METRIC_EVALUATIONS: &str = "namenode_agent_evaluations";
pub(self) const METRIC_EVALUATION_ERRORS: &str = "namenode_agent_evaluation_errors";
pub(self) const METRIC_IS_LEADER: &str = "namenode_agent_is_leader";
pub(self) const METRIC_PHASE: &str = "namenode_agent_phase";

/// The local key of the setup mode fixed at first evaluation.
const KEY_SETUP_MODE: &str = "setup_mode";
/// The local key of this unit's view of leadership.
const KEY_LEADERSHIP: &str = "leadership";
/// The local key of a generated but not yet fully published fencing key pair.
const KEY_PENDING_KEYS: &str = "fencing_keys/pending";

/// The upper bound of phase transitions within a single pass.
const MAX_STEPS: usize = 16;

/// The namenode properties making it listen on all interfaces.
const BIND_HOST_PROPS: [&str; 4] = [
    "dfs.namenode.rpc-bind-host",
    "dfs.namenode.servicerpc-bind-host",
    "dfs.namenode.http-bind-host",
    "dfs.namenode.https-bind-host",
];

/// An event delivered to this unit.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitEvent {
    /// This unit's leadership status, with the leadership term.
    Leadership { is_leader: bool, term: u64 },
    /// A remote unit announced itself on the cluster-coordination channel.
    ClusterPeerReady { unit: String },
    /// A remote unit announced its running journal node.
    JournalPeerReady { unit: String },
    /// The current members of the zookeeper relation.
    ZookeeperMembers { members: Vec<ZkMember> },
    /// A fact of the leadership data changed.
    LeaderData { broadcast: Broadcast },
    /// A datanode joined, or changed its relation data.
    DatanodeJoined {
        unit: String,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        hostname: Option<String>,
    },
    /// A datanode is departing.
    DatanodeDeparted {
        unit: String,
        #[serde(default)]
        hostname: Option<String>,
    },
    /// The datanode relation is gone.
    DatanodesGone,
    /// A client joined.
    ClientJoined,
    /// The client relation is gone.
    ClientsGone,
    /// Periodic re-evaluation.
    Tick,
}

impl UnitEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Leadership { .. } => "leadership",
            Self::ClusterPeerReady { .. } => "cluster_peer_ready",
            Self::JournalPeerReady { .. } => "journal_peer_ready",
            Self::ZookeeperMembers { .. } => "zookeeper_members",
            Self::LeaderData { .. } => "leader_data",
            Self::DatanodeJoined { .. } => "datanode_joined",
            Self::DatanodeDeparted { .. } => "datanode_departed",
            Self::DatanodesGone => "datanodes_gone",
            Self::ClientJoined => "client_joined",
            Self::ClientsGone => "clients_gone",
            Self::Tick => "tick",
        }
    }
}

/// This unit's view of leadership.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Leadership {
    pub is_leader: bool,
    pub term: u64,
}

/// The phase of this unit's namenode setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting on the leader to freeze the cluster list.
    AwaitingClusterPeers,
    /// Waiting on the fencing keys from the leader.
    AwaitingKeys,
    /// The journal node is to be installed.
    InstallingJournal,
    /// Waiting on the leader to freeze the journal list.
    AwaitingJournalPeers,
    /// Waiting on a ZooKeeper quorum for automatic failover.
    AwaitingZookeeper,
    /// Waiting on the leader to format HDFS.
    AwaitingFormat,
    /// HDFS is to be formatted by this unit, the leader.
    Formatting,
    /// The namenode is to be installed in the given role.
    InstallingNamenode(Role),
    /// The namenode install has completed.
    Running(Role),
}

impl Phase {
    /// The ordinal of this phase, as reported by the phase gauge.
    pub fn ordinal(&self) -> f64 {
        match self {
            Self::AwaitingClusterPeers => 1.0,
            Self::AwaitingKeys => 2.0,
            Self::InstallingJournal => 3.0,
            Self::AwaitingJournalPeers => 4.0,
            Self::AwaitingZookeeper => 5.0,
            Self::AwaitingFormat => 6.0,
            Self::Formatting => 7.0,
            Self::InstallingNamenode(_) => 8.0,
            Self::Running(_) => 9.0,
        }
    }

    /// The status reported while this unit settles in this phase.
    fn status(&self) -> Status {
        match self {
            Self::AwaitingClusterPeers => Status::blocked("waiting for 3 namenode units"),
            Self::AwaitingKeys => Status::waiting("waiting for fencing keys from leader"),
            Self::InstallingJournal => Status::maintenance("installing journal node"),
            Self::AwaitingJournalPeers => Status::waiting("waiting for journal nodes to become ready"),
            Self::AwaitingZookeeper => Status::blocked("waiting for relation to zookeeper"),
            Self::AwaitingFormat => Status::waiting("waiting for leader to format hdfs"),
            Self::Formatting => Status::maintenance("formatting hdfs"),
            Self::InstallingNamenode(_) => Status::maintenance("installing namenode"),
            Self::Running(role) => Status::active(format!("namenode started as {}", role)),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstallingNamenode(role) => write!(f, "installing-namenode({})", role),
            Self::Running(role) => write!(f, "running({})", role),
            phase => write!(f, "{:?}", phase),
        }
    }
}

/// The outcome of a single step of a pass.
enum Step {
    /// The step recorded progress, the phase is to be derived again.
    Advanced,
    /// The phase has to wait on another unit or event.
    Wait,
}

/// The evaluation logic of this unit.
pub struct Orchestrator {
    /// The application's runtime config.
    config: Arc<Config>,
    /// This unit's durable facts.
    facts: FactStore,
    /// The leader's peer readiness registry.
    registry: PeerRegistry,
    /// External collaborators.
    gateway: Gateway,
    /// This unit's view of leadership.
    leadership: Leadership,
    /// The setup mode, once fixed.
    mode: Option<SetupMode>,
}

impl Orchestrator {
    /// Create a new instance, recovering leadership state from the given facts.
    pub fn new(config: Arc<Config>, facts: FactStore, gateway: Gateway) -> Result<Self> {
        metrics::register_counter!(METRIC_EVALUATIONS, metrics::Unit::Count, "the number of evaluation passes run");
        metrics::register_counter!(METRIC_EVALUATION_ERRORS, metrics::Unit::Count, "the number of evaluation passes which failed");
        metrics::register_gauge!(METRIC_IS_LEADER, metrics::Unit::Count, "1 if this unit is the leader, else 0");
        metrics::register_gauge!(METRIC_PHASE, metrics::Unit::Count, "the ordinal of this unit's setup phase");

        let leadership = facts.get_local(KEY_LEADERSHIP)?.unwrap_or_default();
        let registry = PeerRegistry::new(facts.clone(), config.fqdn.clone());
        Ok(Self {
            config,
            facts,
            registry,
            gateway,
            leadership,
            mode: None,
        })
    }

    /// Handle the given event, then run an evaluation pass.
    ///
    /// A failed pass is reported as a blocked status naming the failure; nothing recorded by
    /// the pass before the failure is lost, and the next event retries from there.
    #[tracing::instrument(level = "debug", skip(self, event), fields(event = event.kind()))]
    pub async fn handle(&mut self, event: UnitEvent) -> Result<Phase> {
        metrics::increment_counter!(METRIC_EVALUATIONS);
        let res = match self.ingest(event) {
            Ok(()) => self.evaluate().await,
            Err(err) => Err(err),
        };
        if let Err(err) = &res {
            metrics::increment_counter!(METRIC_EVALUATION_ERRORS);
            let status = Status::blocked(failure_message(err));
            if let Err(status_err) = self.gateway.status.set(&status).await {
                tracing::error!(error = ?status_err, "error reporting failed evaluation");
            }
        }
        res
    }

    /// Record the facts carried by the given event.
    fn ingest(&mut self, event: UnitEvent) -> Result<()> {
        match event {
            UnitEvent::Leadership { is_leader, term } => {
                self.leadership = Leadership { is_leader, term };
                self.facts.put_local(KEY_LEADERSHIP, &self.leadership)?;
                let leader_gauge = if is_leader { 1.0 } else { 0.0 };
                metrics::gauge!(METRIC_IS_LEADER, leader_gauge);
            }
            UnitEvent::ClusterPeerReady { unit } => {
                self.registry.report_ready(RoleClass::Cluster, &unit, self.leadership.is_leader)?;
            }
            UnitEvent::JournalPeerReady { unit } => {
                self.registry.report_ready(RoleClass::Journal, &unit, self.leadership.is_leader)?;
            }
            UnitEvent::ZookeeperMembers { members } => {
                if self.leadership.is_leader {
                    zookeeper::record_members(&self.facts, members)?;
                }
            }
            UnitEvent::LeaderData { broadcast } => {
                let (key, version) = (broadcast.key, broadcast.version);
                match self.facts.apply(broadcast)? {
                    ApplyOutcome::Rejected(reason) => tracing::warn!(%key, ?version, %reason, "broadcast rejected"),
                    ApplyOutcome::Changed => tracing::debug!(%key, ?version, "broadcast applied"),
                    ApplyOutcome::Unchanged => (),
                }
            }
            UnitEvent::DatanodeJoined { unit, address, hostname } => {
                downstream::datanode_joined(&self.facts, &unit, address.as_deref(), hostname.as_deref())?;
            }
            UnitEvent::DatanodeDeparted { unit, hostname } => {
                downstream::datanode_departed(&self.facts, &unit, hostname.as_deref())?;
            }
            UnitEvent::DatanodesGone => downstream::datanodes_gone(&self.facts)?,
            UnitEvent::ClientJoined => downstream::clients_changed(&self.facts, true)?,
            UnitEvent::ClientsGone => downstream::clients_changed(&self.facts, false)?,
            UnitEvent::Tick => (),
        }
        Ok(())
    }

    /// Run an evaluation pass.
    pub async fn evaluate(&mut self) -> Result<Phase> {
        let mode = self.setup_mode()?;
        if mode.is_ha() && !self.facts.flag(Flag::FilesMountAdded)? {
            self.gateway
                .installer
                .add_files_mount()
                .await
                .map_err(|err| AppError::action("add installer files mount", err))?;
            self.facts.set_flag(Flag::FilesMountAdded)?;
        }
        let phase = self.advance(mode).await?;
        let phase_gauge = phase.ordinal();
        metrics::gauge!(METRIC_PHASE, phase_gauge);
        if mode == SetupMode::AutoHa && matches!(phase, Phase::Running(_)) {
            zookeeper::reconcile(&self.facts, &self.gateway).await?;
        }

        let role = match phase {
            Phase::Running(role) => Some(role),
            _ => None,
        };
        let status = match downstream::serve(&self.config, mode, role, &self.facts, &self.gateway).await? {
            Some(status) => status,
            None => phase.status(),
        };
        self.gateway.status.set(&status).await.context("error setting unit status")?;
        tracing::debug!(%phase, %status, "evaluation complete");
        Ok(phase)
    }

    /// The setup mode of this deployment, fixed at first evaluation.
    fn setup_mode(&mut self) -> Result<SetupMode> {
        if let Some(mode) = self.mode {
            return Ok(mode);
        }
        let mode = match self.facts.get_local::<SetupMode>(KEY_SETUP_MODE)? {
            Some(mode) => {
                if mode != self.config.setup_mode() {
                    tracing::warn!(%mode, requested = %self.config.setup_mode(), "setup mode is fixed, ignoring config change");
                }
                mode
            }
            None => {
                let mode = self.config.setup_mode();
                self.facts.put_local(KEY_SETUP_MODE, &mode)?;
                tracing::info!(%mode, "setup mode fixed");
                mode
            }
        };
        self.mode = Some(mode);
        Ok(mode)
    }

    /// Step through phases until one has to wait.
    async fn advance(&mut self, mode: SetupMode) -> Result<Phase> {
        for _ in 0..MAX_STEPS {
            if self.leadership.is_leader {
                self.leader_duties(mode).await?;
            }
            let phase = self.current_phase(mode)?;
            match self.step(mode, phase).await? {
                Step::Advanced => tracing::debug!(%phase, "phase step complete"),
                Step::Wait => return Ok(phase),
            }
        }
        Err(AppError::ProtocolViolation(format!("evaluation did not settle within {} steps", MAX_STEPS)).into())
    }

    /// Derive the current phase of this unit from its facts.
    fn current_phase(&self, mode: SetupMode) -> Result<Phase> {
        let installed = self.facts.flag(Flag::NamenodeInstalled)?;
        if !mode.is_ha() {
            return Ok(if installed {
                Phase::Running(Role::Primary)
            } else {
                Phase::InstallingNamenode(Role::Primary)
            });
        }
        if installed {
            let journal = self.required_list(FactKey::Journal)?;
            return Ok(Phase::Running(roles::require_role(&self.config.fqdn, &journal)?));
        }

        let cluster = match self.facts.peer_list(FactKey::Cluster)? {
            Some(cluster) => cluster,
            None => return Ok(Phase::AwaitingClusterPeers),
        };
        roles::require_role(&self.config.fqdn, &cluster)?;
        if !(self.facts.flag(Flag::SshPubReady)? && self.facts.flag(Flag::SshPrivReady)?) {
            return Ok(Phase::AwaitingKeys);
        }
        if !self.facts.flag(Flag::JournalStarted)? {
            return Ok(Phase::InstallingJournal);
        }
        let journal = match self.facts.peer_list(FactKey::Journal)? {
            Some(journal) => journal,
            None => return Ok(Phase::AwaitingJournalPeers),
        };
        if mode == SetupMode::AutoHa && self.facts.zookeepers()?.is_none() {
            return Ok(Phase::AwaitingZookeeper);
        }
        let role = roles::require_role(&self.config.fqdn, &journal)?;
        if !self.facts.is_formatted()? {
            if !self.leadership.is_leader {
                return Ok(Phase::AwaitingFormat);
            }
            if role != Role::Primary {
                return Err(AppError::ProtocolViolation(format!(
                    "leader {} holds role {} of the journal list and must not format hdfs",
                    self.config.fqdn, role
                ))
                .into());
            }
            return Ok(Phase::Formatting);
        }
        Ok(Phase::InstallingNamenode(role))
    }

    /// Perform the action of the given phase.
    async fn step(&mut self, mode: SetupMode, phase: Phase) -> Result<Step> {
        match phase {
            Phase::AwaitingClusterPeers => {
                self.announce(RoleClass::Cluster).await?;
                Ok(Step::Wait)
            }
            Phase::AwaitingKeys => self.install_keys().await,
            Phase::InstallingJournal => {
                self.install_journal().await?;
                Ok(Step::Advanced)
            }
            Phase::AwaitingJournalPeers => {
                self.announce(RoleClass::Journal).await?;
                Ok(Step::Wait)
            }
            Phase::AwaitingZookeeper | Phase::AwaitingFormat | Phase::Running(_) => Ok(Step::Wait),
            Phase::Formatting => {
                self.format().await?;
                Ok(Step::Advanced)
            }
            Phase::InstallingNamenode(role) => {
                if mode.is_ha() {
                    self.install_ha_namenode(mode, role).await?;
                } else {
                    self.install_namenode().await?;
                }
                Ok(Step::Advanced)
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Leader Duties /////////////////////////////////////////////////////////

    /// Perform the duties of the leader which its current facts allow.
    async fn leader_duties(&mut self, mode: SetupMode) -> Result<()> {
        let term = self.leadership.term;
        if !mode.is_ha() {
            if self.facts.flag(Flag::NamenodeStarted)? && !self.facts.is_formatted()? {
                self.publish(FactKey::HdfsFormatted, serde_json::Value::Bool(true)).await?;
            }
            return Ok(());
        }

        self.publish_fencing_keys().await?;
        self.registry.freeze(RoleClass::Cluster, term, self.gateway.relations.as_ref()).await?;
        if self.facts.flag(Flag::JournalStarted)? {
            self.registry.freeze(RoleClass::Journal, term, self.gateway.relations.as_ref()).await?;
        }
        if mode == SetupMode::AutoHa {
            zookeeper::publish_members(&self.facts, &self.gateway, term).await?;
        }
        Ok(())
    }

    /// Generate & publish the fencing key pair, unless already published.
    ///
    /// A generated pair is kept locally until both halves are published, so a partially failed
    /// publish never yields mismatched halves.
    async fn publish_fencing_keys(&mut self) -> Result<()> {
        if self.facts.get(FactKey::SshKeyPub)?.is_some() && self.facts.get(FactKey::SshKeyPriv)?.is_some() {
            return Ok(());
        }
        let (public, private) = match self.facts.get_local::<(String, String)>(KEY_PENDING_KEYS)? {
            Some(pair) => pair,
            None => {
                // Hadoop users & groups go ahead of the fencing keys.
                self.add_users().await?;
                let keys = self
                    .gateway
                    .keys
                    .generate()
                    .await
                    .map_err(|err| AppError::action("generate fencing keys", err))?;
                let pair = (keys.public, keys.private);
                self.facts.put_local(KEY_PENDING_KEYS, &pair)?;
                pair
            }
        };
        self.publish(FactKey::SshKeyPriv, serde_json::Value::String(private)).await?;
        self.publish(FactKey::SshKeyPub, serde_json::Value::String(public)).await?;
        self.facts.remove_local(KEY_PENDING_KEYS)?;
        tracing::info!("fencing keys published");
        Ok(())
    }

    async fn publish(&self, key: FactKey, value: serde_json::Value) -> Result<()> {
        match self.facts.publish(self.gateway.relations.as_ref(), self.leadership.term, key, value).await? {
            ApplyOutcome::Rejected(reason) => Err(AppError::ProtocolViolation(format!("publish of {} rejected: {}", key, reason)).into()),
            _ => Ok(()),
        }
    }

    /// Format HDFS and record the format. Leader only, at most once.
    async fn format(&mut self) -> Result<()> {
        if self.facts.is_formatted()? {
            return Err(AppError::ProtocolViolation("refusing to format an already formatted hdfs".into()).into());
        }
        if !self.facts.flag(Flag::FormatCompleted)? {
            self.set_status(Phase::Formatting.status()).await?;
            self.prepare_data_dir().await?;
            self.gateway.hdfs.format().await.map_err(|err| AppError::action("format hdfs", err))?;
            self.facts.set_flag(Flag::FormatCompleted)?;
            tracing::info!("hdfs formatted");
        }
        self.publish(FactKey::HdfsFormatted, serde_json::Value::Bool(true)).await
    }

    //////////////////////////////////////////////////////////////////////////
    // Unit Duties ///////////////////////////////////////////////////////////

    async fn announce(&self, class: RoleClass) -> Result<()> {
        self.gateway
            .relations
            .announce(class, &self.config.fqdn)
            .await
            .map_err(|err| AppError::action("announce readiness", err).into())
    }

    /// Install whichever fencing key halves have been received.
    async fn install_keys(&mut self) -> Result<Step> {
        if !self.facts.flag(Flag::SshPubReady)? {
            if let Some(key) = self.facts.get_value::<String>(FactKey::SshKeyPub)? {
                self.gateway
                    .keys
                    .install_public(&key)
                    .await
                    .map_err(|err| AppError::action("install fencing public key", err))?;
                self.facts.set_flag(Flag::SshPubReady)?;
            }
        }
        if !self.facts.flag(Flag::SshPrivReady)? {
            if let Some(key) = self.facts.get_value::<String>(FactKey::SshKeyPriv)? {
                self.gateway
                    .keys
                    .install_private(&key)
                    .await
                    .map_err(|err| AppError::action("install fencing private key", err))?;
                self.facts.set_flag(Flag::SshPrivReady)?;
            }
        }
        if self.facts.flag(Flag::SshPubReady)? && self.facts.flag(Flag::SshPrivReady)? {
            Ok(Step::Advanced)
        } else {
            Ok(Step::Wait)
        }
    }

    async fn install_journal(&mut self) -> Result<()> {
        let cluster = self.required_list(FactKey::Cluster)?;
        self.set_status(Phase::InstallingJournal.status()).await?;
        let req = InstallRequest {
            hosts: head_node(cluster.primary()),
            roles: JOURNAL_ROLES.iter().map(|role| role.to_string()).collect(),
            overrides: roles::base_ha_overrides(&cluster),
        };
        self.gateway
            .installer
            .apply(req)
            .await
            .map_err(|err| AppError::action("install journal node", err))?;
        self.facts.set_flag(Flag::JournalStarted)?;
        tracing::info!("journal node installed");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn install_ha_namenode(&mut self, mode: SetupMode, role: Role) -> Result<()> {
        let journal = self.required_list(FactKey::Journal)?;
        let quorum = match mode {
            SetupMode::AutoHa => {
                let members = self
                    .facts
                    .zookeepers()?
                    .ok_or_else(|| AppError::ProtocolViolation("auto failover install without a zookeeper quorum".into()))?;
                Some(zookeeper::resolve_quorum(&members).await?)
            }
            _ => None,
        };
        let overrides = roles::build_overrides(mode, &journal, quorum.as_deref())?;

        self.set_status(Status::maintenance("installing ha namenode")).await?;
        self.prepare_data_dir().await?;
        let req = InstallRequest {
            hosts: head_node(journal.primary()),
            roles: HA_NAMENODE_ROLES.iter().map(|role| role.to_string()).collect(),
            overrides,
        };
        self.gateway
            .installer
            .apply(req)
            .await
            .map_err(|err| AppError::action("install ha namenode", err))?;
        self.set_bind_hosts().await?;

        let services = self.gateway.services.clone();
        match role {
            Role::Primary => {
                services
                    .restart(SERVICE_NAMENODE)
                    .await
                    .map_err(|err| AppError::action("restart namenode", err))?;
                self.open_ports().await?;
            }
            Role::Secondary => {
                if !self.facts.flag(Flag::StandbyBootstrapped)? {
                    self.gateway
                        .hdfs
                        .bootstrap_standby()
                        .await
                        .map_err(|err| AppError::action("bootstrap standby namenode", err))?;
                    self.facts.set_flag(Flag::StandbyBootstrapped)?;
                }
                services
                    .start(SERVICE_NAMENODE)
                    .await
                    .map_err(|err| AppError::action("start namenode", err))?;
                if mode == SetupMode::ManualHa {
                    self.gateway
                        .hdfs
                        .transition_to_active(FIRST_NAMENODE_SERVICE_ID)
                        .await
                        .map_err(|err| AppError::action("transition namenode to active", err))?;
                }
                self.open_ports().await?;
            }
            Role::JournalOnly => {
                services
                    .stop(SERVICE_NAMENODE)
                    .await
                    .map_err(|err| AppError::action("stop namenode", err))?;
                if mode == SetupMode::AutoHa && services.is_running(SERVICE_ZKFC).await? {
                    services
                        .stop(SERVICE_ZKFC)
                        .await
                        .map_err(|err| AppError::action("stop failover daemon", err))?;
                }
                self.facts.set_flag(Flag::JournalOnly)?;
            }
            Role::Unranked => {
                return Err(AppError::ProtocolViolation(format!("unit {} has no role to install", self.config.fqdn)).into());
            }
        }

        self.add_users().await?;
        if let Some(quorum) = quorum {
            self.facts.put_local(zookeeper::KEY_ZKFC_APPLIED_QUORUM, &quorum)?;
        }
        self.facts.set_flag(Flag::NamenodeStarted)?;
        self.facts.set_flag(Flag::NamenodeInstalled)?;
        tracing::info!(%role, "ha namenode installed");
        Ok(())
    }

    async fn install_namenode(&mut self) -> Result<()> {
        self.set_status(Status::maintenance("installing namenode")).await?;
        let req = InstallRequest {
            hosts: head_node(&self.config.fqdn),
            roles: NAMENODE_ROLES.iter().map(|role| role.to_string()).collect(),
            overrides: Overrides::new(),
        };
        self.gateway
            .installer
            .apply(req)
            .await
            .map_err(|err| AppError::action("install namenode", err))?;
        self.set_bind_hosts().await?;
        self.add_users().await?;
        self.gateway
            .services
            .restart(SERVICE_NAMENODE)
            .await
            .map_err(|err| AppError::action("restart namenode", err))?;
        self.open_ports().await?;
        self.facts.set_flag(Flag::NamenodeStarted)?;
        self.facts.set_flag(Flag::NamenodeInstalled)?;
        tracing::info!("namenode installed");
        Ok(())
    }

    async fn set_bind_hosts(&self) -> Result<()> {
        let props: BTreeMap<String, String> = BIND_HOST_PROPS.iter().map(|prop| (prop.to_string(), "0.0.0.0".to_string())).collect();
        self.gateway
            .site
            .set_properties(HDFS_SITE, &props)
            .await
            .map_err(|err| AppError::action("set namenode bind hosts", err).into())
    }

    async fn add_users(&self) -> Result<()> {
        self.gateway
            .services
            .add_users()
            .await
            .map_err(|err| AppError::action("add hadoop users", err).into())
    }

    /// Hand the HDFS data dir to the HDFS user.
    async fn prepare_data_dir(&self) -> Result<()> {
        self.gateway
            .services
            .chown_recursive(&self.config.hdfs_data_dir, HDFS_USER)
            .await
            .map_err(|err| AppError::action("prepare hdfs data dir", err).into())
    }

    async fn open_ports(&self) -> Result<()> {
        for port in [self.config.hdfs_port, self.config.webhdfs_port] {
            self.gateway
                .services
                .open_port(port)
                .await
                .map_err(|err| AppError::action("open namenode port", err))?;
        }
        Ok(())
    }

    async fn set_status(&self, status: Status) -> Result<()> {
        self.gateway.status.set(&status).await.context("error setting unit status")
    }

    fn required_list(&self, key: FactKey) -> Result<PeerList> {
        self.facts
            .peer_list(key)?
            .ok_or_else(|| AppError::ProtocolViolation(format!("{} list required but not on record", key)).into())
    }
}

/// The installer host map naming the given unit as head node.
fn head_node(unit: &str) -> BTreeMap<String, String> {
    let mut hosts = BTreeMap::new();
    hosts.insert("namenode".to_string(), unit.to_string());
    hosts
}

/// The operator-visible message of a failed pass.
fn failure_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<AppError>() {
        Some(AppError::ActionFailed { action, .. }) => format!("{} failed, will retry", action),
        Some(app_err) => app_err.to_string(),
        None => format!("{:#}", err),
    }
}

//////////////////////////////////////////////////////////////////////////////
// Controller ////////////////////////////////////////////////////////////////

/// A controller running the orchestrator over the inbound events of this unit.
pub struct HaCtl {
    orchestrator: Orchestrator,
    /// A channel of inbound unit events.
    events_rx: ReceiverStream<UnitEvent>,
    /// The interval of periodic re-evaluation.
    tick: Duration,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl HaCtl {
    /// Create a new instance.
    pub fn new(orchestrator: Orchestrator, events_rx: mpsc::Receiver<UnitEvent>, tick: Duration, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            orchestrator,
            events_rx: ReceiverStream::new(events_rx),
            tick,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("ha controller has started");
        let mut ticker = tokio::time::interval(self.tick);

        loop {
            tokio::select! {
                Some(event) = self.events_rx.next() => {
                    if self.process(event).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.process(UnitEvent::Tick).await.is_err() {
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("ha controller has shutdown");
        Ok(())
    }

    /// Process the given event, returning an error only if shutdown is required.
    async fn process(&mut self, event: UnitEvent) -> std::result::Result<(), ShutdownError> {
        let kind = event.kind();
        match self.orchestrator.handle(event).await {
            Ok(phase) => {
                tracing::debug!(event = kind, %phase, "event processed");
                Ok(())
            }
            Err(err) => match err.downcast::<ShutdownError>() {
                Ok(err) => {
                    tracing::error!(error = ?err, "fatal error during evaluation, shutting down");
                    let _ = self.shutdown_tx.send(());
                    Err(err)
                }
                Err(err) => {
                    tracing::error!(error = ?err, event = kind, "error during evaluation");
                    Ok(())
                }
            },
        }
    }
}
