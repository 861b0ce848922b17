//! External collaborators of the agent.
//!
//! The orchestrator never touches the OS, the installer or the relation transport directly.
//! Everything goes through the traits of this module, bundled up in a `Gateway`. Production
//! implementations shell out to the Juju hook tools and to the Bigtop installer; tests use the
//! recording fakes of `crate::fixtures`.

mod bigtop;
mod hooktools;
mod siteconf;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::facts::Broadcast;
use hdfs_core::model::{Downstream, NamenodeInfo, RoleClass};
use hdfs_core::roles::Overrides;

pub use bigtop::{Bigtop, FencingKeys};
pub use hooktools::HookTools;
pub use siteconf::SiteXml;

pub const SERVICE_NAMENODE: &str = "hadoop-hdfs-namenode";
pub const SERVICE_ZKFC: &str = "hadoop-hdfs-zkfc";
pub const CORE_SITE: &str = "core-site.xml";
pub const HDFS_SITE: &str = "hdfs-site.xml";
/// The system user owning the HDFS processes & data.
pub const HDFS_USER: &str = "hdfs";

/// A request to apply a role set through the installer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallRequest {
    /// Host map of the installer, e.g. `{namenode: <fqdn>}`.
    pub hosts: BTreeMap<String, String>,
    /// The roles to apply.
    pub roles: Vec<String>,
    /// Installer overrides.
    pub overrides: Overrides,
}

/// The installer, applying a role set on this unit.
///
/// An apply is all-or-nothing from the perspective of the agent: an error means nothing may be
/// assumed about the state of the installed services, and the step will be retried.
#[async_trait]
pub trait Installer: Send + Sync + 'static {
    /// Serve the fencing key dir to the installer as its `files` mount. Repeat calls are no-ops.
    async fn add_files_mount(&self) -> Result<()>;
    async fn apply(&self, req: InstallRequest) -> Result<()>;
}

/// OS service management.
#[async_trait]
pub trait Services: Send + Sync + 'static {
    async fn start(&self, service: &str) -> Result<()>;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn restart(&self, service: &str) -> Result<()>;
    async fn is_running(&self, service: &str) -> Result<bool>;
    async fn open_port(&self, port: u16) -> Result<()>;
    /// Ensure the `mapred` system user & the `hadoop`/`mapred` groups exist, with the admin
    /// user a member of both.
    async fn add_users(&self) -> Result<()>;
    /// Give the given tree to `owner`, as both user & group.
    async fn chown_recursive(&self, path: &str, owner: &str) -> Result<()>;
}

/// HDFS administrative commands.
#[async_trait]
pub trait HdfsAdmin: Send + Sync + 'static {
    /// Format the HDFS metadata store. Must never run twice in a deployment.
    async fn format(&self) -> Result<()>;
    /// Copy the primary's metadata to this standby namenode.
    async fn bootstrap_standby(&self) -> Result<()>;
    /// Transition the namenode with the given HA service id to active.
    async fn transition_to_active(&self, service_id: &str) -> Result<()>;
}

/// The inter-unit relation transport.
#[async_trait]
pub trait Relations: Send + Sync + 'static {
    /// Announce this unit's readiness for the given role class to the leader.
    async fn announce(&self, class: RoleClass, unit: &str) -> Result<()>;
    /// Publish the given fact through the leadership data. Leader only.
    async fn leader_set(&self, broadcast: &Broadcast) -> Result<()>;
    /// Send namenode info to every unit of the given downstream relation.
    async fn send_namenode_info(&self, downstream: Downstream, info: &NamenodeInfo) -> Result<()>;
}

/// The kind of an operator-visible status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Blocked,
    Waiting,
    Maintenance,
    Active,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Waiting => "waiting",
            Self::Maintenance => "maintenance",
            Self::Active => "active",
        }
    }
}

/// An operator-visible status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
}

impl Status {
    pub fn blocked(message: impl Into<String>) -> Self {
        Self { kind: StatusKind::Blocked, message: message.into() }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self { kind: StatusKind::Waiting, message: message.into() }
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self { kind: StatusKind::Maintenance, message: message.into() }
    }

    pub fn active(message: impl Into<String>) -> Self {
        Self { kind: StatusKind::Active, message: message.into() }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// The status reporter of this unit.
#[async_trait]
pub trait StatusReporter: Send + Sync + 'static {
    async fn set(&self, status: &Status) -> Result<()>;
}

/// An editor of the Hadoop `*-site.xml` files.
#[async_trait]
pub trait SiteConfig: Send + Sync + 'static {
    /// Set the given properties in the given site file, leaving all others untouched.
    async fn set_properties(&self, file: &str, props: &BTreeMap<String, String>) -> Result<()>;
}

/// Fencing key management.
#[async_trait]
pub trait Keys: Send + Sync + 'static {
    /// Generate a new fencing key pair.
    async fn generate(&self) -> Result<FencingKeys>;
    /// Install the public half of the fencing key pair.
    async fn install_public(&self, key: &str) -> Result<()>;
    /// Install the private half of the fencing key pair.
    async fn install_private(&self, key: &str) -> Result<()>;
}

/// The bundle of collaborators used by the orchestrator.
#[derive(Clone)]
pub struct Gateway {
    pub installer: Arc<dyn Installer>,
    pub services: Arc<dyn Services>,
    pub hdfs: Arc<dyn HdfsAdmin>,
    pub relations: Arc<dyn Relations>,
    pub status: Arc<dyn StatusReporter>,
    pub site: Arc<dyn SiteConfig>,
    pub keys: Arc<dyn Keys>,
}

impl Gateway {
    /// Build the production gateway for the given config.
    pub fn new(config: Arc<Config>) -> Self {
        let tools = Arc::new(HookTools::new(config.clone()));
        let bigtop = Arc::new(Bigtop::new(config.clone()));
        Self {
            installer: bigtop.clone(),
            services: tools.clone(),
            hdfs: bigtop.clone(),
            relations: tools.clone(),
            status: tools,
            site: Arc::new(SiteXml::new(config)),
            keys: bigtop,
        }
    }
}
