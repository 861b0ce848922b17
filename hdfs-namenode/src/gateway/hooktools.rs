//! Collaborators backed by the Juju hook tools and systemd.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::Config;
use crate::facts::Broadcast;
use crate::gateway::{Relations, Services, Status, StatusReporter};
use hdfs_core::model::{Downstream, NamenodeInfo, RoleClass};

/// The peer relation used for cluster & journal coordination.
const RELATION_CLUSTER: &str = "namenode-cluster";
/// The groups of the Hadoop system users.
const HADOOP_GROUPS: [&str; 2] = ["hadoop", "mapred"];
/// The system user of the job history files, created as the MapReduce packages are not installed.
const MAPRED_USER: &str = "mapred";

/// A gateway implementation which shells out to the hook tools of the unit.
pub struct HookTools {
    config: Arc<Config>,
}

impl HookTools {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// The ids of all established relations of the given name.
    async fn relation_ids(&self, name: &str) -> Result<Vec<String>> {
        let out = run("relation-ids", &[name.to_string()]).await?;
        Ok(out.lines().map(str::trim).filter(|line| !line.is_empty()).map(String::from).collect())
    }

    /// Set the given key/value pairs on every relation of the given name.
    async fn relation_set_all(&self, name: &str, pairs: &[String]) -> Result<()> {
        for id in self.relation_ids(name).await? {
            let mut args = vec!["-r".to_string(), id];
            args.extend(pairs.iter().cloned());
            run("relation-set", &args).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Relations for HookTools {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn announce(&self, class: RoleClass, unit: &str) -> Result<()> {
        let pair = format!("{}-ready={}", class, unit);
        self.relation_set_all(RELATION_CLUSTER, &[pair]).await
    }

    #[tracing::instrument(level = "debug", skip(self, broadcast), fields(key = %broadcast.key))]
    async fn leader_set(&self, broadcast: &Broadcast) -> Result<()> {
        let raw = serde_json::to_string(broadcast).context("error encoding broadcast for leader-set")?;
        run("leader-set", &[format!("{}={}", broadcast.key, raw)]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, info))]
    async fn send_namenode_info(&self, downstream: Downstream, info: &NamenodeInfo) -> Result<()> {
        let pairs = relation_pairs(info)?;
        self.relation_set_all(downstream.relation_name(), &pairs).await
    }
}

#[async_trait]
impl StatusReporter for HookTools {
    async fn set(&self, status: &Status) -> Result<()> {
        run("status-set", &[status.kind.as_str().to_string(), status.message.clone()]).await?;
        Ok(())
    }
}

#[async_trait]
impl Services for HookTools {
    async fn start(&self, service: &str) -> Result<()> {
        run("systemctl", &["start".into(), service.into()]).await?;
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        run("systemctl", &["stop".into(), service.into()]).await?;
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        run("systemctl", &["restart".into(), service.into()]).await?;
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        let status = Command::new("systemctl")
            .args(&["is-active", "--quiet", service])
            .status()
            .await
            .with_context(|| format!("error checking state of service {}", service))?;
        Ok(status.success())
    }

    async fn open_port(&self, port: u16) -> Result<()> {
        run("open-port", &[format!("{}/tcp", port)]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn add_users(&self) -> Result<()> {
        for group in HADOOP_GROUPS {
            run("groupadd", &["-f".into(), group.into()]).await?;
        }
        let exists = Command::new("id")
            .arg(MAPRED_USER)
            .output()
            .await
            .context("error checking for the mapred user")?
            .status
            .success();
        if !exists {
            run(
                "useradd",
                &[
                    "--system".into(),
                    "--no-create-home".into(),
                    "-g".into(),
                    MAPRED_USER.into(),
                    "-G".into(),
                    HADOOP_GROUPS.join(","),
                    MAPRED_USER.into(),
                ],
            )
            .await?;
        }
        run("usermod", &["-a".into(), "-G".into(), HADOOP_GROUPS.join(","), self.config.admin_user.clone()]).await?;
        Ok(())
    }

    async fn chown_recursive(&self, path: &str, owner: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("error creating {}", path))?;
        run("chown", &["-R".into(), format!("{}:{}", owner, owner), path.into()]).await?;
        Ok(())
    }
}

/// Render namenode info as `relation-set` key/value pairs.
///
/// String values are sent raw, everything else as JSON.
pub(super) fn relation_pairs(info: &NamenodeInfo) -> Result<Vec<String>> {
    let value = serde_json::to_value(info).context("error encoding namenode info")?;
    let fields = match value {
        serde_json::Value::Object(fields) => fields,
        _ => bail!("namenode info did not encode as an object"),
    };
    Ok(fields
        .into_iter()
        .map(|(key, val)| match val {
            serde_json::Value::String(val) => format!("{}={}", key, val),
            val => format!("{}={}", key, val),
        })
        .collect())
}

/// Run the given program, returning its stdout, or an error carrying its stderr.
pub(super) async fn run(program: &str, args: &[String]) -> Result<String> {
    tracing::trace!(program, ?args, "running command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("error spawning {}", program))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
