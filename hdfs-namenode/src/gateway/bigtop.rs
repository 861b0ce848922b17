//! Collaborators backed by the Bigtop puppet installer and the HDFS command line.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::gateway::hooktools::run;
use crate::gateway::{HdfsAdmin, InstallRequest, Installer, Keys, HDFS_USER};
use hdfs_core::roles::OverrideValue;

/// The section header of the puppet fileserver mount serving the fencing keys.
const FILES_MOUNT: &str = "[files]";

/// A fencing key pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FencingKeys {
    pub public: String,
    pub private: String,
}

/// A gateway implementation driving the Bigtop puppet recipes.
pub struct Bigtop {
    config: Arc<Config>,
}

impl Bigtop {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Run an `hdfs` subcommand as the HDFS user.
    async fn hdfs(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["-u".to_string(), HDFS_USER.to_string(), "hdfs".to_string()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        run("sudo", &full).await?;
        Ok(())
    }

    fn key_path(&self, name: &str) -> PathBuf {
        Path::new(&self.config.key_dir).join(name)
    }
}

#[async_trait]
impl Installer for Bigtop {
    async fn add_files_mount(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.key_dir).await.context("error creating key dir")?;
        let existing = match tokio::fs::read_to_string(&self.config.puppet_fileserver_conf).await {
            Ok(existing) => existing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).context("error reading puppet fileserver.conf"),
        };
        if let Some(updated) = with_files_mount(&existing, &self.config.key_dir) {
            tokio::fs::write(&self.config.puppet_fileserver_conf, updated)
                .await
                .context("error writing puppet fileserver.conf")?;
            tracing::info!(key_dir = %self.config.key_dir, "puppet files mount added");
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, req), fields(roles = ?req.roles))]
    async fn apply(&self, req: InstallRequest) -> Result<()> {
        let existing = match tokio::fs::read_to_string(&self.config.site_yaml_path).await {
            Ok(existing) => Some(existing),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).context("error reading installer site.yaml"),
        };
        let rendered = render_site_yaml(existing.as_deref(), &req)?;
        if let Some(parent) = Path::new(&self.config.site_yaml_path).parent() {
            tokio::fs::create_dir_all(parent).await.context("error creating dir for site.yaml")?;
        }
        tokio::fs::write(&self.config.site_yaml_path, rendered)
            .await
            .context("error writing installer site.yaml")?;

        run(&self.config.puppet_bin, &["apply".into(), self.config.site_manifest_path.clone()])
            .await
            .context("error applying puppet site manifest")?;
        Ok(())
    }
}

#[async_trait]
impl HdfsAdmin for Bigtop {
    async fn format(&self) -> Result<()> {
        self.hdfs(&["namenode", "-format", "-nonInteractive"]).await
    }

    async fn bootstrap_standby(&self) -> Result<()> {
        self.hdfs(&["namenode", "-bootstrapStandby", "-nonInteractive"]).await
    }

    async fn transition_to_active(&self, service_id: &str) -> Result<()> {
        self.hdfs(&["haadmin", "-transitionToActive", service_id]).await
    }
}

#[async_trait]
impl Keys for Bigtop {
    async fn generate(&self) -> Result<FencingKeys> {
        let workdir = self.key_path(".keygen");
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        tokio::fs::create_dir_all(&workdir).await.context("error creating key generation dir")?;
        let keyfile = workdir.join("id_rsa");
        run(
            "ssh-keygen",
            &[
                "-q".into(),
                "-t".into(),
                "rsa".into(),
                "-b".into(),
                "4096".into(),
                "-N".into(),
                "".into(),
                "-f".into(),
                keyfile.to_string_lossy().into_owned(),
            ],
        )
        .await
        .context("error generating fencing key pair")?;

        let private = tokio::fs::read_to_string(&keyfile).await.context("error reading generated private key")?;
        let public = tokio::fs::read_to_string(keyfile.with_extension("pub"))
            .await
            .context("error reading generated public key")?;
        tokio::fs::remove_dir_all(&workdir).await.context("error removing key generation dir")?;
        Ok(FencingKeys { public, private })
    }

    async fn install_public(&self, key: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.key_dir).await.context("error creating key dir")?;
        let authfile = self.key_path("authorized_keys");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&authfile)
            .await
            .context("error opening authorized_keys")?;
        file.write_all(format!("{}\n", key.trim_end()).as_bytes())
            .await
            .context("error writing authorized_keys")?;
        file.flush().await.context("error flushing authorized_keys")?;
        set_mode(&authfile, 0o600).await?;

        let keyfile = self.key_path("id_rsa.pub");
        tokio::fs::write(&keyfile, key).await.context("error writing public key")?;
        set_mode(&keyfile, 0o644).await
    }

    async fn install_private(&self, key: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.key_dir).await.context("error creating key dir")?;
        let keyfile = self.key_path("id_rsa");
        tokio::fs::write(&keyfile, key).await.context("error writing private key")?;
        set_mode(&keyfile, 0o600).await
    }
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("error setting mode of {}", path.display()))
}

/// Render the installer's `site.yaml`, merging the given request over any existing content.
pub(super) fn render_site_yaml(existing: Option<&str>, req: &InstallRequest) -> Result<String> {
    let mut site: BTreeMap<String, Value> = match existing {
        Some(raw) if !raw.trim().is_empty() => serde_yaml::from_str(raw).context("error parsing existing site.yaml")?,
        _ => BTreeMap::new(),
    };
    if let Some(head) = req.hosts.get("namenode") {
        site.insert("bigtop::hadoop_head_node".into(), Value::String(head.clone()));
    }
    for (name, host) in req.hosts.iter().filter(|(name, _)| name.as_str() != "namenode") {
        site.insert(format!("bigtop::{}_host", name), Value::String(host.clone()));
    }
    site.insert("bigtop::roles_enabled".into(), Value::Bool(true));
    site.insert("bigtop::roles".into(), string_seq(&req.roles));
    for (key, val) in req.overrides.iter() {
        let val = match val {
            OverrideValue::Str(val) => Value::String(val.clone()),
            OverrideValue::List(vals) => string_seq(vals),
        };
        site.insert(key.clone(), val);
    }

    let mapping: Mapping = site.into_iter().map(|(key, val)| (Value::String(key), val)).collect();
    serde_yaml::to_string(&mapping).context("error rendering site.yaml")
}

/// Append the `files` mount serving the given dir, unless the config already declares one.
pub(super) fn with_files_mount(existing: &str, dir: &str) -> Option<String> {
    if existing.lines().any(|line| line.trim() == FILES_MOUNT) {
        return None;
    }
    let mut updated = existing.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&format!("{}\npath {}\nallow *\n", FILES_MOUNT, dir));
    Some(updated)
}

fn string_seq(vals: &[String]) -> Value {
    Value::Sequence(vals.iter().cloned().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_yaml_merges_request_over_existing() -> Result<()> {
        let existing = "bigtop::jdk_package_name: openjdk-8-jre-headless\nbigtop::roles:\n- journalnode\n";
        let mut req = InstallRequest::default();
        req.hosts.insert("namenode".into(), "nn-a.local".into());
        req.roles = vec!["namenode".into(), "mapred-app".into()];
        req.overrides.insert("hadoop::common_hdfs::ha".into(), "manual".into());

        let rendered = render_site_yaml(Some(existing), &req)?;
        let parsed: BTreeMap<String, Value> = serde_yaml::from_str(&rendered)?;

        assert_eq!(parsed.get("bigtop::jdk_package_name"), Some(&Value::String("openjdk-8-jre-headless".into())));
        assert_eq!(parsed.get("bigtop::hadoop_head_node"), Some(&Value::String("nn-a.local".into())));
        assert_eq!(parsed.get("bigtop::roles"), Some(&string_seq(&req.roles)), "expected roles of the request to replace existing roles");
        assert_eq!(parsed.get("hadoop::common_hdfs::ha"), Some(&Value::String("manual".into())));
        Ok(())
    }

    #[test]
    fn files_mount_is_appended_once() {
        let existing = "[plugins]\nallow *";

        let updated = with_files_mount(existing, "/etc/puppet/namenode/files").unwrap_or_default();

        assert_eq!(updated, "[plugins]\nallow *\n[files]\npath /etc/puppet/namenode/files\nallow *\n");
        assert_eq!(with_files_mount(&updated, "/etc/puppet/namenode/files"), None, "expected an existing mount to be kept");
    }
}
