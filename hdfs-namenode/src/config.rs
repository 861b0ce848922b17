//! Runtime configuration.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use hdfs_core::model::SetupMode;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The agent's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port of the event ingress & healthchecks, served on the loopback interface only.
    pub http_port: u16,
    /// The port of the metrics endpoint & healthchecks, served on all interfaces.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The name of the unit on which this agent is running, e.g. `namenode/0`.
    pub unit_name: String,
    /// The fully-qualified domain name of this unit.
    ///
    /// This is the identity used in every peer list of the deployment.
    pub fqdn: String,
    /// The private address of this unit, recorded in the hosts map sent downstream.
    #[serde(default)]
    pub private_address: Option<String>,
    /// The name of the deployed application, sent to datanodes and clients.
    pub cluster_name: String,
    /// The version string of the installer's package spec.
    #[serde(default = "Config::default_spec_version")]
    pub spec_version: String,

    /// Enable a 3 unit HA deployment.
    ///
    /// This value is only read during the first evaluation. Changing it after the deployment
    /// has been commissioned is unsupported and has no effect.
    #[serde(default)]
    pub ha_setup: bool,
    /// Use ZooKeeper for automatic failover in an HA deployment.
    #[serde(default)]
    pub auto_failover: bool,

    /// The namenode RPC port.
    #[serde(default = "Config::default_hdfs_port")]
    pub hdfs_port: u16,
    /// The namenode web UI / WebHDFS port.
    #[serde(default = "Config::default_webhdfs_port")]
    pub webhdfs_port: u16,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The path where the installer's `site.yaml` is rendered.
    #[serde(default = "Config::default_site_yaml_path")]
    pub site_yaml_path: String,
    /// The path of the installer's site manifest.
    #[serde(default = "Config::default_site_manifest_path")]
    pub site_manifest_path: String,
    /// The directory holding the Hadoop `*-site.xml` files.
    #[serde(default = "Config::default_hadoop_conf_dir")]
    pub hadoop_conf_dir: String,
    /// The puppet binary used to apply the rendered site.
    #[serde(default = "Config::default_puppet_bin")]
    pub puppet_bin: String,
    /// The directory served to the installer for the fencing keys.
    #[serde(default = "Config::default_key_dir")]
    pub key_dir: String,
    /// The puppet fileserver config declaring the installer's file mounts.
    #[serde(default = "Config::default_puppet_fileserver_conf")]
    pub puppet_fileserver_conf: String,
    /// The HDFS data dir, handed to the HDFS user before the namenode is set up.
    #[serde(default = "Config::default_hdfs_data_dir")]
    pub hdfs_data_dir: String,
    /// The unit's admin user, added to the `hadoop` & `mapred` groups.
    #[serde(default = "Config::default_admin_user")]
    pub admin_user: String,

    /// The interval in seconds of the periodic status re-evaluation.
    #[serde(default = "Config::default_tick_seconds")]
    pub tick_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the parsed config.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.fqdn.is_empty(), "FQDN must not be empty");
        ensure!(!self.unit_name.is_empty(), "UNIT_NAME must not be empty");
        ensure!(self.tick_seconds >= 1, "TICK_SECONDS must be at least 1 second");
        Ok(())
    }

    /// The setup mode requested by this config.
    pub fn setup_mode(&self) -> SetupMode {
        SetupMode::from_flags(self.ha_setup, self.auto_failover)
    }

    /// The path of the given Hadoop site file.
    pub fn hadoop_site_file(&self, name: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.hadoop_conf_dir).join(name)
    }

    fn default_metrics_port() -> u16 {
        7071
    }

    fn default_spec_version() -> String {
        "bigtop-1.2".into()
    }

    fn default_hdfs_port() -> u16 {
        8020
    }

    fn default_webhdfs_port() -> u16 {
        50070
    }

    fn default_site_yaml_path() -> String {
        "/etc/puppet/hieradata/site.yaml".into()
    }

    fn default_site_manifest_path() -> String {
        "/etc/puppet/manifests/site.pp".into()
    }

    fn default_hadoop_conf_dir() -> String {
        "/etc/hadoop/conf".into()
    }

    fn default_puppet_bin() -> String {
        "puppet".into()
    }

    fn default_key_dir() -> String {
        "/etc/puppet/namenode/files".into()
    }

    fn default_puppet_fileserver_conf() -> String {
        "/etc/puppet/fileserver.conf".into()
    }

    fn default_hdfs_data_dir() -> String {
        "/data".into()
    }

    fn default_admin_user() -> String {
        "ubuntu".into()
    }

    fn default_tick_seconds() -> u64 {
        300
    }
}

#[cfg(test)]
impl Config {
    /// Create a config instance for use in tests, backed by a temp dir.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let path = |name: &str| tmpdir.path().join(name).to_string_lossy().to_string();
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "error".into(),
                http_port: 7070,
                metrics_port: 7071,
                unit_name: "namenode/0".into(),
                fqdn: "nn-a.local".into(),
                private_address: Some("10.0.0.1".into()),
                cluster_name: "namenode".into(),
                spec_version: Self::default_spec_version(),
                ha_setup: true,
                auto_failover: false,
                hdfs_port: Self::default_hdfs_port(),
                webhdfs_port: Self::default_webhdfs_port(),
                storage_data_path: path("db"),
                site_yaml_path: path("site.yaml"),
                site_manifest_path: path("site.pp"),
                hadoop_conf_dir: path("conf"),
                puppet_bin: "puppet".into(),
                key_dir: path("keys"),
                puppet_fileserver_conf: path("fileserver.conf"),
                hdfs_data_dir: path("data"),
                admin_user: "ubuntu".into(),
                tick_seconds: 60,
            }),
            tmpdir,
        ))
    }
}
