use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hlo_core::{EvictionPolicy, HaloError, NodeAddr, Result};
use hlo_net::ChannelConfig;

/// Coordinator daemon configuration.
///
/// `report_addr` is both the bind address of the failure-report
/// listener and the address handed to every node, so it must be
/// concrete enough for nodes to dial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub report_addr: SocketAddr,
    /// Candidate node slots; slot 0 anchors every bootstrap.
    pub slots: Vec<SlotConfig>,
    /// Nodes provisioned at bootstrap.
    pub initial_nodes: usize,
    /// Cache capacity handed to provisioned nodes.
    pub cache_capacity: usize,
    /// Eviction policy handed to provisioned nodes: "fifo", "lru", "lfu".
    pub eviction_policy: String,
    pub launch: LaunchSettings,
    #[serde(default)]
    pub timing: TimingSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlotConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSettings {
    /// Node binary started on the remote host.
    pub remote_bin: String,
    /// Working directory on the remote host, if the binary is not on PATH.
    pub remote_dir: Option<String>,
    /// Seconds a launched process gets before its liveness ping.
    #[serde(default = "default_launch_grace_secs")]
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// Commands may move data before confirming, so this is the long one.
    pub confirm_timeout_secs: u64,
    pub crash_check_interval_secs: u64,
}

fn default_launch_grace_secs() -> u64 {
    5
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            report_addr: "127.0.0.1:6190"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 6190))),
            slots: Vec::new(),
            initial_nodes: 5,
            cache_capacity: 1000,
            eviction_policy: "fifo".into(),
            launch: LaunchSettings::default(),
            timing: TimingSettings::default(),
        }
    }
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            remote_bin: "halo-node".into(),
            remote_dir: None,
            grace_secs: default_launch_grace_secs(),
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            io_timeout_secs: 2,
            confirm_timeout_secs: 10,
            crash_check_interval_secs: 3,
        }
    }
}

impl CoordinatorConfig {
    /// Load from a `.toml` or `.json` file, by extension.
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, `Config` when it does not
    /// parse or has an unknown extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| HaloError::Config(format!("TOML parse error: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| HaloError::Config(format!("JSON parse error: {e}"))),
            _ => Err(HaloError::Config(format!(
                "Unknown config file extension: {ext}"
            ))),
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy.parse().unwrap_or_default()
    }

    #[must_use]
    pub fn slot_addrs(&self) -> Vec<NodeAddr> {
        self.slots
            .iter()
            .map(|s| NodeAddr::new(s.ip, s.port))
            .collect()
    }

    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_secs(self.timing.connect_timeout_secs),
            io_timeout: Duration::from_secs(self.timing.io_timeout_secs),
            confirm_timeout: Duration::from_secs(self.timing.confirm_timeout_secs),
        }
    }

    #[must_use]
    pub fn launch_grace(&self) -> Duration {
        Duration::from_secs(self.launch.grace_secs)
    }

    #[must_use]
    pub fn crash_check_interval(&self) -> Duration {
        Duration::from_secs(self.timing.crash_check_interval_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.report_addr.port(), 6190);
        assert!(config.slots.is_empty());
        assert_eq!(config.initial_nodes, 5);
        assert_eq!(config.eviction_policy(), EvictionPolicy::Fifo);
        assert_eq!(config.launch.remote_bin, "halo-node");
        assert_eq!(config.launch.grace_secs, 5);
    }

    #[test]
    fn test_config_from_toml_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("halo.toml");

        let toml_content = r#"
report_addr = "10.0.0.100:6190"
initial_nodes = 3
cache_capacity = 5000
eviction_policy = "lru"

[[slots]]
ip = "10.0.0.1"
port = 6000

[[slots]]
ip = "10.0.0.2"
port = 6000

[launch]
remote_bin = "/opt/halo/halo-node"
remote_dir = "/opt/halo"
grace_secs = 8

[timing]
connect_timeout_secs = 3
io_timeout_secs = 1
confirm_timeout_secs = 20
crash_check_interval_secs = 2
"#;
        std::fs::write(&config_path, toml_content).unwrap();

        let config = CoordinatorConfig::from_file(&config_path).unwrap();
        assert_eq!(config.report_addr.port(), 6190);
        assert_eq!(config.slots.len(), 2);
        assert_eq!(
            config.slot_addrs()[1],
            NodeAddr::new(Ipv4Addr::new(10, 0, 0, 2), 6000)
        );
        assert_eq!(config.initial_nodes, 3);
        assert_eq!(config.eviction_policy(), EvictionPolicy::Lru);
        assert_eq!(config.launch.remote_dir.as_deref(), Some("/opt/halo"));
        assert_eq!(config.launch_grace(), Duration::from_secs(8));
        assert_eq!(config.channel_config().confirm_timeout, Duration::from_secs(20));
        assert_eq!(config.crash_check_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("halo.json");

        let json_content = r#"{
            "report_addr": "127.0.0.1:7700",
            "slots": [{"ip": "127.0.0.1", "port": 6000}],
            "initial_nodes": 1,
            "cache_capacity": 100,
            "eviction_policy": "lfu",
            "launch": {"remote_bin": "halo-node", "remote_dir": null, "grace_secs": 5}
        }"#;
        std::fs::write(&config_path, json_content).unwrap();

        let config = CoordinatorConfig::from_file(&config_path).unwrap();
        assert_eq!(config.report_addr.port(), 7700);
        assert_eq!(config.eviction_policy(), EvictionPolicy::Lfu);
        // Missing timing section falls back to defaults.
        assert_eq!(config.timing.confirm_timeout_secs, 10);
    }

    #[test]
    fn test_config_unknown_extension() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("halo.yaml");
        std::fs::write(&config_path, "report_addr: 1.2.3.4:1").unwrap();

        assert!(CoordinatorConfig::from_file(&config_path).is_err());
    }

    #[test]
    fn test_unknown_policy_falls_back_to_fifo() {
        let mut config = CoordinatorConfig::default();
        config.eviction_policy = "random".into();
        assert_eq!(config.eviction_policy(), EvictionPolicy::Fifo);
    }
}
