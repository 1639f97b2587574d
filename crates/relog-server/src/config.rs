//! Node configuration file and legacy environment variables.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use relog_repl::{
    ArtificialDelay, FollowerAddr, HealthConfig, MasterConfig, RetryConfig, SecondaryConfig,
};
use relog_transport::TcpTransportConfig;
use serde::{Deserialize, Serialize};

/// Settings for one relog node, loaded from TOML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address of the HTTP API.
    pub http_addr: SocketAddr,
    /// Settings used when running as master.
    pub master: MasterSection,
    /// Settings used when running as secondary.
    pub secondary: SecondarySection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            master: MasterSection::default(),
            secondary: SecondarySection::default(),
        }
    }
}

/// `[master]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSection {
    /// Followers that receive every write.
    pub followers: Vec<FollowerAddr>,
    /// How long an append waits for its acknowledgements.
    pub quorum_timeout_ms: u64,
    /// Refuse writes when too few followers are healthy.
    pub preflight_health_check: bool,
    /// Pause between health checks of one follower.
    pub probe_interval_ms: u64,
    /// Round-trip budget of a single health check.
    pub probe_timeout_ms: u64,
    /// Connect timeout for health and data connections.
    pub connect_timeout_ms: u64,
    /// Per-read/write deadline on data connections; 0 disables it.
    pub io_timeout_ms: u64,
    /// First retry delay of a replication worker.
    pub initial_backoff_ms: u64,
    /// Ceiling on any retry delay, jitter included.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive retry delays.
    pub backoff_multiplier: f64,
    /// Add random jitter to retry delays.
    pub jitter: bool,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            followers: Vec::new(),
            quorum_timeout_ms: 100_000,
            preflight_health_check: true,
            probe_interval_ms: 100,
            probe_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            io_timeout_ms: 5_000,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl MasterSection {
    /// Build the library-level master configuration.
    pub fn to_master_config(&self) -> MasterConfig {
        MasterConfig {
            followers: self.followers.clone(),
            quorum_timeout: Duration::from_millis(self.quorum_timeout_ms),
            preflight_health_check: self.preflight_health_check,
            transport: TcpTransportConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                io_timeout: (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms)),
                nodelay: true,
            },
            health: HealthConfig {
                probe_interval: Duration::from_millis(self.probe_interval_ms),
                probe_timeout: Duration::from_millis(self.probe_timeout_ms),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            },
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                backoff_multiplier: self.backoff_multiplier,
                jitter: self.jitter,
            },
        }
    }
}

/// `[secondary]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondarySection {
    /// Replication listener address.
    pub bind_addr: String,
    /// Inject acknowledgement delays.
    pub artificial_delay: bool,
    /// Chance in `0.0..=1.0` that an acknowledgement is held back.
    pub delay_probability: f64,
    /// How long a held acknowledgement waits.
    pub delay_ms: u64,
}

impl Default for SecondarySection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:65441".to_string(),
            artificial_delay: false,
            delay_probability: 0.5,
            delay_ms: 5_000,
        }
    }
}

impl SecondarySection {
    /// Build the library-level secondary configuration.
    pub fn to_secondary_config(&self) -> SecondaryConfig {
        let config = SecondaryConfig::new(self.bind_addr.clone());
        if self.artificial_delay {
            config.with_artificial_delay(ArtificialDelay {
                probability: self.delay_probability,
                delay: Duration::from_millis(self.delay_ms),
            })
        } else {
            config
        }
    }

    /// Replace the port of `bind_addr`, keeping the host.
    pub fn set_port(&mut self, port: u16) {
        let host = self
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        self.bind_addr = format!("{host}:{port}");
    }
}

impl NodeConfig {
    /// Reject values the nodes cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let p = self.secondary.delay_probability;
        if !(0.0..=1.0).contains(&p) {
            anyhow::bail!("delay_probability must be within 0.0..=1.0, got {p}");
        }
        Ok(())
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parse the legacy `SECONDARY_INFO` follower mapping, e.g.
/// `{"secondary-1": 65441, 'secondary-2': 65442}`.
pub fn parse_secondary_info(raw: &str) -> anyhow::Result<Vec<FollowerAddr>> {
    let normalized = raw.trim().replace('\'', "\"");
    let mapping: BTreeMap<String, u16> = serde_json::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("invalid SECONDARY_INFO {raw:?}: {e}"))?;
    Ok(mapping
        .into_iter()
        .map(|(host, port)| FollowerAddr::new(host, port))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.http_addr, SocketAddr::from(([0, 0, 0, 0], 8000)));
        assert!(config.master.followers.is_empty());
        assert_eq!(config.master.quorum_timeout_ms, 100_000);
        assert_eq!(config.secondary.bind_addr, "0.0.0.0:65441");
        assert!(!config.secondary.artificial_delay);
    }

    #[test]
    fn test_master_section_conversion() {
        let section = MasterSection {
            followers: vec![FollowerAddr::new("s1", 65441)],
            quorum_timeout_ms: 2_000,
            io_timeout_ms: 0,
            ..Default::default()
        };
        let config = section.to_master_config();
        assert_eq!(config.quorum_timeout, Duration::from_secs(2));
        assert!(config.transport.io_timeout.is_none());
        assert_eq!(config.health.probe_interval, Duration::from_millis(100));
        assert_eq!(config.max_write_concern(), 2);
    }

    #[test]
    fn test_secondary_section_conversion() {
        let mut section = SecondarySection {
            artificial_delay: true,
            delay_probability: 1.0,
            delay_ms: 250,
            ..Default::default()
        };
        section.set_port(65442);
        let config = section.to_secondary_config();
        assert_eq!(config.bind_addr, "0.0.0.0:65442");
        let delay = config.artificial_delay.unwrap();
        assert_eq!(delay.probability, 1.0);
        assert_eq!(delay.delay, Duration::from_millis(250));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
http_addr = "127.0.0.1:9000"

[master]
quorum_timeout_ms = 3000
preflight_health_check = false

[[master.followers]]
host = "secondary-1"
port = 65441

[[master.followers]]
host = "secondary-2"
port = 65442

[secondary]
bind_addr = "127.0.0.1:7000"
"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.http_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.master.followers.len(), 2);
        assert_eq!(config.master.followers[1], FollowerAddr::new("secondary-2", 65442));
        assert_eq!(config.master.quorum_timeout_ms, 3000);
        assert!(!config.master.preflight_health_check);
        assert_eq!(config.master.probe_interval_ms, 100);
        assert_eq!(config.secondary.bind_addr, "127.0.0.1:7000");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "master": {{ "followers": [{{ "host": "10.0.0.2", "port": 65441 }}] }},
                "secondary": {{ "artificial_delay": true }}
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.master.followers, vec![FollowerAddr::new("10.0.0.2", 65441)]);
        assert!(config.secondary.artificial_delay);
        assert_eq!(config.secondary.delay_ms, 5_000);
    }

    #[test]
    fn test_delay_probability_out_of_range_rejected() {
        let mut config = NodeConfig::default();
        config.validate().unwrap();
        for bad in [f64::NAN, -0.1, 1.5, f64::INFINITY] {
            config.secondary.delay_probability = bad;
            assert!(config.validate().is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn test_from_file_rejects_bad_delay_probability() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[secondary]\nartificial_delay = true\ndelay_probability = nan").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_parse_secondary_info() {
        let followers =
            parse_secondary_info(r#"{"secondary-1": 65441, 'secondary-2': 65442}"#).unwrap();
        assert_eq!(
            followers,
            vec![
                FollowerAddr::new("secondary-1", 65441),
                FollowerAddr::new("secondary-2", 65442),
            ]
        );
    }

    #[test]
    fn test_parse_secondary_info_rejects_garbage() {
        assert!(parse_secondary_info("secondary-1:65441").is_err());
        assert!(parse_secondary_info(r#"{"s": 70000}"#).is_err());
    }
}
