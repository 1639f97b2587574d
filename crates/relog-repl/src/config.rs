//! Replication configuration

use std::fmt;
use std::time::Duration;

use relog_transport::TcpTransportConfig;
use serde::{Deserialize, Serialize};

use crate::health::HealthConfig;
use crate::retry::RetryConfig;

/// Network location of one follower. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FollowerAddr {
    /// Host name or IP address.
    pub host: String,
    /// Ingestion port.
    pub port: u16,
}

impl FollowerAddr {
    /// Create a follower address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for FollowerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Master configuration
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Followers that receive every write.
    pub followers: Vec<FollowerAddr>,
    /// How long `append_data` waits for the required acknowledgements.
    pub quorum_timeout: Duration,
    /// Reject writes up front when too few followers are healthy.
    pub preflight_health_check: bool,
    /// Transport used by replication workers.
    pub transport: TcpTransportConfig,
    /// Health probing settings.
    pub health: HealthConfig,
    /// Worker backoff settings.
    pub retry: RetryConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            followers: Vec::new(),
            quorum_timeout: Duration::from_secs(100),
            preflight_health_check: true,
            transport: TcpTransportConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Create a master configuration for the given followers.
    pub fn new(followers: Vec<FollowerAddr>) -> Self {
        Self {
            followers,
            ..Default::default()
        }
    }

    /// Set the quorum wait timeout.
    pub fn with_quorum_timeout(mut self, timeout: Duration) -> Self {
        self.quorum_timeout = timeout;
        self
    }

    /// Enable/disable the pre-flight health check.
    pub fn with_preflight_health_check(mut self, enabled: bool) -> Self {
        self.preflight_health_check = enabled;
        self
    }

    /// Largest accepted write concern: every follower plus the master.
    pub fn max_write_concern(&self) -> usize {
        self.followers.len() + 1
    }
}

/// Acknowledgement delay injected by a secondary after committing a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArtificialDelay {
    /// Chance (0.0 to 1.0) that a given request is delayed.
    pub probability: f64,
    /// Delay applied when it is.
    pub delay: Duration,
}

impl ArtificialDelay {
    /// `probability` as a valid chance: clamped to `0.0..=1.0`, NaN counts as never.
    pub fn chance(&self) -> f64 {
        if self.probability.is_nan() {
            0.0
        } else {
            self.probability.clamp(0.0, 1.0)
        }
    }
}

impl Default for ArtificialDelay {
    fn default() -> Self {
        Self {
            probability: 0.5,
            delay: Duration::from_secs(5),
        }
    }
}

/// Secondary configuration
#[derive(Debug, Clone)]
pub struct SecondaryConfig {
    /// Address the ingestion listener binds to.
    pub bind_addr: String,
    /// Transport for accepted connections.
    pub transport: TcpTransportConfig,
    /// Optional acknowledgement delay.
    pub artificial_delay: Option<ArtificialDelay>,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:65441".to_string(),
            transport: TcpTransportConfig {
                io_timeout: None,
                ..Default::default()
            },
            artificial_delay: None,
        }
    }
}

impl SecondaryConfig {
    /// Create a secondary configuration bound to `bind_addr`.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Set the acknowledgement delay.
    pub fn with_artificial_delay(mut self, delay: ArtificialDelay) -> Self {
        self.artificial_delay = Some(delay);
        self
    }
}
