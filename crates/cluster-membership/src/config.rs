//! Membership protocol configuration

use crate::error::{MembershipError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol selection and tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolConfig {
    /// Probe, suspicion and gossip based membership
    Swim(SwimConfig),

    /// Heartbeat exchange with a phi accrual failure detector
    Heartbeat(HeartbeatConfig),
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::Swim(SwimConfig::default())
    }
}

impl ProtocolConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            MembershipError::configuration(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            MembershipError::configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Swim(config) => config.validate(),
            Self::Heartbeat(config) => config.validate(),
        }
    }
}

/// SWIM protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwimConfig {
    /// Push every accepted suspicion to all peers as soon as it happens
    pub broadcast_updates: bool,

    /// Broadcast the refreshed local record after refuting a suspicion
    pub broadcast_disputes: bool,

    /// Tell a member directly that it has been marked suspect
    pub notify_suspect: bool,

    /// Interval between gossip rounds (and failure checks)
    pub gossip_interval: Duration,

    /// Number of random peers each gossip round pushes to
    pub gossip_fanout: usize,

    /// Interval between probes
    pub probe_interval: Duration,

    /// Timeout for a direct probe
    pub probe_timeout: Duration,

    /// Timeout for an indirect probe request, twice the probe timeout unless set
    pub probe_request_timeout: Option<Duration>,

    /// Timeout for an anti-entropy sync, the probe timeout unless set
    pub sync_timeout: Option<Duration>,

    /// Number of probes (direct plus indirect) before a member is suspected
    pub suspect_probes: usize,

    /// How long a member may stay suspect before it is declared dead
    pub failure_timeout: Duration,

    /// Interval between anti-entropy syncs
    pub sync_interval: Duration,

    /// Seed for target selection; entropy-seeded when absent
    pub random_seed: Option<u64>,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            broadcast_updates: false,
            broadcast_disputes: true,
            notify_suspect: false,
            gossip_interval: Duration::from_millis(250),
            gossip_fanout: 2,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(100),
            probe_request_timeout: None,
            sync_timeout: None,
            suspect_probes: 3,
            failure_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(10),
            random_seed: None,
        }
    }
}

impl SwimConfig {
    pub fn effective_probe_request_timeout(&self) -> Duration {
        self.probe_request_timeout
            .unwrap_or(self.probe_timeout * 2)
    }

    pub fn effective_sync_timeout(&self) -> Duration {
        self.sync_timeout.unwrap_or(self.probe_timeout)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.gossip_interval.is_zero() {
            return Err(MembershipError::configuration(
                "Gossip interval must be positive",
            ));
        }

        if self.gossip_fanout == 0 {
            return Err(MembershipError::configuration(
                "Gossip fanout must be positive",
            ));
        }

        if self.probe_interval.is_zero() {
            return Err(MembershipError::configuration(
                "Probe interval must be positive",
            ));
        }

        if self.probe_timeout.is_zero() {
            return Err(MembershipError::configuration(
                "Probe timeout must be positive",
            ));
        }

        if self.effective_probe_request_timeout().is_zero() {
            return Err(MembershipError::configuration(
                "Probe request timeout must be positive",
            ));
        }

        if self.effective_sync_timeout().is_zero() {
            return Err(MembershipError::configuration(
                "Sync timeout must be positive",
            ));
        }

        if self.suspect_probes == 0 {
            return Err(MembershipError::configuration(
                "Suspect probes must be at least 1",
            ));
        }

        if self.failure_timeout.is_zero() {
            return Err(MembershipError::configuration(
                "Failure timeout must be positive",
            ));
        }

        if self.sync_interval.is_zero() {
            return Err(MembershipError::configuration(
                "Sync interval must be positive",
            ));
        }

        Ok(())
    }
}

/// Heartbeat protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat rounds
    pub heartbeat_interval: Duration,

    /// Timeout for a single heartbeat, the heartbeat interval unless set
    pub heartbeat_timeout: Option<Duration>,

    /// Phi value at which a member is removed
    pub phi_failure_threshold: f64,

    /// Fallback removal age while the detector has too few samples
    pub failure_timeout: Duration,

    /// Number of inter-arrival samples kept per member
    pub phi_window_size: usize,

    /// Samples required before phi is computed
    pub phi_min_samples: usize,

    /// Lower bound on the standard deviation used by phi
    pub phi_min_std_deviation: Duration,

    /// Seed for peer ordering; entropy-seeded when absent
    pub random_seed: Option<u64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: None,
            phi_failure_threshold: 10.0,
            failure_timeout: Duration::from_secs(10),
            phi_window_size: 1024,
            phi_min_samples: 10,
            phi_min_std_deviation: Duration::from_millis(50),
            random_seed: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn effective_heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout.unwrap_or(self.heartbeat_interval)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(MembershipError::configuration(
                "Heartbeat interval must be positive",
            ));
        }

        if self.effective_heartbeat_timeout().is_zero() {
            return Err(MembershipError::configuration(
                "Heartbeat timeout must be positive",
            ));
        }

        if !self.phi_failure_threshold.is_finite() || self.phi_failure_threshold <= 0.0 {
            return Err(MembershipError::configuration(
                "Phi failure threshold must be a positive number",
            ));
        }

        if self.failure_timeout.is_zero() {
            return Err(MembershipError::configuration(
                "Failure timeout must be positive",
            ));
        }

        if self.phi_window_size == 0 {
            return Err(MembershipError::configuration(
                "Phi window size must be positive",
            ));
        }

        if self.phi_min_samples > self.phi_window_size {
            return Err(MembershipError::configuration(
                "Phi min samples cannot exceed the window size",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_configs_are_valid() {
        assert!(ProtocolConfig::default().validate().is_ok());
        assert!(SwimConfig::default().validate().is_ok());
        assert!(HeartbeatConfig::default().validate().is_ok());
    }

    #[test]
    fn test_derived_timeouts() {
        let mut config = SwimConfig::default();
        assert_eq!(
            config.effective_probe_request_timeout(),
            Duration::from_millis(200)
        );
        assert_eq!(config.effective_sync_timeout(), Duration::from_millis(100));

        config.probe_request_timeout = Some(Duration::from_millis(500));
        config.sync_timeout = Some(Duration::from_secs(1));
        assert_eq!(
            config.effective_probe_request_timeout(),
            Duration::from_millis(500)
        );
        assert_eq!(config.effective_sync_timeout(), Duration::from_secs(1));

        let heartbeat = HeartbeatConfig::default();
        assert_eq!(heartbeat.effective_heartbeat_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_swim_validation() {
        let mut config = SwimConfig::default();
        config.gossip_fanout = 0;
        assert!(matches!(
            config.validate(),
            Err(MembershipError::Configuration(_))
        ));

        let mut config = SwimConfig::default();
        config.suspect_probes = 0;
        assert!(config.validate().is_err());

        let mut config = SwimConfig::default();
        config.probe_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = SwimConfig::default();
        config.sync_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_validation() {
        let mut config = HeartbeatConfig::default();
        config.phi_failure_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = HeartbeatConfig::default();
        config.phi_failure_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = HeartbeatConfig::default();
        config.phi_window_size = 4;
        config.phi_min_samples = 5;
        assert!(config.validate().is_err());

        let mut config = HeartbeatConfig::default();
        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("membership.toml");

        let config = ProtocolConfig::Swim(SwimConfig {
            gossip_fanout: 4,
            random_seed: Some(42),
            ..SwimConfig::default()
        });

        config.to_file(&config_path).unwrap();
        assert!(config_path.exists());

        match ProtocolConfig::from_file(&config_path).unwrap() {
            ProtocolConfig::Swim(loaded) => {
                assert_eq!(loaded.gossip_fanout, 4);
                assert_eq!(loaded.random_seed, Some(42));
                assert_eq!(loaded.probe_timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected protocol config: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("heartbeat.toml");

        let config = ProtocolConfig::Heartbeat(HeartbeatConfig {
            phi_failure_threshold: 8.0,
            ..HeartbeatConfig::default()
        });
        config.to_file(&config_path).unwrap();

        match ProtocolConfig::from_file(&config_path).unwrap() {
            ProtocolConfig::Heartbeat(loaded) => {
                assert_eq!(loaded.phi_failure_threshold, 8.0);
                assert_eq!(loaded.phi_window_size, 1024);
            }
            other => panic!("unexpected protocol config: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("broken.toml");
        std::fs::write(&config_path, "type = \"swim\"\ngossip_fanout = 0\n").unwrap();

        assert!(matches!(
            ProtocolConfig::from_file(&config_path),
            Err(MembershipError::Configuration(_))
        ));
        assert!(matches!(
            ProtocolConfig::from_file(temp_dir.path().join("missing.toml")),
            Err(MembershipError::Io(_))
        ));
    }
}
