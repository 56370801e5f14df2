//! Driver Configuration
//!
//! YAML configuration for one array backend. Operator files are
//! hand-edited, so every string value is trimmed on load and empty optional
//! values are treated as absent before validation.

use crate::array::jobs::PollConfig;
use crate::domain::ports::Protocol;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Configuration Sections
// =============================================================================

/// Job polling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollSettings {
    /// Delay between two polls of a job, in milliseconds
    pub interval_ms: u64,
    /// Deadline for one job, in seconds
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_secs: 300,
        }
    }
}

/// Clone and snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloneSettings {
    /// Synchronization percentage to wait for before returning
    pub sync_percent: u8,
    /// Break the replica relationship once synchronized
    pub detach: bool,
}

impl Default for CloneSettings {
    fn default() -> Self {
        Self {
            sync_percent: 100,
            detach: true,
        }
    }
}

/// Masking hierarchy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaskingSettings {
    /// Delete and rebuild a view whose groups went missing
    pub rebuild_damaged_views: bool,
    /// Remove the view and its storage group once the last volume leaves
    pub cleanup_empty_groups: bool,
    /// Remove an initiator group no longer used by any view
    pub delete_unused_initiator_groups: bool,
}

impl Default for MaskingSettings {
    fn default() -> Self {
        Self {
            rebuild_damaged_views: true,
            cleanup_empty_groups: true,
            delete_unused_initiator_groups: false,
        }
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

/// Configuration of one array backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    /// Name reported in volume stats
    pub backend_name: String,
    /// Array serial number
    pub array: String,
    /// Default pool for new volumes
    pub pool: String,
    /// FAST policy; enables tiered provisioning when set
    pub fast_policy: Option<String>,
    /// Operator-managed port groups, one is chosen per host
    pub port_groups: Vec<String>,
    /// Host attachment protocol
    pub protocol: Protocol,
    /// Capacity kept in reserve, reported in stats
    pub reserved_percentage: u32,
    /// Job polling
    pub poll: PollSettings,
    /// Clone behavior
    pub clone: CloneSettings,
    /// Masking behavior
    pub masking: MaskingSettings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend_name: "SMIS_BLOCK".to_string(),
            array: String::new(),
            pool: String::new(),
            fast_policy: None,
            port_groups: Vec::new(),
            protocol: Protocol::Iscsi,
            reserved_percentage: 0,
            poll: PollSettings::default(),
            clone: CloneSettings::default(),
            masking: MaskingSettings::default(),
        }
    }
}

impl DriverConfig {
    /// Load, normalize and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading driver configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse, normalize and validate YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: DriverConfig = serde_yaml::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Trim string values and drop empty optional entries
    pub fn normalize(&mut self) {
        self.backend_name = self.backend_name.trim().to_string();
        self.array = self.array.trim().to_string();
        self.pool = self.pool.trim().to_string();
        self.fast_policy = self
            .fast_policy
            .take()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self.port_groups = self
            .port_groups
            .iter()
            .map(|pg| pg.trim().to_string())
            .filter(|pg| !pg.is_empty())
            .collect();
    }

    /// Check required settings
    pub fn validate(&self) -> Result<()> {
        if self.array.is_empty() {
            return Err(Error::InvalidConfiguration("array serial is required".into()));
        }
        if self.pool.is_empty() {
            return Err(Error::InvalidConfiguration("pool is required".into()));
        }
        if self.port_groups.is_empty() {
            return Err(Error::InvalidConfiguration(
                "at least one port group is required".into(),
            ));
        }
        if self.poll.interval_ms == 0 || self.poll.timeout_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "poll interval and timeout must be positive".into(),
            ));
        }
        if self.clone.sync_percent == 0 || self.clone.sync_percent > 100 {
            return Err(Error::InvalidConfiguration(format!(
                "clone sync_percent must be within 1..=100, got {}",
                self.clone.sync_percent
            )));
        }
        if self.reserved_percentage > 100 {
            return Err(Error::InvalidConfiguration(format!(
                "reserved_percentage must be within 0..=100, got {}",
                self.reserved_percentage
            )));
        }
        Ok(())
    }

    /// Polling parameters for the job poller
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll.interval_ms),
            timeout: Duration::from_secs(self.poll.timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert!(config.masking.rebuild_damaged_views);
        assert!(config.masking.cleanup_empty_groups);
        assert!(!config.masking.delete_unused_initiator_groups);
        assert_eq!(config.clone.sync_percent, 100);
        assert_eq!(config.poll_config().timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let raw = r#"
array: "  1234567891011  "
pool: " gold "
fast_policy: "   "
port_groups:
  - " OS-PORTGROUP1-PG "
  - ""
protocol: fc
"#;
        let config = DriverConfig::from_yaml(raw).unwrap();
        assert_eq!(config.array, "1234567891011");
        assert_eq!(config.pool, "gold");
        assert_eq!(config.fast_policy, None);
        assert_eq!(config.port_groups, vec!["OS-PORTGROUP1-PG".to_string()]);
        assert_eq!(config.protocol, Protocol::Fc);
    }

    #[test]
    fn test_missing_port_group_is_invalid() {
        let raw = "array: \"000195900551\"\npool: gold\n";
        assert_matches!(
            DriverConfig::from_yaml(raw),
            Err(Error::InvalidConfiguration(_))
        );
    }

    #[test]
    fn test_bad_sync_percent_is_invalid() {
        let raw = "array: a\npool: p\nport_groups: [pg]\nclone:\n  sync_percent: 0\n";
        assert_matches!(
            DriverConfig::from_yaml(raw),
            Err(Error::InvalidConfiguration(_))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "array: '000195900551'\npool: SRP_1\nfast_policy: GOLD1\nport_groups: [OS-PG1]\npoll:\n  interval_ms: 50"
        )
        .unwrap();
        let config = DriverConfig::load(file.path()).unwrap();
        assert_eq!(config.fast_policy.as_deref(), Some("GOLD1"));
        assert_eq!(config.poll_config().interval, Duration::from_millis(50));
        assert_eq!(config.poll.timeout_secs, 300);
    }

    #[test]
    fn test_load_missing_file() {
        assert_matches!(
            DriverConfig::load("/nonexistent/driver.yaml"),
            Err(Error::Io(_))
        );
    }
}
