use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub intel: IntelConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device MTU; frames read from the device never exceed this
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Re-analyze a flow every N packets
    #[serde(default = "default_analysis_packet_interval")]
    pub analysis_packet_interval: u64,

    /// Re-analyze a flow at least this often (seconds)
    #[serde(default = "default_analysis_time_interval")]
    pub analysis_time_interval_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            analysis_packet_interval: default_analysis_packet_interval(),
            analysis_time_interval_secs: default_analysis_time_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Flows idle for longer than this are considered complete (seconds)
    #[serde(default = "default_flow_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Completed flow ring capacity; oldest flows are evicted
    #[serde(default = "default_completed_capacity")]
    pub completed_capacity: usize,

    /// Per-flow packet history cap (timestamps and sizes)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_flow_timeout(),
            completed_capacity: default_completed_capacity(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout for TCP sessions (seconds)
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,

    /// Idle timeout for UDP sessions (seconds)
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,

    /// How often idle sessions and inactive flows are swept (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: default_tcp_timeout(),
            udp_timeout_secs: default_udp_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Recommend blocking connections scoring at or above 70
    #[serde(default)]
    pub auto_block: bool,

    /// Emit alert events at all
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,

    /// Minimum score for an alert
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u8,

    /// Only alert on CRITICAL-level findings
    #[serde(default)]
    pub critical_alerts_only: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            auto_block: false,
            notifications_enabled: true,
            alert_threshold: default_alert_threshold(),
            critical_alerts_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelConfig {
    /// Optional file with one indicator per line (IP or CIDR)
    #[serde(default)]
    pub feed_path: Option<String>,

    /// Reputation cache TTL (seconds)
    #[serde(default = "default_reputation_ttl")]
    pub reputation_ttl_secs: u64,

    /// Per-lookup reputation timeout (seconds)
    #[serde(default = "default_reputation_timeout")]
    pub reputation_timeout_secs: u64,

    /// Expected element count for the reputation Bloom filter
    #[serde(default = "default_bloom_expected")]
    pub bloom_expected_elements: usize,

    /// Target false-positive rate for the Bloom filter
    #[serde(default = "default_bloom_fp_rate")]
    pub bloom_fp_rate: f64,
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            feed_path: None,
            reputation_ttl_secs: default_reputation_ttl(),
            reputation_timeout_secs: default_reputation_timeout(),
            bloom_expected_elements: default_bloom_expected(),
            bloom_fp_rate: default_bloom_fp_rate(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mtu() -> usize {
    1500
}

fn default_analysis_packet_interval() -> u64 {
    50
}

fn default_analysis_time_interval() -> u64 {
    30
}

fn default_flow_timeout() -> u64 {
    30
}

fn default_completed_capacity() -> usize {
    1000
}

fn default_history_limit() -> usize {
    1000
}

fn default_tcp_timeout() -> u64 {
    300
}

fn default_udp_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_alert_threshold() -> u8 {
    50
}

fn default_reputation_ttl() -> u64 {
    24 * 60 * 60
}

fn default_reputation_timeout() -> u64 {
    10
}

fn default_bloom_expected() -> usize {
    10_000
}

fn default_bloom_fp_rate() -> f64 {
    0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture.mtu, 1500);
        assert_eq!(config.flow.inactivity_timeout_secs, 30);
        assert_eq!(config.session.tcp_timeout_secs, 300);
        assert_eq!(config.session.udp_timeout_secs, 60);
        assert!(!config.detection.auto_block);
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            [detection]
            auto_block = true
            alert_threshold = 40
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.detection.auto_block);
        assert_eq!(config.detection.alert_threshold, 40);
        // untouched sections keep their defaults
        assert_eq!(config.flow.completed_capacity, 1000);
    }
}
