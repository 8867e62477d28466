//! Configuration: a read-only parameter source consumed by the detector and
//! the alert emitter. Loaded once at startup from an optional TOML file
//! layered with environment overrides, then shared without locks.

use serde::{Deserialize, Serialize};

use crate::error::{IdsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub port_scan_threshold: u32,
    pub syn_flood_threshold: u32,
    pub ddos_threshold: u32,
    /// Reserved: no implemented data source upstream of this field yet.
    pub brute_force_threshold: u32,
    pub port_scan_window_secs: u64,
    pub rate_window_secs: u64,
    pub flow_idle_timeout_secs: u64,
    pub syn_tracker_keying: SynTrackerKeying,
}

/// The source's `syn_tracker` is keyed by `dst_ip` alone in some variants and
/// by `(src_ip, dst_ip)` in others. This crate keys by `dst_ip` alone by
/// default (the most recent variant) and exposes this switch for the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynTrackerKeying {
    DstOnly,
    SrcDst,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            port_scan_threshold: 10,
            syn_flood_threshold: 100,
            ddos_threshold: 100,
            brute_force_threshold: 5,
            port_scan_window_secs: 60,
            rate_window_secs: 1,
            flow_idle_timeout_secs: 60,
            syn_tracker_keying: SynTrackerKeying::DstOnly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocationConfig {
    pub enabled: bool,
    pub cache_size: usize,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseIpDbConfig {
    pub enabled: bool,
    pub api_key: String,
    pub cache_ttl_secs: u64,
    pub confidence_threshold: u8,
}

impl Default for AbuseIpDbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            cache_ttl_secs: 86_400,
            confidence_threshold: 75,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatIntelligenceConfig {
    pub abuseipdb: AbuseIpDbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub url: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000/api/alert".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailNotifierConfig {
    pub enabled: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub sender: String,
    pub password: String,
    pub recipients: Vec<String>,
}

impl Default for EmailNotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: String::new(),
            smtp_port: 587,
            sender: String::new(),
            password: String::new(),
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookNotifierConfig {
    pub enabled: bool,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub email: EmailNotifierConfig,
    pub slack: WebhookNotifierConfig,
    pub discord: WebhookNotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "ids_alerts.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Append-only newline-delimited JSON log, sink 1 of the emitter's
    /// fixed {log, store, push, notifiers} fan-out order.
    pub log_path: String,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            log_path: "ids_alerts.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Bounded queue capacity between the capture producer and the
    /// analyzer/detector consumer.
    pub queue_capacity: usize,
    pub use_simulation: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5000,
            use_simulation: false,
        }
    }
}

/// Top-level configuration, read-only after startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdsConfig {
    pub network: NetworkConfig,
    pub capture: CaptureConfig,
    pub detection: DetectionConfig,
    pub geolocation: GeolocationConfig,
    pub threat_intelligence: ThreatIntelligenceConfig,
    pub dashboard: DashboardConfig,
    pub notifications: NotificationsConfig,
    pub database: DatabaseConfig,
    pub alerting: AlertingConfig,
}

impl IdsConfig {
    /// Load configuration from an optional TOML file, then apply the
    /// documented environment variable overrides. A present-but-unparseable
    /// file is a fatal configuration error; a missing file is not.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&IdsConfig::default())
                .map_err(|e| IdsError::Config(e.to_string()))?);

        if let Some(path) = path {
            if std::path::Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            }
        }

        let built = builder
            .build()
            .map_err(|e| IdsError::Config(e.to_string()))?;

        let mut cfg: IdsConfig = built
            .try_deserialize()
            .map_err(|e| IdsError::Config(e.to_string()))?;

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(iface) = std::env::var("IDS_INTERFACE") {
            self.network.interface = iface;
        }
        if let Ok(url) = std::env::var("DASHBOARD_URL") {
            self.dashboard.url = url;
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            self.database.path = path;
        }
        if let Ok(key) = std::env::var("ABUSEIPDB_API_KEY") {
            self.threat_intelligence.abuseipdb.api_key = key;
        }
        if let Ok(url) = std::env::var("SLACK_WEBHOOK_URL") {
            self.notifications.slack.webhook_url = url;
        }
        if let Ok(url) = std::env::var("DISCORD_WEBHOOK_URL") {
            self.notifications.discord.webhook_url = url;
        }
    }

    pub fn port_scan_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.detection.port_scan_window_secs)
    }

    pub fn rate_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.detection.rate_window_secs)
    }

    pub fn flow_idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.detection.flow_idle_timeout_secs)
    }

    pub fn abuseipdb_cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.threat_intelligence.abuseipdb.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = IdsConfig::default();
        assert_eq!(cfg.network.interface, "eth0");
        assert_eq!(cfg.detection.port_scan_threshold, 10);
        assert_eq!(cfg.detection.syn_flood_threshold, 100);
        assert_eq!(cfg.detection.ddos_threshold, 100);
        assert_eq!(cfg.detection.brute_force_threshold, 5);
        assert!(cfg.geolocation.enabled);
        assert_eq!(cfg.geolocation.cache_size, 1000);
        assert!(!cfg.threat_intelligence.abuseipdb.enabled);
        assert_eq!(cfg.threat_intelligence.abuseipdb.cache_ttl_secs, 86_400);
        assert_eq!(cfg.threat_intelligence.abuseipdb.confidence_threshold, 75);
        assert_eq!(cfg.dashboard.url, "http://localhost:5000/api/alert");
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = IdsConfig::default();
        let serialized = toml::to_string(&cfg).expect("serialize");
        let deserialized: IdsConfig = toml::from_str(&serialized).expect("deserialize");
        assert_eq!(cfg.network.interface, deserialized.network.interface);
        assert_eq!(
            cfg.detection.port_scan_threshold,
            deserialized.detection.port_scan_threshold
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = IdsConfig::load(Some("/nonexistent/path/ids.toml")).expect("load");
        assert_eq!(cfg.network.interface, "eth0");
    }

    #[test]
    fn env_override_wins_over_file_default() {
        std::env::set_var("IDS_INTERFACE", "eth9");
        let cfg = IdsConfig::load(None).expect("load");
        assert_eq!(cfg.network.interface, "eth9");
        std::env::remove_var("IDS_INTERFACE");
    }
}
