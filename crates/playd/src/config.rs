//! Server configuration.
//!
//! Loaded once at startup from a JSON file; environment variables
//! (`PLAYD_*`) override file values, and defaults apply where both are
//! absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub services: ExternalServices,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub billing: BillingSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub port: u16,
    /// `*` allows any origin.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub state_path: PathBuf,
    pub hosts_collection: String,
    pub platforms_collection: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("/var/lib/playd"),
            hosts_collection: "hosts".to_string(),
            platforms_collection: "platforms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub voltgrid: VoltgridConfig,
    #[serde(default)]
    pub nimbus: NimbusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoltgridConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_token: String,
}

impl Default for VoltgridConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://api.voltgrid.io/v1".to_string(),
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NimbusConfig {
    pub enabled: bool,
    pub binary: PathBuf,
    pub config_path: Option<PathBuf>,
}

impl Default for NimbusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: PathBuf::from("/usr/local/bin/nimbus"),
            config_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalServices {
    pub gazetteer_endpoint: String,
    pub locator_endpoint: String,
    pub locator_project: String,
}

impl Default for ExternalServices {
    fn default() -> Self {
        Self {
            gazetteer_endpoint: "https://nominatim.openstreetmap.org".to_string(),
            locator_endpoint: "https://locator.nimbus.dev/v1".to_string(),
            locator_project: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    pub liveness_interval_secs: u64,
    pub liveness_jitter: f64,
    pub idle_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub stopped_ttl_secs: u64,
    pub monthly_soft_cap_usd: f64,
    pub monthly_hard_cap_usd: f64,
    pub strike_limit: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            liveness_interval_secs: 15 * 60,
            liveness_jitter: 0.10,
            idle_threshold_secs: 10 * 60,
            sweep_interval_secs: 24 * 60 * 60,
            stopped_ttl_secs: 48 * 60 * 60,
            monthly_soft_cap_usd: 400.0,
            monthly_hard_cap_usd: 500.0,
            strike_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingSettings {
    /// Path to a static rate file; the built-in table applies when unset.
    pub rate_table_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub max_inflight_provisions: usize,
    pub default_auto_stop_timeout_secs: u64,
    pub ssh_public_key: Option<String>,
    pub client_cert_path: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_inflight_provisions: 32,
            default_auto_stop_timeout_secs: 900,
            ssh_public_key: None,
            client_cert_path: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_var("PLAYD_BIND_ADDR") {
            self.api.bind_addr = v;
        }
        if let Some(v) = env_parse::<u16>("PLAYD_PORT") {
            self.api.port = v;
        }
        if let Some(v) = env_var("PLAYD_STATE_PATH") {
            self.persistence.state_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("PLAYD_VOLTGRID_API_BASE") {
            self.providers.voltgrid.api_base = v;
        }
        if let Some(v) = env_var("PLAYD_VOLTGRID_API_TOKEN") {
            self.providers.voltgrid.api_token = v;
            self.providers.voltgrid.enabled = true;
        }
        if let Some(v) = env_var("PLAYD_NIMBUS_BINARY") {
            self.providers.nimbus.binary = PathBuf::from(v);
            self.providers.nimbus.enabled = true;
        }
        if let Some(v) = env_var("PLAYD_NIMBUS_CONFIG") {
            self.providers.nimbus.config_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("PLAYD_GAZETTEER_ENDPOINT") {
            self.services.gazetteer_endpoint = v;
        }
        if let Some(v) = env_var("PLAYD_LOCATOR_ENDPOINT") {
            self.services.locator_endpoint = v;
        }
        if let Some(v) = env_var("PLAYD_LOCATOR_PROJECT") {
            self.services.locator_project = v;
        }
        if let Some(v) = env_var("PLAYD_RATE_TABLE") {
            self.billing.rate_table_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse::<f64>("PLAYD_MONTHLY_SOFT_CAP") {
            self.supervisor.monthly_soft_cap_usd = v;
        }
        if let Some(v) = env_parse::<f64>("PLAYD_MONTHLY_HARD_CAP") {
            self.supervisor.monthly_hard_cap_usd = v;
        }
        if let Some(v) = env_parse::<u64>("PLAYD_LIVENESS_INTERVAL_SECS") {
            self.supervisor.liveness_interval_secs = v;
        }
        if let Some(v) = env_parse::<u64>("PLAYD_IDLE_THRESHOLD_SECS") {
            self.supervisor.idle_threshold_secs = v;
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.supervisor.strike_limit, 3);
        assert_eq!(config.supervisor.stopped_ttl_secs, 48 * 60 * 60);
        assert!(!config.providers.voltgrid.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("playd.json");
        std::fs::write(&path, r#"{ "api": { "bind_addr": "127.0.0.1", "port": 9000, "cors_allowed_origins": ["https://play.example"] } }"#)
            .expect("write");

        let config = ServerConfig::load(&path).expect("load");
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.persistence.hosts_collection, "hosts");
        assert_eq!(config.supervisor.liveness_interval_secs, 900);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("playd.json");

        let mut config = ServerConfig::default();
        config.api.port = 9191;
        config.providers.voltgrid.enabled = true;
        config.save(&path).expect("save");

        let back = ServerConfig::load(&path).expect("load");
        assert_eq!(back.api.port, 9191);
        assert!(back.providers.voltgrid.enabled);
    }
}
