//! Service configuration
//!
//! Sources, lowest priority first: built-in defaults, the config file
//! (YAML, TOML or JSON by extension), then `LABSRV_` environment variables
//! with `__` separating nested keys (`LABSRV_CONNECTION__CONNECT_TIMEOUT_MS`).

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{ConnectionParams, ProtocolKind, TransportMode, DEFAULT_SEND_QUEUE_CAPACITY};
use crate::error::{LabSrvError, Result};
use crate::interpreter::{ASTM_GENERIC, HL7_GENERIC};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "LABSRV_";

fn default_service_name() -> String {
    "labsrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Service identity and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Overridden by `LABSRV_LOG_DIR`
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_true")]
    pub log_to_file: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: None,
            log_to_file: true,
        }
    }
}

/// Local result store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/labsrv.db".to_string(),
        }
    }
}

/// Transport tuning shared by every instrument connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    /// Read idle timeout before the first idle event
    pub idle_timeout_ms: u64,
    /// Read idle timeout after the first idle event
    pub widened_idle_timeout_ms: u64,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub send_queue_capacity: usize,
    /// Time a closing session gets before it is aborted
    pub disconnect_grace_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 300_000,
            widened_idle_timeout_ms: 600_000,
            send_buffer_size: 64 * 1024,
            recv_buffer_size: 64 * 1024,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            disconnect_grace_ms: 2_000,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn widened_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.widened_idle_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// One configured instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub mode: TransportMode,
    pub protocol: ProtocolKind,
    /// Interpretation strategy tag; defaults to the protocol's generic one
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub lab_name: String,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl InstrumentConfig {
    pub fn to_params(&self) -> ConnectionParams {
        let machine_type = match &self.machine_type {
            Some(tag) if !tag.trim().is_empty() => tag.trim().to_string(),
            _ if self.protocol.is_astm() => ASTM_GENERIC.to_string(),
            _ => HL7_GENERIC.to_string(),
        };
        ConnectionParams {
            mode: self.mode,
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            instrument_id: self.id.clone(),
            machine_type,
            lab_name: self.lab_name.clone(),
            auto_reconnect: self.auto_reconnect,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Full configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// Loaded and validated configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: AppConfig,
}

impl ConfigManager {
    /// Load from a file, merged over defaults and under the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| LabSrvError::config("Invalid file extension"))?;

        // Missing keys fall back to the serde defaults
        let figment = Figment::new();
        let figment = match extension {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(LabSrvError::config(format!(
                    "Unsupported config format: {extension}"
                )))
            },
        };

        debug!("Loading configuration from {}", path.display());
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate an assembled figment
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| LabSrvError::config(format!("Failed to parse config: {e}")))?;
        let manager = Self::from_config(config)?;
        info!(
            "Configuration loaded: {} instrument(s)",
            manager.config.instruments.len()
        );
        Ok(manager)
    }

    pub fn from_config(config: AppConfig) -> Result<Self> {
        let manager = Self { config };
        manager.validate()?;
        Ok(manager)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.config.service
    }

    pub fn storage_config(&self) -> &StorageConfig {
        &self.config.storage
    }

    pub fn connection_settings(&self) -> &ConnectionSettings {
        &self.config.connection
    }

    pub fn instruments(&self) -> &[InstrumentConfig] {
        &self.config.instruments
    }

    /// Enabled instruments only
    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentConfig> {
        self.config.instruments.iter().filter(|i| i.enabled)
    }

    pub fn instrument(&self, id: &str) -> Option<&InstrumentConfig> {
        self.config.instruments.iter().find(|i| i.id == id)
    }

    /// Fresh connection parameters for one instrument
    pub fn params_for(&self, id: &str) -> Result<ConnectionParams> {
        self.instrument(id)
            .map(InstrumentConfig::to_params)
            .ok_or_else(|| LabSrvError::config(format!("Unknown instrument: {id}")))
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for instrument in &self.config.instruments {
            if instrument.id.trim().is_empty() {
                return Err(LabSrvError::config("Instrument with empty id"));
            }
            if !ids.insert(instrument.id.as_str()) {
                return Err(LabSrvError::config(format!(
                    "Duplicate instrument id: {}",
                    instrument.id
                )));
            }
            let params = instrument.to_params();
            params.validate()?;
            if !keys.insert(params.key()) {
                return Err(LabSrvError::config(format!(
                    "Instrument {} reuses connection {}",
                    instrument.id,
                    params.key()
                )));
            }
        }

        let conn = &self.config.connection;
        if conn.connect_timeout_ms == 0 {
            return Err(LabSrvError::config("connect_timeout_ms must be positive"));
        }
        if conn.widened_idle_timeout_ms < conn.idle_timeout_ms {
            return Err(LabSrvError::config(
                "widened_idle_timeout_ms must not be below idle_timeout_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE_YAML: &str = r#"
service:
  name: labsrv-test
  log_level: debug
storage:
  sqlite_path: /tmp/labsrv-test.db
connection:
  connect_timeout_ms: 2500
instruments:
  - id: VL-01
    host: 10.0.0.21
    port: 5100
    mode: dial
    protocol: astm-checksum
    lab_name: Central Lab
  - id: PCR-2
    host: 0.0.0.0
    port: 6200
    mode: listen
    protocol: hl7
    machine_type: hl7-dual-channel
    auto_reconnect: false
"#;

    fn write_config(contents: &str, suffix: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_with_defaults() {
        let file = write_config(SAMPLE_YAML, ".yaml");
        let manager = ConfigManager::from_file(file.path()).unwrap();

        assert_eq!(manager.service_config().name, "labsrv-test");
        assert_eq!(manager.storage_config().sqlite_path, "/tmp/labsrv-test.db");
        let conn = manager.connection_settings();
        assert_eq!(conn.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(conn.idle_timeout(), Duration::from_secs(300));
        assert_eq!(conn.widened_idle_timeout(), Duration::from_secs(600));
        assert_eq!(conn.send_queue_capacity, 100);

        let vl = manager.params_for("VL-01").unwrap();
        assert_eq!(vl.machine_type, ASTM_GENERIC);
        assert!(vl.auto_reconnect);
        assert_eq!(vl.key().as_str(), "10.0.0.21:5100:dial:astm-checksum");

        let pcr = manager.params_for("PCR-2").unwrap();
        assert_eq!(pcr.machine_type, "hl7-dual-channel");
        assert!(!pcr.auto_reconnect);
        assert!(manager.params_for("nope").is_err());
    }

    #[test]
    fn test_toml_is_accepted() {
        let file = write_config(
            "[storage]\nsqlite_path = \"x.db\"\n\n[[instruments]]\nid = \"A\"\nhost = \"h\"\nport = 1\nmode = \"dial\"\nprotocol = \"hl7\"\n",
            ".toml",
        );
        let manager = ConfigManager::from_file(file.path()).unwrap();
        assert_eq!(manager.instruments().len(), 1);
        assert_eq!(manager.params_for("A").unwrap().machine_type, HL7_GENERIC);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_config("x", ".ini");
        assert!(matches!(
            ConfigManager::from_file(file.path()),
            Err(LabSrvError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_duplicates_and_missing_port() {
        let base = InstrumentConfig {
            id: "A".to_string(),
            name: None,
            host: "h".to_string(),
            port: 1,
            mode: TransportMode::Dial,
            protocol: ProtocolKind::Hl7,
            machine_type: None,
            lab_name: String::new(),
            auto_reconnect: true,
            enabled: true,
        };

        let mut dup_id = AppConfig::default();
        dup_id.instruments = vec![base.clone(), InstrumentConfig { port: 2, ..base.clone() }];
        assert!(ConfigManager::from_config(dup_id).is_err());

        let mut dup_key = AppConfig::default();
        dup_key.instruments = vec![base.clone(), InstrumentConfig { id: "B".to_string(), ..base.clone() }];
        assert!(ConfigManager::from_config(dup_key).is_err());

        let mut no_port = AppConfig::default();
        no_port.instruments = vec![InstrumentConfig { port: 0, ..base }];
        assert!(ConfigManager::from_config(no_port).is_err());
    }
}
