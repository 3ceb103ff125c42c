use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::clock::{Clock, ManualClock, SystemClock};
use crate::error::StationError;
use crate::params::DeviceParams;
use crate::registry::resolve_addresses;
use crate::types::DeviceRole;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub instruments: InstrumentsConfig,
    pub files: FilesConfig,
    pub sweep: SweepConfig,
    pub journal: JournalConfig,
    pub console: ConsoleConfig,
    /// Devices under test, keyed by name
    pub devices: BTreeMap<String, DeviceParams>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process doubles that accept every command
    Mock,
    /// Raw SCPI over TCP
    Socket,
}

impl Backend {
    /// Settle delays are only real against real instruments
    pub fn clock(&self) -> Box<dyn Clock> {
        match self {
            Backend::Mock => Box::new(ManualClock::new()),
            Backend::Socket => Box::new(SystemClock),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstrumentsConfig {
    pub backend: Backend,
    /// Address overrides keyed by role name (`scope`, `gen_input`, ...)
    pub addresses: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FilesConfig {
    pub params_file: PathBuf,
    pub adjustment_template: PathBuf,
    pub export_dir: PathBuf,
    /// Searched for a result source when the device names none
    pub result_source_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    None,
    Settings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepConfig {
    pub capture: CaptureMode,
    pub waveform_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JournalConfig {
    pub enabled: bool,
    pub output_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instruments: InstrumentsConfig::default(),
            files: FilesConfig::default(),
            sweep: SweepConfig::default(),
            journal: JournalConfig::default(),
            console: ConsoleConfig::default(),
            devices: BTreeMap::from([(
                "receiver".to_string(),
                DeviceParams {
                    values: BTreeMap::from([("F".to_string(), 1.0)]),
                    ..Default::default()
                },
            )]),
        }
    }
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Mock,
            addresses: HashMap::new(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            params_file: PathBuf::from("params.json"),
            adjustment_template: PathBuf::from("adjust.json"),
            export_dir: PathBuf::from("export"),
            result_source_dir: PathBuf::from("."),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            capture: CaptureMode::None,
            waveform_dir: None,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_path: "./logs".to_string(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Address overrides resolved to roles
    pub fn addresses(&self) -> Result<HashMap<DeviceRole, String>, StationError> {
        resolve_addresses(&self.instruments.addresses)
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["bench_station.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Overrides such as BENCH_STATION__CONSOLE__VERBOSITY=debug
    builder = builder.add_source(
        Environment::with_prefix("BENCH_STATION")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.instruments.backend, Backend::Mock);
        assert_eq!(config.files.params_file, PathBuf::from("params.json"));
        assert_eq!(config.devices["receiver"].values["F"], 1.0);
        assert!(config.addresses().unwrap().is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");
        std::fs::write(
            &path,
            r#"
[instruments]
backend = "socket"

[instruments.addresses]
scope = "10.0.0.5:5025"
gen_ref = "10.0.0.6:5025"

[sweep]
capture = "settings"

[console]
verbosity = "debug"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.instruments.backend, Backend::Socket);
        assert_eq!(config.sweep.capture, CaptureMode::Settings);
        assert_eq!(config.console.verbosity, "debug");
        // Untouched sections keep their defaults
        assert_eq!(config.files.export_dir, PathBuf::from("export"));

        let addresses = config.addresses().unwrap();
        assert_eq!(addresses[&DeviceRole::Oscilloscope], "10.0.0.5:5025");
        assert_eq!(addresses[&DeviceRole::GeneratorReference], "10.0.0.6:5025");
    }

    #[test]
    fn test_unknown_role_in_addresses() {
        let mut config = AppConfig::default();
        config
            .instruments
            .addresses
            .insert("analyzer".to_string(), "GPIB1::9::INSTR".to_string());
        assert!(matches!(config.addresses(), Err(StationError::UnknownDevice(_))));
    }

    #[test]
    fn test_mock_backend_skips_settle_delays() {
        let started = std::time::Instant::now();
        Backend::Mock.clock().settle(std::time::Duration::from_secs(5));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_config(Some(&path)).is_err());

        let config = load_config_or_default(Some(&path));
        assert_eq!(config.console.verbosity, "info");
    }
}
