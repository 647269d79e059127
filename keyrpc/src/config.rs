use device::SimulatedDevice;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_ENV: &str = "KEYRPC_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// NFC readers whose lowercased name contains this are hidden.
    pub reader_exclude: String,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            reader_exclude: "yubico yubikey".to_string(),
            log_filter: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub color: bool,
    pub history_file: Option<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            color: true,
            history_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub devices: Vec<SimulatedDevice>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            devices: vec![SimulatedDevice::default()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyrpcConfig {
    pub server: ServerConfig,
    pub shell: ShellConfig,
    pub simulator: SimulatorConfig,
}

impl KeyrpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reader_exclude(mut self, reader_exclude: impl Into<String>) -> Self {
        self.server.reader_exclude = reader_exclude.into();
        self
    }

    pub fn with_log_filter(mut self, log_filter: impl Into<String>) -> Self {
        self.server.log_filter = log_filter.into();
        self
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.shell.color = color;
        self
    }

    pub fn with_devices(mut self, devices: Vec<SimulatedDevice>) -> Self {
        self.simulator.devices = devices;
        self
    }

    pub fn from_toml(text: &str, path: &Path) -> ConfigResult<Self> {
        let config: KeyrpcConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or the file named by `KEYRPC_CONFIG` when no path is given.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => PathBuf::from(path),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                debug!(path = %path.display(), "loading config");
                Self::from_toml(&text, &path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.log_filter.trim().is_empty() {
            return Err(ConfigError::Invalid("log_filter cannot be empty".to_string()));
        }

        let mut serials = Vec::new();
        for device in &self.simulator.devices {
            device
                .version
                .parse::<device::Version>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            device
                .interfaces
                .parse::<device::UsbInterfaces>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if let Some(serial) = device.serial {
                if serials.contains(&serial) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate simulated serial {}",
                        serial
                    )));
                }
                serials.push(serial);
            }
        }

        Ok(())
    }
}
