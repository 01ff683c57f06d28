//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::device::{
    FileDevice, FileDeviceConfig, FileLayout, NativeDevice, NativeDeviceConfig, NativeDriver,
    PollerMode, PollerPool, PollerPoolConfig,
};
use crate::error::DeviceError;

const ENV_CONFIG_PATH: &str = "FASTER_IO_CONFIG";
const ENV_PREFIX: &str = "FASTER_IO__";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
    /// The configured device could not be opened.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FasterIoConfig {
    /// Device configuration.
    pub device: Option<DeviceConfigSpec>,
    /// Native poller pool configuration.
    pub poller: Option<PollerConfigSpec>,
}

impl FasterIoConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `FASTER_IO_CONFIG` env var (if set),
    /// then apply `FASTER_IO__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(ENV_CONFIG_PATH).ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["device", "kind"] => {
                    self.device_mut().kind = Some(value);
                }
                ["device", "name"] => {
                    self.device_mut().name = Some(value);
                }
                ["device", "path"] => {
                    self.device_mut().path = Some(PathBuf::from(value));
                }
                ["device", "layout"] => {
                    self.device_mut().layout = Some(parse_value(&key, &value)?);
                }
                ["device", "sector_size"] => {
                    self.device_mut().sector_size = Some(parse_value(&key, &value)?);
                }
                ["device", "capacity"] => {
                    self.device_mut().capacity = Some(parse_value(&key, &value)?);
                }
                ["device", "base_offset"] => {
                    self.device_mut().base_offset = Some(parse_value(&key, &value)?);
                }
                ["device", "throttle_limit"] => {
                    self.device_mut().throttle_limit = Some(parse_value(&key, &value)?);
                }
                ["device", "io_threads"] => {
                    self.device_mut().io_threads = Some(parse_value(&key, &value)?);
                }
                ["device", "delete_on_close"] => {
                    self.device_mut().delete_on_close = Some(parse_value(&key, &value)?);
                }
                ["device", "nsid"] => {
                    self.device_mut().nsid = Some(parse_value(&key, &value)?);
                }
                ["poller", "mode"] => {
                    self.poller_mut().mode = Some(parse_value(&key, &value)?);
                }
                ["poller", "slots"] => {
                    self.poller_mut().slots = Some(parse_value(&key, &value)?);
                }
                ["poller", "first_core"] => {
                    self.poller_mut().first_core = Some(parse_value(&key, &value)?);
                }
                ["poller", "poll_batch"] => {
                    self.poller_mut().poll_batch = Some(parse_value(&key, &value)?);
                }
                ["poller", "acquire_timeout_ms"] => {
                    self.poller_mut().acquire_timeout_ms = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Resolve a device configuration, if present.
    pub fn device_config(&self) -> Result<Option<DeviceConfig>, ConfigError> {
        match self.device.as_ref() {
            Some(spec) => Ok(Some(spec.resolve()?)),
            None => Ok(None),
        }
    }

    /// Build the poller pool configuration using defaults plus overrides.
    pub fn poller_config(&self) -> Result<PollerPoolConfig, ConfigError> {
        let mut config = PollerPoolConfig::default();
        if let Some(nsid) = self.device.as_ref().and_then(|d| d.nsid) {
            config.nsid = nsid;
        }
        if let Some(poller) = &self.poller {
            poller.apply_to(&mut config)?;
        }
        Ok(config)
    }

    /// Open a file device from the configuration, if one is configured.
    pub fn open_file_device(&self) -> Result<Option<FileDevice>, ConfigError> {
        match self.device_config()? {
            Some(DeviceConfig::File(config)) => Ok(Some(FileDevice::open(config)?)),
            _ => Ok(None),
        }
    }

    /// Build a poller pool for `driver` from the `[poller]` section.
    pub fn build_poller_pool<D: NativeDriver>(
        &self,
        driver: Arc<D>,
    ) -> Result<Arc<PollerPool<D>>, ConfigError> {
        Ok(PollerPool::new(driver, self.poller_config()?)?)
    }

    /// Open a native device on `pool`, if one is configured.
    pub fn open_native_device<D: NativeDriver>(
        &self,
        pool: &Arc<PollerPool<D>>,
    ) -> Result<Option<NativeDevice<D>>, ConfigError> {
        match self.device_config()? {
            Some(DeviceConfig::Native(config)) => Ok(Some(NativeDevice::open(pool, config)?)),
            _ => Ok(None),
        }
    }

    fn device_mut(&mut self) -> &mut DeviceConfigSpec {
        self.device.get_or_insert_with(DeviceConfigSpec::default)
    }

    fn poller_mut(&mut self) -> &mut PollerConfigSpec {
        self.poller.get_or_insert_with(PollerConfigSpec::default)
    }
}

/// Device configuration from TOML/env.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfigSpec {
    /// Device kind: "file" or "native".
    pub kind: Option<String>,
    /// Device name.
    pub name: Option<String>,
    /// Backing file or segment prefix (file devices).
    pub path: Option<PathBuf>,
    /// File layout: "single_file" or "segment_files".
    pub layout: Option<FileLayout>,
    /// Sector size in bytes (file devices).
    pub sector_size: Option<u32>,
    /// Capacity in bytes.
    pub capacity: Option<u64>,
    /// Base physical address offset.
    pub base_offset: Option<u64>,
    /// Advisory throttle limit.
    pub throttle_limit: Option<u64>,
    /// Blocking I/O threads (file devices).
    pub io_threads: Option<usize>,
    /// Delete backing files on dispose (file devices).
    pub delete_on_close: Option<bool>,
    /// Namespace id (native devices).
    pub nsid: Option<u32>,
}

impl DeviceConfigSpec {
    fn resolve(&self) -> Result<DeviceConfig, ConfigError> {
        let kind = self.kind.as_deref().map(|v| v.to_ascii_lowercase());
        let name = self.name.clone().unwrap_or_else(|| "hlog".to_string());

        match kind.as_deref() {
            Some("file") => self.resolve_file(name),
            Some("native") => {
                let mut config = NativeDeviceConfig::new(name);
                if let Some(value) = self.base_offset {
                    config.base_offset = value;
                }
                if let Some(value) = self.throttle_limit {
                    config.throttle_limit = value;
                }
                config.capacity = self.capacity;
                Ok(DeviceConfig::Native(config))
            }
            None if self.path.is_some() => self.resolve_file(name),
            None => Err(ConfigError::MissingField("device.kind".into())),
            Some(other) => Err(ConfigError::InvalidValue {
                key: "device.kind".into(),
                value: other.into(),
            }),
        }
    }

    fn resolve_file(&self, name: String) -> Result<DeviceConfig, ConfigError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| ConfigError::MissingField("device.path".into()))?;
        let mut config = FileDeviceConfig::new(name, path);
        if let Some(value) = self.layout {
            config.layout = value;
        }
        if let Some(value) = self.sector_size {
            config.sector_size = value;
        }
        if let Some(value) = self.base_offset {
            config.base_offset = value;
        }
        if let Some(value) = self.throttle_limit {
            config.throttle_limit = value;
        }
        if let Some(value) = self.io_threads {
            config.io_threads = value.max(1);
        }
        if let Some(value) = self.delete_on_close {
            config.delete_on_close = value;
        }
        config.capacity = self.capacity;
        Ok(DeviceConfig::File(config))
    }
}

/// Poller pool configuration from TOML/env.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollerConfigSpec {
    /// Polling mode: "pinned" or "shared".
    pub mode: Option<PollerMode>,
    /// Number of native handles.
    pub slots: Option<usize>,
    /// Core of the first slot.
    pub first_core: Option<i32>,
    /// Completions per poll call.
    pub poll_batch: Option<u32>,
    /// Pinned lease wait in milliseconds.
    pub acquire_timeout_ms: Option<u64>,
}

impl PollerConfigSpec {
    fn apply_to(&self, config: &mut PollerPoolConfig) -> Result<(), ConfigError> {
        if let Some(value) = self.mode {
            config.mode = value;
        }
        if let Some(value) = self.slots {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "poller.slots".into(),
                    value: value.to_string(),
                });
            }
            config.slots = value;
        }
        if let Some(value) = self.first_core {
            config.first_core = value;
        }
        if let Some(value) = self.poll_batch {
            config.poll_batch = value.max(1);
        }
        if let Some(value) = self.acquire_timeout_ms {
            config.acquire_timeout = Duration::from_millis(value);
        }
        Ok(())
    }
}

/// Resolved device configuration.
#[derive(Debug, Clone)]
pub enum DeviceConfig {
    /// File-backed device.
    File(FileDeviceConfig),
    /// Native driver device.
    Native(NativeDeviceConfig),
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
