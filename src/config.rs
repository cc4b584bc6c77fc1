use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_HEARTBEAT_FAILURES: u32 = 3;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.3;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
pub const DEFAULT_STORAGE_KEY: &str = "chatwire_message_queue";

const CONFIG_FILE_NAME: &str = "config.json";

/// Everything a `ChatClient` can be tuned with. Missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub queue: QueueConfig,
    pub serializer: SerializerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Start probing automatically whenever the connection opens.
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_failures: u32,
    /// Let the client force-close a connection the monitor declared dead.
    pub close_on_dead: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            enabled: true,
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_failures: DEFAULT_MAX_HEARTBEAT_FAILURES,
            close_on_dead: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_backoff: bool,
    /// Upper bound of the random fraction added to each exponential delay (0.0 - 1.0).
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: true,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            exponential_backoff: true,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub storage_key: String,
    /// Directory for the file-backed queue store. `None` uses the user data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            storage_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Text,
    /// UTF-8 bytes of the JSON text, sent as binary frames.
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    pub validate: bool,
    pub format: WireFormat,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        SerializerConfig {
            validate: true,
            format: WireFormat::Text,
        }
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the per-user config file. Only the first call wins.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("chatwire");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

pub fn save_config(config: &ClientConfig) -> Result<()> {
    save_config_to(&get_config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Configuration saved to {}", path.display());
    Ok(())
}

/// Load the config file, or `None` when there is none yet.
pub fn load_config() -> Result<Option<ClientConfig>> {
    load_config_from(&get_config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Option<ClientConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: ClientConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("Invalid configuration in {}: {}", path.display(), e))?;
    info!("Loaded configuration from {}", path.display());

    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.heartbeat.max_failures, 3);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.jitter_factor, 0.3);
        assert_eq!(config.queue.max_queue_size, 100);
        assert_eq!(config.queue.storage_key, "chatwire_message_queue");
        assert!(config.serializer.validate);
        assert_eq!(config.serializer.format, WireFormat::Text);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"reconnect": {"max_attempts": 2}, "serializer": {"format": "binary"}}"#,
        )
        .unwrap();

        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert_eq!(config.serializer.format, WireFormat::Binary);
        assert!(config.serializer.validate);
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        assert!(load_config_from(&path).unwrap().is_none());

        let mut config = ClientConfig::default();
        config.heartbeat.interval_ms = 5_000;
        config.queue.storage_dir = Some(dir.path().to_path_buf());
        save_config_to(&path, &config).unwrap();

        let loaded = load_config_from(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    // The only test in this binary that sets the process-wide override
    #[test]
    fn test_path_override_redirects_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.json");

        assert!(set_config_path_override(path.clone()));
        assert!(!set_config_path_override(dir.path().join("other.json")));
        assert_eq!(get_config_path().unwrap(), path);
        assert!(load_config().unwrap().is_none());

        let mut config = ClientConfig::default();
        config.reconnect.max_attempts = 4;
        save_config(&config).unwrap();

        assert!(path.exists());
        assert_eq!(load_config().unwrap(), Some(config));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(load_config_from(&path).is_err());
    }
}
