use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "rowlink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Persisted application configuration. The only value the link engine
/// itself depends on is `last_device_id`, written on a successful connect and
/// read back by the advertisement-driven reconnect.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub last_device_id: Option<String>,
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct ConfigService {
    config: Config,
    config_path: Option<PathBuf>,
}

impl ConfigService {
    pub fn new() -> anyhow::Result<Self> {
        let config_path = Self::config_path()?;
        let config = Self::load_from_file(&config_path).unwrap_or_default();

        Ok(Self {
            config,
            config_path: Some(config_path),
        })
    }

    /// An in-memory service that never touches disk. Used by tests and by
    /// hosts that manage persistence themselves.
    pub fn ephemeral() -> Self {
        Self {
            config: Config::default(),
            config_path: None,
        }
    }

    fn config_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("rowlink");
        fs::create_dir_all(&path)?;
        path.push("config.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Config> {
        let contents = fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.config_path {
            let json = serde_json::to_string_pretty(&self.config)?;
            fs::write(path, json)?;
        }
        Ok(())
    }

    pub fn get(&self) -> &Config {
        &self.config
    }

    pub fn last_device_id(&self) -> Option<String> {
        self.config.last_device_id.clone()
    }

    pub fn set_last_device_id(&mut self, device_id: &str) -> anyhow::Result<()> {
        if self.config.last_device_id.as_deref() != Some(device_id) {
            self.config.last_device_id = Some(device_id.to_string());
            self.save()?;
        }
        Ok(())
    }
}
