// Configuration management for the txrelay CLI
//
// Stored as JSON in:
// - macOS: ~/Library/Application Support/txrelay/config.json
// - Linux: ~/.config/txrelay/config.json
// - Windows: %APPDATA%\txrelay\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use txrelay_core::config::RelayConfig;

const LOG_DIR_KEY: &str = "log_dir";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay tunables, flattened so `config set ack_timeout_ms 2000` works
    #[serde(flatten)]
    pub relay: RelayConfig,

    /// Directory for the daily rolling log file; unset logs to stderr only
    pub log_dir: Option<String>,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("txrelay");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the platform location, creating defaults on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .relay
                .validate()
                .context("Config file holds invalid relay settings")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    fn as_object(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self).context("Failed to serialize config")? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("Config did not serialize to an object"),
        }
    }

    /// Set a value in memory. The result is validated before it replaces `self`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut map = self.as_object()?;
        let current = map
            .get(key)
            .with_context(|| format!("Unknown config key: {}", key))?;

        let parsed = if key == LOG_DIR_KEY {
            if value.is_empty() {
                Value::Null
            } else {
                Value::String(value.to_string())
            }
        } else {
            match current {
                Value::Number(_) => Value::Number(
                    value
                        .parse::<u64>()
                        .with_context(|| format!("Invalid number for {}: {}", key, value))?
                        .into(),
                ),
                Value::Bool(_) => Value::Bool(
                    value
                        .parse()
                        .with_context(|| format!("Invalid boolean for {}: {}", key, value))?,
                ),
                _ => Value::String(value.to_string()),
            }
        };
        map.insert(key.to_string(), parsed);

        let updated: Config =
            serde_json::from_value(Value::Object(map)).context("Failed to apply config value")?;
        updated
            .relay
            .validate()
            .with_context(|| format!("Rejected {} = {}", key, value))?;
        *self = updated;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let map = self.as_object().ok()?;
        map.get(key).map(render)
    }

    /// All keys in alphabetical order
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), render(v))).collect())
            .unwrap_or_default();
        entries.sort();
        entries
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "(unset)".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
