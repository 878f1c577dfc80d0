//! Configuration file support
//!
//! Loads configuration from ~/.config/telerelay/config.toml, then lets the environment
//! override the secrets.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bus::mqtt::MqttConfig;
use crate::bus::topic;
use crate::chat::TelegramConfig;
use crate::mode::ModeSettings;

pub const ENV_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_MQTT_PASSWORD: &str = "TELERELAY_MQTT_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub modes: ModeSettings,
}

impl RelayConfig {
    /// Load from `path`, or from the default location when `None`
    ///
    /// A missing file at the default location yields the defaults; an explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from_path(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Get the default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("telerelay").join("config.toml"))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(token) = lookup(ENV_BOT_TOKEN) {
            self.telegram.bot_token = token;
        }
        if let Some(password) = lookup(ENV_MQTT_PASSWORD) {
            self.mqtt.password = Some(password);
        }
    }

    /// Check everything `run` needs before any connection is attempted
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!(
                "Telegram bot token is not set (config telegram.bot_token or {})",
                ENV_BOT_TOKEN
            );
        }
        if self.mqtt.host.trim().is_empty() {
            bail!("MQTT host is empty");
        }
        if self.mqtt.port == 0 {
            bail!("MQTT port must be non-zero");
        }
        if self.modes.publish_repeats == 0 {
            bail!("modes.publish_repeats must be at least 1");
        }
        if !topic::is_valid_topic(&self.modes.mode_topic) {
            bail!("Invalid mode topic '{}'", self.modes.mode_topic);
        }
        if !topic::is_valid_filter(&self.modes.data_topic) {
            bail!("Invalid data topic '{}'", self.modes.data_topic);
        }
        if let Some(ca) = &self.mqtt.ca_cert
            && !Path::new(ca).exists()
        {
            bail!("MQTT CA certificate not found: {}", ca);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.modes.mode_topic, "mode/topic");
        assert_eq!(config.modes.data_topic, "vadlap/topic");
        assert_eq!(config.modes.publish_repeats, 2);
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.client_id, "tg_mqtt_client");
        assert_eq!(config.telegram.polling_timeout, 60);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[telegram]
bot_token = "123:abc"

[mqtt]
host = "broker.example.com"
username = "device"

[modes]
data_topic = "sensors/+/temp"
"#,
        );

        let config = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.telegram.bot_token, "123:abc");
        assert_eq!(config.mqtt.host, "broker.example.com");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("device"));
        assert_eq!(config.modes.data_topic, "sensors/+/temp");
        assert_eq!(config.modes.mode_topic, "mode/topic");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_parse_error_reported() {
        let file = write_config("[mqtt]\nport = \"not a number\"\n");
        let err = RelayConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BOT_TOKEN, "999:env"),
            (ENV_MQTT_PASSWORD, "secret"),
        ]);
        let mut config = RelayConfig::default();
        config.telegram.bot_token = "123:file".to_string();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.telegram.bot_token, "999:env");
        assert_eq!(config.mqtt.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_blank_override_ignored() {
        let mut config = RelayConfig::default();
        config.telegram.bot_token = "123:file".to_string();

        config.apply_overrides(|_| Some("  ".to_string()));
        assert_eq!(config.telegram.bot_token, "123:file");
        assert!(config.mqtt.password.is_none());
    }

    #[test]
    fn test_validate() {
        let mut config = RelayConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(ENV_BOT_TOKEN));

        config.telegram.bot_token = "123:abc".to_string();
        assert!(config.validate().is_ok());

        config.modes.mode_topic = "mode/#".to_string();
        assert!(config.validate().is_err());

        config.modes.mode_topic = "mode/topic".to_string();
        config.modes.publish_repeats = 0;
        assert!(config.validate().is_err());

        config.modes.publish_repeats = 2;
        config.mqtt.ca_cert = Some("/definitely/not/here.pem".to_string());
        assert!(config.validate().is_err());
    }
}
