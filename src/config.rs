//! Application configuration

use std::path::Path;
use std::time::Duration;

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::errors::FloodScoutError;
use crate::models::Location;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub channel: ChannelConfig,
    pub mqtt: MqttConfig,
    pub control: ControlConfig,
    pub history: HistoryConfig,
    pub auth: AuthConfig,
}

/// Which [`RemoteChannel`](crate::channel::RemoteChannel) realization to use
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Mqtt,
    Memory,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ChannelConfig {
    pub backend: Backend,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttTransport {
    #[default]
    Tcp,
    Wss,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub uri: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub transport: MqttTransport,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub keep_alive: Duration,
    /// How long a one-shot read waits for the first retained value
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub read_timeout: Duration,
    /// Quiet period that ends a one-shot read of a subtree
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub settle: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            uri: "localhost".to_string(),
            port: 1883,
            client_id: "flood-scout-console".to_string(),
            topic_prefix: "flood-scout".to_string(),
            transport: MqttTransport::Tcp,
            keep_alive: Duration::from_secs(5),
            read_timeout: Duration::from_millis(2000),
            settle: Duration::from_millis(200),
        }
    }
}

/// How video frames reach the dashboard
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    #[default]
    Poll,
    Push,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    /// Throttle percentage applied when a longitudinal intent is engaged
    pub default_speed: u8,
    pub video_source: VideoSource,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub video_poll_interval: Duration,
    pub fallback_latitude: f64,
    pub fallback_longitude: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let fallback = Location::FALLBACK;
        Self {
            default_speed: 30,
            video_source: VideoSource::Poll,
            video_poll_interval: Duration::from_secs(1),
            fallback_latitude: fallback.latitude,
            fallback_longitude: fallback.longitude,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { page_size: 10 }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub session_max_age: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin".to_string(),
            session_max_age: Duration::from_secs(60 * 60),
        }
    }
}

impl AppConfig {
    /// Load `config/default` (if present) overlaid with `FLOODSCOUT__*` variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder(Path::new("config/default"))
            .add_source(
                Environment::with_prefix("FLOODSCOUT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Load from a single configuration file, without environment overrides
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::builder(path).build()?.try_deserialize()
    }

    fn builder(path: &Path) -> ConfigBuilder<DefaultState> {
        let name = path.to_string_lossy();
        Config::builder().add_source(File::with_name(&name).required(false))
    }

    pub fn validate(&self) -> Result<(), FloodScoutError> {
        if self.channel.backend == Backend::Mqtt {
            self.mqtt.validate()?;
        }
        self.control.validate()?;
        self.history.validate()?;
        self.auth.validate()?;
        Ok(())
    }
}

fn invalid(message: &str) -> FloodScoutError {
    FloodScoutError::ConfigurationError {
        message: message.to_string(),
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), FloodScoutError> {
        if self.uri.trim().is_empty() {
            return Err(invalid("MQTT uri cannot be empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("MQTT client id cannot be empty"));
        }
        if self.topic_prefix.trim_matches('/').is_empty() {
            return Err(invalid("MQTT topic prefix cannot be empty"));
        }
        if self.keep_alive < Duration::from_secs(1) {
            return Err(invalid("MQTT keep alive must be at least one second"));
        }
        if self.read_timeout.is_zero() || self.settle.is_zero() {
            return Err(invalid("MQTT read timeouts must be greater than zero"));
        }
        Ok(())
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), FloodScoutError> {
        if !(1..=100).contains(&self.default_speed) {
            return Err(invalid("Default speed must be between 1 and 100"));
        }
        if self.video_poll_interval.is_zero() {
            return Err(invalid("Video poll interval must be greater than zero"));
        }
        Ok(())
    }

    pub fn fallback_location(&self) -> Location {
        Location {
            latitude: self.fallback_latitude,
            longitude: self.fallback_longitude,
        }
    }
}

impl HistoryConfig {
    pub fn validate(&self) -> Result<(), FloodScoutError> {
        if self.page_size == 0 {
            return Err(invalid("History page size must be greater than zero"));
        }
        Ok(())
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), FloodScoutError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(invalid("Operator credentials cannot be empty"));
        }
        if self.session_max_age.is_zero() {
            return Err(invalid("Session max age must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn test_load_config() {
        env::set_var("FLOODSCOUT__CHANNEL__BACKEND", "memory");
        env::set_var("FLOODSCOUT__MQTT__URI", "broker.local");
        env::set_var("FLOODSCOUT__MQTT__CLIENT_ID", "test_client");
        env::set_var("FLOODSCOUT__MQTT__READ_TIMEOUT", "500");
        env::set_var("FLOODSCOUT__CONTROL__VIDEO_POLL_INTERVAL", "2");
        env::set_var("FLOODSCOUT__HISTORY__PAGE_SIZE", "5");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.channel.backend, Backend::Memory);
        assert_eq!(config.mqtt.uri, "broker.local");
        assert_eq!(config.mqtt.client_id, "test_client");
        assert_eq!(config.mqtt.read_timeout, Duration::from_millis(500));
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.control.video_poll_interval, Duration::from_secs(2));
        assert_eq!(config.history.page_size, 5);
        assert_eq!(config.auth.username, "admin");
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scout.toml");
        std::fs::write(
            &path,
            r#"
            [mqtt]
            uri = "wss://broker.example/mqtt"
            port = 443
            transport = "wss"

            [control]
            default_speed = 35
            video_source = "push"
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.mqtt.uri, "wss://broker.example/mqtt");
        assert_eq!(config.mqtt.port, 443);
        assert_eq!(config.mqtt.transport, MqttTransport::Wss);
        assert_eq!(config.control.default_speed, 35);
        assert_eq!(config.control.video_source, VideoSource::Push);
        assert_eq!(config.control.fallback_location(), Location::FALLBACK);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_control_config_validate_invalid_speed() {
        let config = ControlConfig {
            default_speed: 0,
            ..ControlConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ControlConfig {
            default_speed: 101,
            ..ControlConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_control_config_validate_invalid_poll_interval() {
        let config = ControlConfig {
            video_poll_interval: Duration::from_secs(0),
            ..ControlConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_history_config_validate_invalid_page_size() {
        assert!(HistoryConfig { page_size: 0 }.validate().is_err());
    }

    #[test]
    fn test_mqtt_config_validate_invalid_prefix() {
        let config = MqttConfig {
            topic_prefix: "/".to_string(),
            ..MqttConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
