//! Errors for Flood Scout
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FloodScoutError {
    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Invalid video frame")]
    InvalidFrame(#[from] base64::DecodeError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid channel path: {0}")]
    InvalidPath(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Session expired")]
    SessionExpired,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("History record not found: {0}")]
    RecordNotFound(i64),
}
