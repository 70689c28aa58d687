//! Error types for agent-relay.

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
///
/// Raised by `validate_config` and the config constructors, before any
/// network use.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send notification on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Polling failed on channel {name}: {reason}")]
    PollFailed { name: String, reason: String },

    #[error("Invalid callback data: {0}")]
    InvalidCallbackData(String),

    #[error("Channel {0} is already registered")]
    AlreadyRegistered(String),

    #[error("No enabled channels to dispatch to")]
    NoEnabledChannels,
}

/// Session table errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session does not exist: {id}")]
    NotFound { id: String },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
