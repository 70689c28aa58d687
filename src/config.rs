//! Provider configuration, built from environment variables.
//!
//! Each channel config follows the same convention: `from_env()` returns
//! `None` when the channel's key variable is unset (channel not configured),
//! and `validate()` checks the remaining fields before any network use.

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Email channel configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Address notifications are sent from (and replies threaded against).
    pub from_address: String,
    /// The human operator's address — the only sender polled for replies.
    pub operator_address: String,
    pub poll_interval_secs: u64,
    pub enabled: bool,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (channel not configured).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        let operator_address = std::env::var("EMAIL_OPERATOR_ADDRESS").unwrap_or_default();

        let poll_interval_secs: u64 = std::env::var("EMAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let enabled = env_flag("EMAIL_ENABLED", true);

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            operator_address,
            poll_interval_secs,
            enabled,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::MissingEnvVar("EMAIL_USERNAME".into()));
        }
        if self.password.expose_secret().is_empty() {
            return Err(ConfigError::MissingEnvVar("EMAIL_PASSWORD".into()));
        }
        if self.operator_address.is_empty() {
            return Err(ConfigError::MissingEnvVar("EMAIL_OPERATOR_ADDRESS".into()));
        }
        if !self.from_address.contains('@') {
            return Err(ConfigError::InvalidValue {
                key: "EMAIL_FROM_ADDRESS".into(),
                message: format!("not an email address: {}", self.from_address),
            });
        }
        Ok(())
    }
}

/// Telegram channel configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// The single chat replies are accepted from.
    pub chat_id: i64,
    /// Server-side wait for the getUpdates long poll.
    pub poll_timeout_secs: u64,
    pub enabled: bool,
}

impl TelegramConfig {
    /// Build config from environment variables.
    /// Returns `None` if `TELEGRAM_BOT_TOKEN` is not set.
    pub fn from_env() -> Option<Self> {
        let bot_token = SecretString::from(std::env::var("TELEGRAM_BOT_TOKEN").ok()?);

        let chat_id: i64 = std::env::var("TELEGRAM_CHAT_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let poll_timeout_secs: u64 = std::env::var("TELEGRAM_POLL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(25);

        let enabled = env_flag("TELEGRAM_ENABLED", true);

        Some(Self {
            bot_token,
            chat_id,
            poll_timeout_secs,
            enabled,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_token.expose_secret().is_empty() {
            return Err(ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()));
        }
        if self.chat_id == 0 {
            return Err(ConfigError::MissingEnvVar("TELEGRAM_CHAT_ID".into()));
        }
        Ok(())
    }
}

/// SMS channel configuration (Twilio-style REST provider).
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    /// The human operator's phone number, for inbound origin verification.
    pub operator_number: String,
    /// Provider API base; overridable for tests.
    pub api_base: String,
    pub enabled: bool,
}

impl SmsConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMS_ACCOUNT_SID` is not set.
    pub fn from_env() -> Option<Self> {
        let account_sid = std::env::var("SMS_ACCOUNT_SID").ok()?;
        let auth_token = SecretString::from(std::env::var("SMS_AUTH_TOKEN").unwrap_or_default());
        let from_number = std::env::var("SMS_FROM_NUMBER").unwrap_or_default();
        let operator_number = std::env::var("SMS_OPERATOR_NUMBER").unwrap_or_default();
        let api_base = std::env::var("SMS_API_BASE")
            .unwrap_or_else(|_| "https://api.twilio.com".to_string());
        let enabled = env_flag("SMS_ENABLED", true);

        Some(Self {
            account_sid,
            auth_token,
            from_number,
            operator_number,
            api_base,
            enabled,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_token.expose_secret().is_empty() {
            return Err(ConfigError::MissingEnvVar("SMS_AUTH_TOKEN".into()));
        }
        if self.from_number.is_empty() {
            return Err(ConfigError::MissingEnvVar("SMS_FROM_NUMBER".into()));
        }
        if self.operator_number.is_empty() {
            return Err(ConfigError::MissingEnvVar("SMS_OPERATOR_NUMBER".into()));
        }
        Ok(())
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}
