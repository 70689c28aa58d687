//! Channel abstraction for notification dispatch and reply correlation.

pub mod email;
pub mod manager;
pub mod sms;
pub mod telegram;

pub use email::EmailChannel;
pub use manager::{ChannelManager, DispatchReport};
pub use sms::SmsChannel;
pub use telegram::TelegramChannel;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, ConfigError};

/// Lifecycle event carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    /// The agent is waiting for a human decision.
    AwaitingApproval,
    /// The agent session finished.
    SessionEnded,
    /// Synthetic cross-channel echo of a reply resolved on another channel.
    ResponseSync,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingApproval => write!(f, "awaiting approval"),
            Self::SessionEnded => write!(f, "session ended"),
            Self::ResponseSync => write!(f, "response sync"),
        }
    }
}

/// An outbound notification, input to [`Channel::send`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelNotification {
    pub session_id: String,
    pub event: NotificationEvent,
    pub title: String,
    pub message: String,
}

impl ChannelNotification {
    pub fn new(
        session_id: impl Into<String>,
        event: NotificationEvent,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// A correlated inbound reply, channel-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub session_id: String,
    pub response: String,
    /// Who replied (email address, chat user, phone number).
    pub from: String,
    pub timestamp: DateTime<Utc>,
    /// Name of the channel that produced the reply.
    pub channel: String,
}

/// Diagnostic snapshot returned by [`Channel::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub enabled: bool,
    pub connected: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Shared callback every polling loop delivers resolved replies into.
///
/// All channels hold the same instance, so the caller sees one unified
/// inbound stream tagged by `ChannelResponse::channel`.
pub type ResponseCallback = Arc<dyn Fn(ChannelResponse) + Send + Sync>;

/// Mutable diagnostic state every channel keeps behind its own lock.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub connected: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Diagnostics {
    pub fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    pub fn record_error(&mut self, error: impl ToString) {
        self.last_error = Some(error.to_string());
    }
}

/// A notification backend: owns provider credentials, outbound formatting and
/// send, inbound polling + correlation, lifecycle, and diagnostics.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// Check credentials/config shape without touching the network.
    fn validate_config(&self) -> Result<(), ConfigError>;

    /// Connect/authenticate. Fail-fast on bad credentials.
    async fn initialize(&self) -> Result<(), ChannelError>;

    /// Format and send a notification. Returns the opaque provider message id
    /// used for reply threading.
    async fn send(&self, notification: &ChannelNotification) -> Result<String, ChannelError>;

    /// Begin delivering inbound replies to `callback`. Idempotent: a no-op
    /// if the channel is already polling.
    async fn start_polling(&self, callback: ResponseCallback);

    async fn stop_polling(&self);

    /// Stop polling and tear down the underlying transport.
    async fn dispose(&self);

    async fn status(&self) -> ChannelStatus;
}
