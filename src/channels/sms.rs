//! SMS channel — Twilio-style REST outbound, webhook-driven inbound.
//!
//! SMS threads expose no reply-to metadata, so inbound correlation accepts an
//! explicit `[CC-<id>]` prefix ONLY. Guessing is unsafe with multiple
//! concurrent sessions; an unprefixed reply gets a guidance message back
//! instead of a silent drop.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::channels::{
    Channel, ChannelNotification, ChannelResponse, ChannelStatus, Diagnostics, ResponseCallback,
};
use crate::config::SmsConfig;
use crate::correlation::{extract_session_prefix, session_prefix};
use crate::error::{ChannelError, ConfigError};

/// SMS channel — outbound REST messages plus webhook-body inbound parsing.
///
/// The external route layer owns the HTTP endpoint and hands raw webhook
/// bodies to [`SmsChannel::handle_webhook`].
pub struct SmsChannel {
    config: SmsConfig,
    client: reqwest::Client,
    callback: Mutex<Option<ResponseCallback>>,
    diag: Mutex<Diagnostics>,
}

impl SmsChannel {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            callback: Mutex::new(None),
            diag: Mutex::new(Diagnostics::default()),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base, self.config.account_sid
        )
    }

    /// Send a raw SMS body to the operator. Returns the provider message sid.
    async fn send_sms(&self, body: &str) -> Result<String, ChannelError> {
        let send_err = |reason: String| ChannelError::SendFailed {
            name: "sms".into(),
            reason,
        };

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&[
                ("To", self.config.operator_number.as_str()),
                ("From", self.config.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await
            .map_err(|e| send_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(send_err(format!("provider returned {status}: {detail}")));
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| send_err(e.to_string()))?;
        let sid = data
            .get("sid")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        info!(to = %self.config.operator_number, "SMS sent");
        Ok(sid)
    }

    /// Process an inbound webhook body (form-encoded `From`/`Body` pairs).
    ///
    /// Called by the external route layer. An unprefixed reply triggers an
    /// outbound guidance message asking the operator to specify `[CC-ID]`.
    pub async fn handle_webhook(&self, raw_form: &str) -> Result<(), ChannelError> {
        let (from, body) = parse_webhook_body(raw_form);
        let Some(body) = body else {
            return Err(ChannelError::InvalidCallbackData(
                "webhook body missing Body field".into(),
            ));
        };
        let from = from.unwrap_or_default();

        // Basic origin verification against the configured operator number.
        if normalize_phone(&from) != normalize_phone(&self.config.operator_number) {
            warn!(%from, "Ignoring SMS from unknown number");
            return Ok(());
        }

        self.diag.lock().unwrap().touch();

        let Some((session_id, response)) = extract_session_prefix(&body) else {
            warn!("SMS reply has no session prefix, asking operator to specify");
            let guidance = "Could not determine the session for your reply. \
                            If multiple sessions are active, resend it as: [CC-<session-id>] <answer>";
            if let Err(e) = self.send_sms(guidance).await {
                warn!("Failed to send SMS guidance: {e}");
            }
            return Ok(());
        };

        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(ChannelResponse {
                session_id,
                response,
                from,
                timestamp: Utc::now(),
                channel: "sms".into(),
            });
        } else {
            warn!("SMS reply received before polling started, dropping");
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn name(&self) -> &str {
        "sms"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn validate_config(&self) -> Result<(), ConfigError> {
        self.config.validate()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.validate_config()
            .map_err(|e| ChannelError::StartupFailed {
                name: "sms".into(),
                reason: e.to_string(),
            })?;

        let url = format!(
            "{}/2010-04-01/Accounts/{}.json",
            self.config.api_base, self.config.account_sid
        );
        let resp = self
            .client
            .get(url)
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "sms".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ChannelError::StartupFailed {
                name: "sms".into(),
                reason: format!("account lookup returned {}", resp.status()),
            });
        }

        let mut diag = self.diag.lock().unwrap();
        diag.connected = true;
        diag.touch();
        Ok(())
    }

    async fn send(&self, notification: &ChannelNotification) -> Result<String, ChannelError> {
        let prefix = session_prefix(&notification.session_id);
        let body = format!("{prefix} {}\n{}", notification.title, notification.message);
        let sid = self.send_sms(&body).await?;
        self.diag.lock().unwrap().touch();
        Ok(sid)
    }

    async fn start_polling(&self, callback: ResponseCallback) {
        // Webhook-driven: "polling" just registers the shared callback.
        let mut slot = self.callback.lock().unwrap();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }

    async fn stop_polling(&self) {
        self.callback.lock().unwrap().take();
    }

    async fn dispose(&self) {
        self.stop_polling().await;
        self.diag.lock().unwrap().connected = false;
        info!("SMS channel disposed");
    }

    async fn status(&self) -> ChannelStatus {
        let diag = self.diag.lock().unwrap();
        ChannelStatus {
            name: "sms".into(),
            enabled: self.config.enabled,
            connected: diag.connected,
            last_activity: diag.last_activity,
            last_error: diag.last_error.clone(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Strip everything but digits; SMS providers format numbers inconsistently.
fn normalize_phone(number: &str) -> String {
    number.chars().filter(char::is_ascii_digit).collect()
}

/// Pull `From` and `Body` out of a form-encoded webhook payload.
fn parse_webhook_body(raw: &str) -> (Option<String>, Option<String>) {
    let mut from = None;
    let mut body = None;
    for pair in raw.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let decoded = urlencoding::decode(&value.replace('+', " "))
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        match key {
            "From" => from = Some(decoded),
            "Body" => body = Some(decoded),
            _ => {}
        }
    }
    (from, body)
}

// ── Tests ───────────────────────────────────────────────────────────
