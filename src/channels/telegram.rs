//! Telegram channel — long-polls the Bot API for replies and button presses.
//!
//! Outbound approval prompts carry an inline keyboard whose callback data is
//! `approve:<session>` / `deny:<session>`. Inbound text resolves a session by
//! reply-to threading, then `[CC-<id>]` prefix, then the most recently
//! notified session (the channel behaves as an implicit 1:1 conversation).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{
    Channel, ChannelNotification, ChannelResponse, ChannelStatus, Diagnostics, NotificationEvent,
    ResponseCallback,
};
use crate::config::TelegramConfig;
use crate::correlation::{BoundedMap, CORRELATION_TABLE_CAP, extract_session_prefix, session_prefix};
use crate::error::{ChannelError, ConfigError};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

static CALLBACK_DATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(approve|deny):(.+)$").expect("valid regex"));

/// State shared between the channel handle and its polling task.
struct TelegramInner {
    config: TelegramConfig,
    client: reqwest::Client,
    /// Sent message id -> session id, for reply-to threading.
    sent_messages: Mutex<BoundedMap<i64, String>>,
    /// Most recently notified session, the implicit 1:1 fallback.
    last_session: Mutex<Option<String>>,
    shutdown: AtomicBool,
    diag: Mutex<Diagnostics>,
}

/// Telegram channel — Bot API long-polling.
pub struct TelegramChannel {
    inner: Arc<TelegramInner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            inner: Arc::new(TelegramInner {
                config,
                client: reqwest::Client::new(),
                sent_messages: Mutex::new(BoundedMap::new(CORRELATION_TABLE_CAP)),
                last_session: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                diag: Mutex::new(Diagnostics::default()),
            }),
            poll_task: Mutex::new(None),
        }
    }
}

impl TelegramInner {
    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.config.bot_token.expose_secret()
        )
    }

    /// Send a text message, trying Markdown first with plain-text fallback.
    /// Long texts are split; the reply markup rides on the final chunk.
    /// Returns the provider message id of the final chunk.
    async fn send_message(
        &self,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<i64, ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let mut message_id = 0;
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let markup = if i == last { reply_markup.clone() } else { None };
            message_id = self.send_message_chunk(chunk, markup).await?;
        }
        Ok(message_id)
    }

    async fn send_message_chunk(
        &self,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<i64, ChannelError> {
        let mut markdown_body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(markup) = &reply_markup {
            markdown_body["reply_markup"] = markup.clone();
        }

        match self.post_send_message(&markdown_body).await? {
            Some(message_id) => return Ok(message_id),
            None => {
                warn!("Telegram sendMessage with Markdown failed; retrying without parse_mode");
            }
        }

        let mut plain_body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
        });
        if let Some(markup) = reply_markup {
            plain_body["reply_markup"] = markup;
        }

        self.post_send_message(&plain_body)
            .await?
            .ok_or_else(|| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "sendMessage rejected by Bot API".into(),
            })
    }

    /// POST a sendMessage payload. `Ok(None)` means the API rejected the
    /// payload (retryable without parse_mode); `Err` means transport failure.
    async fn post_send_message(
        &self,
        body: &serde_json::Value,
    ) -> Result<Option<i64>, ChannelError> {
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Ok(None);
        }
        let data: serde_json::Value = resp.json().await.map_err(|e| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: e.to_string(),
        })?;
        Ok(data
            .get("result")
            .and_then(|r| r.get("message_id"))
            .and_then(serde_json::Value::as_i64))
    }

    /// One long-poll iteration. Returns the next offset.
    async fn poll_updates(
        &self,
        offset: i64,
        callback: &ResponseCallback,
    ) -> Result<i64, ChannelError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": self.config.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });

        let poll_err = |reason: String| ChannelError::PollFailed {
            name: "telegram".into(),
            reason,
        };

        let resp = self
            .client
            .post(self.api_url("getUpdates"))
            .json(&body)
            .send()
            .await
            .map_err(|e| poll_err(e.to_string()))?;

        let data: serde_json::Value = resp.json().await.map_err(|e| poll_err(e.to_string()))?;
        if !data.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false) {
            return Err(poll_err(format!(
                "getUpdates rejected: {}",
                data.get("description")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown")
            )));
        }

        let mut next_offset = offset;
        if let Some(updates) = data.get("result").and_then(serde_json::Value::as_array) {
            for update in updates {
                // Acknowledge-by-offset: request strictly after this update.
                if let Some(update_id) = update.get("update_id").and_then(serde_json::Value::as_i64)
                {
                    next_offset = next_offset.max(update_id + 1);
                }

                if let Some(query) = update.get("callback_query") {
                    self.handle_callback_query(query, callback).await;
                } else if let Some(message) = update.get("message") {
                    self.handle_text_message(message, callback);
                }
            }
        }
        self.diag.lock().unwrap().touch();
        Ok(next_offset)
    }

    /// Inline button press. The resolved answer is authoritative even when
    /// the acknowledge/edit cleanup fails.
    async fn handle_callback_query(&self, query: &serde_json::Value, callback: &ResponseCallback) {
        let data = query
            .get("data")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let (session_id, response) = match parse_callback_data(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(%data, "Dropping callback query: {e}");
                return;
            }
        };

        // Dismiss the provider's pending indicator. Fails on stale
        // interaction windows; that is not fatal.
        if let Some(query_id) = query.get("id").and_then(serde_json::Value::as_str) {
            let ack = self
                .client
                .post(self.api_url("answerCallbackQuery"))
                .json(&serde_json::json!({ "callback_query_id": query_id }))
                .send()
                .await;
            if let Err(e) = ack {
                warn!("Failed to acknowledge callback query: {e}");
            }
        }

        // Best-effort: strip the buttons from the original message.
        if let Some(message) = query.get("message")
            && let (Some(chat_id), Some(message_id)) = (
                message
                    .get("chat")
                    .and_then(|c| c.get("id"))
                    .and_then(serde_json::Value::as_i64),
                message.get("message_id").and_then(serde_json::Value::as_i64),
            )
        {
            let edit = self
                .client
                .post(self.api_url("editMessageReplyMarkup"))
                .json(&serde_json::json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "reply_markup": { "inline_keyboard": [] },
                }))
                .send()
                .await;
            if let Err(e) = edit {
                warn!("Failed to remove inline keyboard: {e}");
            }
        }

        let from = query
            .get("from")
            .and_then(|f| f.get("username"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("telegram-user")
            .to_string();

        callback(ChannelResponse {
            session_id,
            response,
            from,
            timestamp: Utc::now(),
            channel: "telegram".into(),
        });
    }

    fn handle_text_message(&self, message: &serde_json::Value, callback: &ResponseCallback) {
        // Only the configured chat is processed.
        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(serde_json::Value::as_i64);
        if chat_id != Some(self.config.chat_id) {
            debug!(?chat_id, "Ignoring message from foreign chat");
            return;
        }

        let Some(text) = message.get("text").and_then(serde_json::Value::as_str) else {
            return;
        };

        let reply_to_id = message
            .get("reply_to_message")
            .and_then(|r| r.get("message_id"))
            .and_then(serde_json::Value::as_i64);

        let resolved = {
            let sent = self.sent_messages.lock().unwrap();
            let last = self.last_session.lock().unwrap();
            resolve_text_session(reply_to_id, text, &sent, last.as_deref())
        };
        let Some((session_id, response)) = resolved else {
            warn!("Could not correlate Telegram reply, dropping");
            return;
        };

        let from = message
            .get("from")
            .and_then(|f| f.get("username"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("telegram-user")
            .to_string();

        callback(ChannelResponse {
            session_id,
            response,
            from,
            timestamp: Utc::now(),
            channel: "telegram".into(),
        });
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn enabled(&self) -> bool {
        self.inner.config.enabled
    }

    fn validate_config(&self) -> Result<(), ConfigError> {
        self.inner.config.validate()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.validate_config()
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let resp = self
            .inner
            .client
            .get(self.inner.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            });
        }

        let mut diag = self.inner.diag.lock().unwrap();
        diag.connected = true;
        diag.touch();
        Ok(())
    }

    async fn send(&self, notification: &ChannelNotification) -> Result<String, ChannelError> {
        let prefix = session_prefix(&notification.session_id);
        let text = match notification.event {
            NotificationEvent::ResponseSync => format!(
                "💬 {prefix} {}\n\n{}",
                notification.title, notification.message
            ),
            _ => format!("{prefix} {}\n\n{}", notification.title, notification.message),
        };

        let reply_markup = (notification.event == NotificationEvent::AwaitingApproval).then(|| {
            serde_json::json!({
                "inline_keyboard": [[
                    {
                        "text": "✅ Approve",
                        "callback_data": format!("approve:{}", notification.session_id),
                    },
                    {
                        "text": "❌ Deny",
                        "callback_data": format!("deny:{}", notification.session_id),
                    },
                ]],
            })
        });

        let message_id = self.inner.send_message(&text, reply_markup).await?;

        self.inner
            .sent_messages
            .lock()
            .unwrap()
            .insert(message_id, notification.session_id.clone());
        *self.inner.last_session.lock().unwrap() = Some(notification.session_id.clone());
        self.inner.diag.lock().unwrap().touch();

        Ok(message_id.to_string())
    }

    async fn start_polling(&self, callback: ResponseCallback) {
        let mut task = self.poll_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            info!(chat_id = inner.config.chat_id, "Telegram channel long-polling");
            let mut offset: i64 = 0;
            loop {
                if inner.shutdown.load(Ordering::Relaxed) {
                    info!("Telegram poll loop shutting down");
                    return;
                }
                match inner.poll_updates(offset, &callback).await {
                    Ok(next) => offset = next,
                    Err(e) => {
                        // Fail-fast, same policy as the email channel.
                        error!("Telegram poll failed, stopping channel polling: {e}");
                        let mut diag = inner.diag.lock().unwrap();
                        diag.connected = false;
                        diag.record_error(&e);
                        return;
                    }
                }
            }
        }));
    }

    async fn stop_polling(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn dispose(&self) {
        self.stop_polling().await;
        self.inner.diag.lock().unwrap().connected = false;
        info!("Telegram channel disposed");
    }

    async fn status(&self) -> ChannelStatus {
        let diag = self.inner.diag.lock().unwrap();
        ChannelStatus {
            name: "telegram".into(),
            enabled: self.inner.config.enabled,
            connected: diag.connected,
            last_activity: diag.last_activity,
            last_error: diag.last_error.clone(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse inline-button callback data (`approve:<session>` / `deny:<session>`)
/// into a session id and the canonical yes/no answer. Anything else is a
/// fatal parse error for that event.
fn parse_callback_data(data: &str) -> Result<(String, String), ChannelError> {
    let caps = CALLBACK_DATA_RE
        .captures(data)
        .ok_or_else(|| ChannelError::InvalidCallbackData(data.to_string()))?;
    let response = match &caps[1] {
        "approve" => "yes",
        _ => "no",
    };
    Ok((caps[2].to_string(), response.to_string()))
}

/// Resolve the session a plain text message belongs to.
///
/// Reply-to threading wins, then an explicit `[CC-<id>]` prefix (stripped
/// from the response body), then the most recently notified session.
fn resolve_text_session(
    reply_to_id: Option<i64>,
    text: &str,
    sent_messages: &BoundedMap<i64, String>,
    last_session: Option<&str>,
) -> Option<(String, String)> {
    if let Some(message_id) = reply_to_id
        && let Some(session_id) = sent_messages.get(&message_id)
    {
        return Some((session_id.clone(), text.to_string()));
    }
    if let Some((session_id, stripped)) = extract_session_prefix(text) {
        return Some((session_id, stripped));
    }
    last_session.map(|session_id| (session_id.to_string(), text.to_string()))
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let chunk = &remaining[..max_len];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(max_len);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { max_len } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
