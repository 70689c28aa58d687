//! Email channel — SMTP via lettre for outbound, IMAP polling for replies.
//!
//! Outbound notifications carry a generated Message-ID and a `[CC-<id>]`
//! subject prefix. Inbound correlation tries the In-Reply-To header first
//! (authoritative, survives mangled subjects), then falls back to the subject
//! prefix. Processed messages are deleted from the mailbox — that deletion is
//! the idempotency boundary.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{HeaderValue, MessageParser};
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{
    Channel, ChannelNotification, ChannelResponse, ChannelStatus, Diagnostics, NotificationEvent,
    ResponseCallback,
};
use crate::config::EmailConfig;
use crate::correlation::{BoundedSet, CORRELATION_TABLE_CAP, extract_session_prefix, session_prefix};
use crate::error::{ChannelError, ConfigError};
use crate::session::SessionManager;

/// State shared between the channel handle and its polling task.
struct EmailInner {
    config: EmailConfig,
    sessions: Arc<SessionManager>,
    /// Message ids already handed to the callback, deduped across poll cycles.
    processed: Mutex<BoundedSet<String>>,
    /// Scoped inbox lock: overlapping operations on the same mailbox cannot
    /// interleave, even across reconnects.
    mailbox: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
    diag: Mutex<Diagnostics>,
}

/// Email channel — IMAP polling (inbound) + SMTP (outbound).
pub struct EmailChannel {
    inner: Arc<EmailInner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            inner: Arc::new(EmailInner {
                config,
                sessions,
                processed: Mutex::new(BoundedSet::new(CORRELATION_TABLE_CAP)),
                mailbox: tokio::sync::Mutex::new(()),
                shutdown: AtomicBool::new(false),
                diag: Mutex::new(Diagnostics::default()),
            }),
            poll_task: Mutex::new(None),
        }
    }

    /// Send an email via SMTP. Returns the generated Message-ID.
    fn send_email(
        config: &EmailConfig,
        subject: &str,
        body: &str,
    ) -> Result<String, ChannelError> {
        let send_err = |reason: String| ChannelError::SendFailed {
            name: "email".into(),
            reason,
        };

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| send_err(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        let domain = config
            .from_address
            .rsplit('@')
            .next()
            .unwrap_or("relay.local");
        let message_id = format!("<{}@{}>", Uuid::new_v4().simple(), domain);

        let email = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e| send_err(format!("Invalid from address: {e}")))?,
            )
            .to(config
                .operator_address
                .parse()
                .map_err(|e| send_err(format!("Invalid operator address: {e}")))?)
            .message_id(Some(message_id.clone()))
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| send_err(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| send_err(format!("SMTP send failed: {e}")))?;

        info!(to = %config.operator_address, %message_id, "Email sent");
        Ok(message_id)
    }

    #[cfg(test)]
    fn resolve_session_id(&self, in_reply_to: Option<&str>, subject: &str) -> Option<String> {
        self.inner.resolve_session_id(in_reply_to, subject)
    }
}

impl EmailInner {
    /// Run one poll cycle under the mailbox lock: fetch, correlate, emit,
    /// then delete the processed messages.
    async fn poll_cycle(&self, callback: &ResponseCallback) -> Result<(), ChannelError> {
        let _inbox = self.mailbox.lock().await;

        let cfg = self.config.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_replies_imap(&cfg))
            .await
            .map_err(|e| ChannelError::PollFailed {
                name: "email".into(),
                reason: format!("poll task panicked: {e}"),
            })?
            .map_err(|e| ChannelError::PollFailed {
                name: "email".into(),
                reason: e.to_string(),
            })?;

        if fetched.is_empty() {
            return Ok(());
        }
        debug!(count = fetched.len(), "Fetched reply candidates");
        self.diag.lock().unwrap().touch();

        let mut uids = Vec::with_capacity(fetched.len());
        for reply in fetched {
            uids.push(reply.uid.clone());

            // Dedup across poll cycles; deletion below is the hard boundary.
            if !self.processed.lock().unwrap().insert(reply.message_id.clone()) {
                continue;
            }

            let Some(session_id) =
                self.resolve_session_id(reply.in_reply_to.as_deref(), &reply.subject)
            else {
                warn!(subject = %reply.subject, "Could not correlate email reply, dropping");
                continue;
            };

            let text = extract_reply_text(&reply.body);
            callback(ChannelResponse {
                session_id,
                response: text,
                from: reply.from,
                timestamp: Utc::now(),
                channel: "email".into(),
            });
        }

        // Delete everything we looked at so it is never re-delivered, even
        // across a restart.
        let cfg = self.config.clone();
        match tokio::task::spawn_blocking(move || delete_messages_imap(&cfg, &uids)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to delete processed emails: {e}"),
            Err(e) => warn!("Email delete task panicked: {e}"),
        }

        Ok(())
    }

    /// Resolve the session a reply belongs to.
    ///
    /// In-Reply-To threading wins over the subject prefix: mail clients
    /// mangle subjects, the header survives.
    fn resolve_session_id(&self, in_reply_to: Option<&str>, subject: &str) -> Option<String> {
        if let Some(parent_id) = in_reply_to
            && let Some(session_id) = self.sessions.find_session_by_message_id(parent_id)
        {
            return Some(session_id);
        }
        extract_session_prefix(subject).map(|(session_id, _)| session_id)
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &str {
        "email"
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
                name: "email".into(),
                reason: e.to_string(),
            })?;

        let host = self.inner.config.imap_host.clone();
        let port = self.inner.config.imap_port;
        let ok = tokio::task::spawn_blocking(move || {
            TcpStream::connect((host.as_str(), port)).is_ok()
        })
        .await
        .unwrap_or(false);

        if !ok {
            return Err(ChannelError::StartupFailed {
                name: "email".into(),
                reason: format!(
                    "cannot reach {}:{}",
                    self.inner.config.imap_host, self.inner.config.imap_port
                ),
            });
        }

        let mut diag = self.inner.diag.lock().unwrap();
        diag.connected = true;
        diag.touch();
        Ok(())
    }

    async fn send(&self, notification: &ChannelNotification) -> Result<String, ChannelError> {
        let prefix = session_prefix(&notification.session_id);
        let subject = match notification.event {
            NotificationEvent::ResponseSync => format!("Re: {prefix} {}", notification.title),
            _ => format!("{prefix} {}", notification.title),
        };
        let body = match notification.event {
            NotificationEvent::AwaitingApproval => format!(
                "{}\n\nReply to this email with your answer.",
                notification.message
            ),
            _ => notification.message.clone(),
        };

        let cfg = self.inner.config.clone();
        let message_id =
            tokio::task::spawn_blocking(move || EmailChannel::send_email(&cfg, &subject, &body))
                .await
                .map_err(|e| ChannelError::SendFailed {
                    name: "email".into(),
                    reason: format!("send task panicked: {e}"),
                })??;

        self.inner.diag.lock().unwrap().touch();
        Ok(message_id)
    }

    async fn start_polling(&self, callback: ResponseCallback) {
        let mut task = self.poll_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let interval_secs = inner.config.poll_interval_secs;

        *task = Some(tokio::spawn(async move {
            info!(
                interval_secs,
                host = %inner.config.imap_host,
                "Email channel polling"
            );
            let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));
            // Skip, don't queue: a cycle still in flight swallows missed ticks.
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                if inner.shutdown.load(Ordering::Relaxed) {
                    info!("Email poll loop shutting down");
                    return;
                }
                if let Err(e) = inner.poll_cycle(&callback).await {
                    // Fail-fast: record the error and stop this channel's
                    // polling; other channels keep working.
                    error!("Email poll failed, stopping channel polling: {e}");
                    let mut diag = inner.diag.lock().unwrap();
                    diag.connected = false;
                    diag.record_error(&e);
                    return;
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
        info!("Email channel disposed");
    }

    async fn status(&self) -> ChannelStatus {
        let diag = self.inner.diag.lock().unwrap();
        ChannelStatus {
            name: "email".into(),
            enabled: self.inner.config.enabled,
            connected: diag.connected,
            last_activity: diag.last_activity,
            last_error: diag.last_error.clone(),
        }
    }
}

// ── Reply text extraction ───────────────────────────────────────────

/// Cut an email body down to the human's actual reply: everything up to the
/// first quoted-original marker.
pub fn extract_reply_text(body: &str) -> String {
    let mut kept = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            break;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if is_separator_line(trimmed) {
            break;
        }
        kept.push(line);
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    kept.join("\n").trim().to_string()
}

/// A `---` or `___` divider of length >= 3 marks the start of the quoted
/// original in many clients.
fn is_separator_line(line: &str) -> bool {
    line.len() >= 3
        && (line.chars().all(|c| c == '-') || line.chars().all(|c| c == '_'))
}

/// Decode quoted-printable escapes: soft line breaks (`=\n`) removed, `=XX`
/// hex sequences decoded to the corresponding byte.
pub fn decode_quoted_printable(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            match (bytes.get(i + 1), bytes.get(i + 2)) {
                (Some(b'\n'), _) => {
                    i += 2;
                    continue;
                }
                (Some(b'\r'), Some(b'\n')) => {
                    i += 3;
                    continue;
                }
                (Some(&h), Some(&l)) => {
                    let hex = |b: u8| (b as char).to_digit(16);
                    if let (Some(hv), Some(lv)) = (hex(h), hex(l)) {
                        out.push((hv * 16 + lv) as u8);
                        i += 3;
                        continue;
                    }
                }
                _ => {}
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Manual plain-text extraction for messages mail-parser cannot handle:
/// strip headers and multipart boundaries, keep the text/plain part (HTML
/// alternatives are discarded entirely), decode quoted-printable.
pub fn extract_plain_text_fallback(raw: &str) -> String {
    let (headers, body) = split_headers(raw);

    let Some(boundary) = find_boundary(headers) else {
        return finish_part(headers, body);
    };

    let marker = format!("--{boundary}");
    for part in body.split(marker.as_str()).skip(1) {
        let part = part.trim_start_matches(['\r', '\n']);
        if part.starts_with("--") {
            break;
        }
        let (part_headers, part_body) = split_headers(part);
        let content_type = header_value(part_headers, "content-type")
            .unwrap_or_default()
            .to_lowercase();
        if content_type.contains("text/html") {
            continue;
        }
        if content_type.is_empty() || content_type.contains("text/plain") {
            return finish_part(part_headers, part_body);
        }
    }
    String::new()
}

fn finish_part(headers: &str, body: &str) -> String {
    let encoding = header_value(headers, "content-transfer-encoding").unwrap_or_default();
    let body = body.trim();
    if encoding.eq_ignore_ascii_case("quoted-printable") {
        decode_quoted_printable(body).trim().to_string()
    } else {
        body.to_string()
    }
}

/// Split an RFC 822 blob at the first blank line.
fn split_headers(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, "")
    }
}

fn header_value(headers: &str, name: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

fn find_boundary(headers: &str) -> Option<String> {
    let content_type = header_value(headers, "content-type")?;
    let boundary = content_type.split("boundary=").nth(1)?;
    Some(
        boundary
            .split(';')
            .next()?
            .trim()
            .trim_matches('"')
            .to_string(),
    )
}

// ── IMAP client ─────────────────────────────────────────────────────

/// A reply fetched from the mailbox.
#[derive(Debug)]
struct FetchedReply {
    uid: String,
    message_id: String,
    from: String,
    subject: String,
    in_reply_to: Option<String>,
    body: String,
}

type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal IMAP session over rustls (blocking — run in spawn_blocking).
struct ImapSession {
    stream: TlsStream,
    tag_counter: u32,
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls_pki_types::ServerName<'_> =
            rustls_pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;
        let stream = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self {
            stream,
            tag_counter: 0,
        };
        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !login.last().is_some_and(|l| l.contains("OK")) {
            return Err("IMAP login failed".into());
        }
        session.command("SELECT \"INBOX\"")?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.stream, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect response lines until the tag echoes.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.stream, full.as_bytes())?;
        IoWrite::flush(&mut self.stream)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Fetch unseen replies from the operator address.
fn fetch_replies_imap(config: &EmailConfig) -> Result<Vec<FetchedReply>, ImapError> {
    let mut session = ImapSession::connect(config)?;

    let search = session.command(&format!(
        "SEARCH UNSEEN FROM \"{}\"",
        config.operator_address
    ))?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(str::to_string));
        }
    }

    let mut results = Vec::new();
    for uid in &uids {
        let fetch = session.command(&format!("FETCH {uid} RFC822"))?;
        let raw: String = fetch
            .iter()
            .skip(1)
            .take(fetch.len().saturating_sub(2))
            .cloned()
            .collect();

        results.push(parse_fetched(uid, &raw));
    }

    session.logout();
    Ok(results)
}

/// Parse a fetched RFC822 blob into a reply candidate.
fn parse_fetched(uid: &str, raw: &str) -> FetchedReply {
    if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
        let from = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());
        let subject = parsed.subject().unwrap_or("(no subject)").to_string();
        let message_id = parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
        let in_reply_to = match parsed.in_reply_to() {
            HeaderValue::Text(t) => Some(t.to_string()),
            HeaderValue::TextList(list) => list.first().map(|t| t.to_string()),
            _ => None,
        };
        // Plain-text part only; HTML alternatives are discarded entirely.
        let body = parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_else(|| extract_plain_text_fallback(raw));

        FetchedReply {
            uid: uid.to_string(),
            message_id,
            from,
            subject,
            in_reply_to,
            body,
        }
    } else {
        FetchedReply {
            uid: uid.to_string(),
            message_id: format!("gen-{}", Uuid::new_v4()),
            from: "unknown".into(),
            subject: String::new(),
            in_reply_to: None,
            body: extract_plain_text_fallback(raw),
        }
    }
}

/// Flag the given messages deleted and expunge them.
fn delete_messages_imap(config: &EmailConfig, uids: &[String]) -> Result<(), ImapError> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut session = ImapSession::connect(config)?;
    for uid in uids {
        session.command(&format!("STORE {uid} +FLAGS (\\Deleted)"))?;
    }
    session.command("EXPUNGE")?;
    session.logout();
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> EmailConfig {
        EmailConfig {
            imap_host: "imap.test.com".into(),
            imap_port: 993,
            smtp_host: "smtp.test.com".into(),
            smtp_port: 587,
            username: "relay".into(),
            password: SecretString::from("secret".to_string()),
            from_address: "relay@test.com".into(),
            operator_address: "operator@test.com".into(),
            poll_interval_secs: 30,
            enabled: true,
        }
    }

    // ── Reply extraction tests ──────────────────────────────────────

    #[test]
    fn extract_truncates_at_quoted_lines() {
        let body = "My reply\n> Original message\n> more";
        assert_eq!(extract_reply_text(body), "My reply");
    }

    #[test]
    fn extract_truncates_at_on_wrote() {
        let body = "Sounds good!\n\nOn Mon, Jan 5, 2026 at 10:00 AM Relay <relay@test.com> wrote:\n> prompt";
        assert_eq!(extract_reply_text(body), "Sounds good!");
    }

    #[test]
    fn extract_truncates_at_dash_separator() {
        let body = "just the reply\n---\noriginal";
        assert_eq!(extract_reply_text(body), "just the reply");
    }

    #[test]
    fn extract_truncates_at_underscore_separator() {
        let body = "yes\n______\nquoted original below";
        assert_eq!(extract_reply_text(body), "yes");
    }

    #[test]
    fn extract_keeps_short_dashes() {
        // Two dashes is not a separator.
        let body = "a -- b\nsecond line";
        assert_eq!(extract_reply_text(body), "a -- b\nsecond line");
    }

    #[test]
    fn extract_multiline_reply() {
        let body = "line one\nline two\n\n> quoted";
        assert_eq!(extract_reply_text(body), "line one\nline two");
    }

    #[test]
    fn extract_empty_body() {
        assert_eq!(extract_reply_text(""), "");
    }

    // ── Quoted-printable tests ──────────────────────────────────────

    #[test]
    fn qp_decodes_hex_sequences() {
        assert_eq!(decode_quoted_printable("caf=C3=A9"), "café");
    }

    #[test]
    fn qp_removes_soft_line_breaks() {
        assert_eq!(decode_quoted_printable("long =\nline"), "long line");
        assert_eq!(decode_quoted_printable("long =\r\nline"), "long line");
    }

    #[test]
    fn qp_passes_plain_text_through() {
        assert_eq!(decode_quoted_printable("no escapes here"), "no escapes here");
    }

    #[test]
    fn qp_leaves_invalid_escapes_alone() {
        assert_eq!(decode_quoted_printable("a =ZZ b"), "a =ZZ b");
    }

    // ── Fallback MIME extraction tests ──────────────────────────────

    #[test]
    fn fallback_keeps_plain_part_discards_html() {
        let raw = "From: operator@test.com\r\n\
                   Content-Type: multipart/alternative; boundary=\"xyz\"\r\n\
                   \r\n\
                   --xyz\r\n\
                   Content-Type: text/plain\r\n\
                   \r\n\
                   the actual reply\r\n\
                   --xyz\r\n\
                   Content-Type: text/html\r\n\
                   \r\n\
                   <p>the actual reply</p>\r\n\
                   --xyz--\r\n";
        assert_eq!(extract_plain_text_fallback(raw), "the actual reply");
    }

    #[test]
    fn fallback_decodes_quoted_printable_part() {
        let raw = "Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
                   \r\n\
                   --b1\r\n\
                   Content-Type: text/plain\r\n\
                   Content-Transfer-Encoding: quoted-printable\r\n\
                   \r\n\
                   ok =E2=9C=93\r\n\
                   --b1--\r\n";
        assert_eq!(extract_plain_text_fallback(raw), "ok ✓");
    }

    #[test]
    fn fallback_single_part_message() {
        let raw = "Subject: hi\r\n\r\nplain body";
        assert_eq!(extract_plain_text_fallback(raw), "plain body");
    }

    // ── Correlation tests ───────────────────────────────────────────

    #[test]
    fn resolve_prefers_in_reply_to() {
        let sessions = Arc::new(SessionManager::new());
        sessions.register_session("s1", NotificationEvent::AwaitingApproval, "go?");
        sessions.store_message_id("s1", "<mid-1@test.com>").unwrap();
        let channel = EmailChannel::new(config(), Arc::clone(&sessions));

        // Header wins even when the subject names a different session.
        let resolved =
            channel.resolve_session_id(Some("<mid-1@test.com>"), "Re: [CC-ffff] prompt");
        assert_eq!(resolved, Some("s1".to_string()));
    }

    #[test]
    fn resolve_falls_back_to_subject_prefix() {
        let sessions = Arc::new(SessionManager::new());
        let channel = EmailChannel::new(config(), sessions);

        let resolved = channel.resolve_session_id(Some("<unknown@x>"), "Re: [CC-abc123] prompt");
        assert_eq!(resolved, Some("abc123".to_string()));
    }

    #[test]
    fn resolve_none_when_no_signal() {
        let sessions = Arc::new(SessionManager::new());
        let channel = EmailChannel::new(config(), sessions);
        assert!(channel.resolve_session_id(None, "Re: whatever").is_none());
    }

    #[test]
    fn parse_fetched_extracts_threading_headers() {
        let raw = "From: Operator <operator@test.com>\r\n\
                   Subject: Re: [CC-abc123] Approval needed\r\n\
                   Message-ID: <reply-1@mail.test.com>\r\n\
                   In-Reply-To: <sent-1@test.com>\r\n\
                   Content-Type: text/plain\r\n\
                   \r\n\
                   yes please\r\n";
        let reply = parse_fetched("7", raw);
        assert_eq!(reply.uid, "7");
        assert_eq!(reply.from, "operator@test.com");
        assert_eq!(reply.message_id, "<reply-1@mail.test.com>");
        assert_eq!(reply.in_reply_to.as_deref(), Some("<sent-1@test.com>"));
        assert_eq!(extract_reply_text(&reply.body), "yes please");
    }

    // ── Channel surface tests ───────────────────────────────────────

    #[test]
    fn email_channel_name_and_enabled() {
        let channel = EmailChannel::new(config(), Arc::new(SessionManager::new()));
        assert_eq!(channel.name(), "email");
        assert!(channel.enabled());
    }

    #[tokio::test]
    async fn status_reports_disconnected_before_init() {
        let channel = EmailChannel::new(config(), Arc::new(SessionManager::new()));
        let status = channel.status().await;
        assert!(!status.connected);
        assert!(status.last_error.is_none());
    }
}
