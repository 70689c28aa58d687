//! Session table — tracks live agent sessions awaiting a human reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channels::NotificationEvent;
use crate::error::SessionError;

/// Sessions idle longer than this are expired by the sweep.
pub const SESSION_TTL: Duration = Duration::from_secs(1800);
/// How often the sweep task runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// The notification a session is currently waiting on.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub event: NotificationEvent,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
}

/// A reply captured for a session, waiting to be consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub session_id: String,
    pub response: String,
    pub from: String,
}

/// One tracked agent run.
#[derive(Debug)]
struct Session {
    created_at: Instant,
    last_activity: Instant,
    enabled: bool,
    pending_response: Option<PendingResponse>,
    /// Provider message id of the last outbound notification, for reply
    /// threading (email In-Reply-To).
    pending_message_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// One-shot response mailbox, keyed by session id.
    responses: HashMap<String, StoredResponse>,
}

/// Authoritative table of live agent sessions.
///
/// All maps live behind one mutex; no lock is ever held across an await.
pub struct SessionManager {
    inner: Mutex<Inner>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_timings(SESSION_TTL, SWEEP_INTERVAL)
    }

    /// Construct with custom TTL/sweep timings (tests).
    pub fn with_timings(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            sweep_interval,
        }
    }

    /// Upsert a session. `created_at` and `enabled` survive re-registration;
    /// `last_activity` and `pending_response` are always refreshed.
    pub fn register_session(&self, id: &str, event: NotificationEvent, prompt: &str) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let pending = PendingResponse {
            event,
            prompt: prompt.to_string(),
            timestamp: Utc::now(),
        };
        match inner.sessions.get_mut(id) {
            Some(session) => {
                session.last_activity = now;
                session.pending_response = Some(pending);
            }
            None => {
                inner.sessions.insert(
                    id.to_string(),
                    Session {
                        created_at: now,
                        last_activity: now,
                        enabled: true,
                        pending_response: Some(pending),
                        pending_message_id: None,
                    },
                );
                debug!(session = %id, "Registered session");
            }
        }
    }

    /// Enable a session, auto-creating it if absent. The one path that never
    /// errors on a missing session, so flipping a channel on is idempotent.
    pub fn enable_session(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.sessions.get_mut(id) {
            Some(session) => {
                session.enabled = true;
                session.last_activity = now;
            }
            None => {
                inner.sessions.insert(
                    id.to_string(),
                    Session {
                        created_at: now,
                        last_activity: now,
                        enabled: true,
                        pending_response: None,
                        pending_message_id: None,
                    },
                );
            }
        }
    }

    pub fn disable_session(&self, id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        session.enabled = false;
        session.last_activity = Instant::now();
        Ok(())
    }

    pub fn is_session_enabled(&self, id: &str) -> Result<bool, SessionError> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(id)
            .map(|s| s.enabled)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    /// Capture a reply for a session. Clears the session's pending
    /// notification and files the reply into the consumable mailbox.
    pub fn store_response(&self, id: &str, response: &str, from: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        session.pending_response = None;
        session.last_activity = Instant::now();
        inner.responses.insert(
            id.to_string(),
            StoredResponse {
                session_id: id.to_string(),
                response: response.to_string(),
                from: from.to_string(),
            },
        );
        Ok(())
    }

    /// Record the provider message id of the latest outbound notification.
    pub fn store_message_id(&self, id: &str, message_id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        session.pending_message_id = Some(message_id.to_string());
        session.last_activity = Instant::now();
        Ok(())
    }

    /// Take the stored reply for a session. Destructive: deletes both the
    /// response and the session. A second call returns `None`.
    pub fn consume_response(&self, id: &str) -> Option<StoredResponse> {
        let mut inner = self.inner.lock().unwrap();
        let response = inner.responses.remove(id)?;
        inner.sessions.remove(id);
        Some(response)
    }

    /// Resolve a session by the provider message id of its last outbound
    /// notification. Linear scan; used by the email In-Reply-To strategy.
    pub fn find_session_by_message_id(&self, message_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .iter()
            .find(|(_, s)| s.pending_message_id.as_deref() == Some(message_id))
            .map(|(id, _)| id.clone())
    }

    pub fn get_active_session_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Delete sessions idle longer than the TTL, along with any pending
    /// responses. Bounds memory regardless of correlation success.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.ttl;
        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.sessions.remove(id);
            inner.responses.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired idle sessions");
        }
        expired.len()
    }
}

/// Spawn the periodic TTL sweep task.
pub fn spawn_sweep_task(manager: Arc<SessionManager>) -> JoinHandle<()> {
    let interval = manager.sweep_interval;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately; skip it so the first sweep
        // happens one full interval after startup.
        tick.tick().await;
        loop {
            tick.tick().await;
            manager.sweep_expired();
        }
    })
}
