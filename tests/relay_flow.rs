//! End-to-end relay flow: dispatch fan-out, inbound correlation, response
//! capture and cross-channel sync, using in-memory channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use agent_relay::channels::{
    Channel, ChannelManager, ChannelNotification, ChannelResponse, ChannelStatus, NotificationEvent,
    ResponseCallback,
};
use agent_relay::error::{ChannelError, ConfigError};
use agent_relay::session::SessionManager;

/// In-memory channel: records outbound sends, exposes the registered
/// callback so tests can inject inbound replies.
struct FakeChannel {
    name: &'static str,
    enabled: bool,
    fail_send: bool,
    sent: Mutex<Vec<ChannelNotification>>,
    callback: Mutex<Option<ResponseCallback>>,
    send_counter: AtomicUsize,
}

impl FakeChannel {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            enabled: true,
            fail_send: false,
            sent: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            send_counter: AtomicUsize::new(0),
        })
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            enabled: true,
            fail_send: true,
            sent: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            send_counter: AtomicUsize::new(0),
        })
    }

    /// Simulate an inbound reply arriving on this channel.
    fn inject_reply(&self, session_id: &str, response: &str) {
        let callback = self
            .callback
            .lock()
            .unwrap()
            .clone()
            .expect("polling not started");
        callback(ChannelResponse {
            session_id: session_id.to_string(),
            response: response.to_string(),
            from: "operator".into(),
            timestamp: Utc::now(),
            channel: self.name.to_string(),
        });
    }

    fn sent_events(&self) -> Vec<NotificationEvent> {
        self.sent.lock().unwrap().iter().map(|n| n.event).collect()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn name(&self) -> &str {
        self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn validate_config(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send(&self, notification: &ChannelNotification) -> Result<String, ChannelError> {
        if self.fail_send {
            return Err(ChannelError::SendFailed {
                name: self.name.to_string(),
                reason: "unreachable provider".into(),
            });
        }
        let seq = self.send_counter.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(notification.clone());
        Ok(format!("{}-{seq}", self.name))
    }

    async fn start_polling(&self, callback: ResponseCallback) {
        let mut slot = self.callback.lock().unwrap();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }

    async fn stop_polling(&self) {
        self.callback.lock().unwrap().take();
    }

    async fn dispose(&self) {}

    async fn status(&self) -> ChannelStatus {
        ChannelStatus {
            name: self.name.to_string(),
            enabled: self.enabled,
            connected: true,
            last_activity: None,
            last_error: None,
        }
    }
}

fn shared_queue() -> (
    ResponseCallback,
    tokio::sync::mpsc::UnboundedReceiver<ChannelResponse>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let callback: ResponseCallback = Arc::new(move |response| {
        let _ = tx.send(response);
    });
    (callback, rx)
}

#[tokio::test]
async fn notification_roundtrip_with_cross_channel_sync() {
    let email = FakeChannel::new("email");
    let telegram = FakeChannel::new("telegram");
    let sessions = Arc::new(SessionManager::new());

    let mut manager = ChannelManager::new();
    manager.register(Arc::clone(&email) as Arc<dyn Channel>).unwrap();
    manager
        .register(Arc::clone(&telegram) as Arc<dyn Channel>)
        .unwrap();
    manager.initialize_all().await.unwrap();

    // Agent session needs approval: register and fan out.
    sessions.register_session("s1", NotificationEvent::AwaitingApproval, "run tests?");
    let report = manager
        .send_to_all(&ChannelNotification::new(
            "s1",
            NotificationEvent::AwaitingApproval,
            "Approval needed",
            "run tests?",
        ))
        .await
        .unwrap();
    assert_eq!(report.success_count, 2);
    assert_eq!(report.failure_count, 0);
    sessions
        .store_message_id("s1", report.first_message_id().unwrap())
        .unwrap();

    // Operator replies on telegram; the unified queue sees it tagged.
    let (callback, mut rx) = shared_queue();
    manager.start_all_polling(callback).await;
    telegram.inject_reply("s1", "yes");

    let response = rx.recv().await.unwrap();
    assert_eq!(response.session_id, "s1");
    assert_eq!(response.channel, "telegram");

    // Capture and sync to the other channels.
    sessions
        .store_response(&response.session_id, &response.response, &response.from)
        .unwrap();
    manager
        .sync_response_to_other_channels(&response, &response.channel)
        .await;

    // Email saw the original prompt and the sync echo; telegram only the prompt.
    assert_eq!(
        email.sent_events(),
        vec![NotificationEvent::AwaitingApproval, NotificationEvent::ResponseSync]
    );
    assert_eq!(telegram.sent_events(), vec![NotificationEvent::AwaitingApproval]);

    // The response is consumed exactly once.
    let stored = sessions.consume_response("s1").unwrap();
    assert_eq!(stored.response, "yes");
    assert!(sessions.consume_response("s1").is_none());
}

#[tokio::test]
async fn partial_send_failure_is_reported_not_raised() {
    let email = FakeChannel::new("email");
    let sms = FakeChannel::failing("sms");

    let mut manager = ChannelManager::new();
    manager.register(Arc::clone(&email) as Arc<dyn Channel>).unwrap();
    manager.register(Arc::clone(&sms) as Arc<dyn Channel>).unwrap();

    let report = manager
        .send_to_all(&ChannelNotification::new(
            "s2",
            NotificationEvent::SessionEnded,
            "Done",
            "session finished",
        ))
        .await
        .unwrap();

    assert_eq!(report.success_count, 1);
    assert_eq!(report.failure_count, 1);
    assert!(report.results["email"].is_ok());
    assert!(report.results["sms"].is_err());
}

#[tokio::test]
async fn replies_from_any_channel_reach_the_same_queue() {
    let email = FakeChannel::new("email");
    let sms = FakeChannel::new("sms");

    let mut manager = ChannelManager::new();
    manager.register(Arc::clone(&email) as Arc<dyn Channel>).unwrap();
    manager.register(Arc::clone(&sms) as Arc<dyn Channel>).unwrap();

    let (callback, mut rx) = shared_queue();
    manager.start_all_polling(callback).await;

    email.inject_reply("s-a", "from email");
    sms.inject_reply("s-b", "from sms");

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let mut channels = vec![first.channel, second.channel];
    channels.sort();
    assert_eq!(channels, vec!["email".to_string(), "sms".to_string()]);
}
