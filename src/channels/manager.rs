//! Channel registry — parallel fan-out, polling lifecycle, cross-channel sync.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use tracing::{info, warn};

use crate::channels::{
    Channel, ChannelNotification, ChannelResponse, ChannelStatus, NotificationEvent,
    ResponseCallback,
};
use crate::error::ChannelError;

/// Aggregate result of a fan-out dispatch.
///
/// A partial failure is data, not an error: every enabled channel gets an
/// entry, successful sends carry the provider message id.
#[derive(Debug)]
pub struct DispatchReport {
    pub results: HashMap<String, Result<String, ChannelError>>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl DispatchReport {
    /// Provider message id from the first successful channel, if any.
    pub fn first_message_id(&self) -> Option<&str> {
        self.results
            .values()
            .find_map(|r| r.as_ref().ok().map(String::as_str))
    }
}

/// Registry of channels. Fans notifications out to every enabled channel in
/// parallel and re-broadcasts resolved replies so all channels show a
/// consistent conversation.
#[derive(Default)]
pub struct ChannelManager {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Names are unique within a manager.
    pub fn register(&mut self, channel: Arc<dyn Channel>) -> Result<(), ChannelError> {
        if self.channels.iter().any(|c| c.name() == channel.name()) {
            return Err(ChannelError::AlreadyRegistered(channel.name().to_string()));
        }
        self.channels.push(channel);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.name() == name)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Sequentially initialize every registered channel, aborting on the
    /// first failure. After an error the manager must be treated as unusable.
    pub async fn initialize_all(&self) -> Result<(), ChannelError> {
        for channel in &self.channels {
            channel.initialize().await?;
            info!(channel = channel.name(), "Channel initialized");
        }
        Ok(())
    }

    /// Dispatch a notification to every enabled channel concurrently and wait
    /// for all of them to settle. A slow or failing channel never blocks or
    /// cancels the others. Zero enabled channels is the only hard failure.
    pub async fn send_to_all(
        &self,
        notification: &ChannelNotification,
    ) -> Result<DispatchReport, ChannelError> {
        let enabled: Vec<&Arc<dyn Channel>> =
            self.channels.iter().filter(|c| c.enabled()).collect();
        if enabled.is_empty() {
            return Err(ChannelError::NoEnabledChannels);
        }

        let sends = enabled.iter().map(|channel| async move {
            let name = channel.name().to_string();
            let result = channel.send(notification).await;
            (name, result)
        });
        let settled = future::join_all(sends).await;

        let mut results = HashMap::new();
        let mut success_count = 0;
        let mut failure_count = 0;
        for (name, result) in settled {
            match &result {
                Ok(_) => success_count += 1,
                Err(e) => {
                    failure_count += 1;
                    warn!(channel = %name, error = %e, "Dispatch failed");
                }
            }
            results.insert(name, result);
        }

        Ok(DispatchReport {
            results,
            success_count,
            failure_count,
        })
    }

    /// Start polling on every enabled channel. All channels share the same
    /// callback instance, so the caller sees one unified inbound stream.
    pub async fn start_all_polling(&self, callback: ResponseCallback) {
        for channel in self.channels.iter().filter(|c| c.enabled()) {
            channel.start_polling(Arc::clone(&callback)).await;
        }
    }

    pub async fn stop_all_polling(&self) {
        for channel in &self.channels {
            channel.stop_polling().await;
        }
    }

    /// Dispose every channel and clear the registry. The manager ends up
    /// empty, not just disabled.
    pub async fn dispose_all(&mut self) {
        for channel in &self.channels {
            channel.dispose().await;
        }
        self.channels.clear();
    }

    /// Echo a resolved reply to every enabled channel except the one that
    /// produced it, in parallel, best-effort. The authoritative response was
    /// already captured; sync failures are logged, never raised.
    pub async fn sync_response_to_other_channels(
        &self,
        response: &ChannelResponse,
        origin_channel: &str,
    ) {
        let notification = ChannelNotification::new(
            &response.session_id,
            NotificationEvent::ResponseSync,
            format!("Reply received via {origin_channel}"),
            &response.response,
        );

        let targets: Vec<&Arc<dyn Channel>> = self
            .channels
            .iter()
            .filter(|c| c.enabled() && c.name() != origin_channel)
            .collect();

        let sends = targets.iter().map(|channel| {
            let notification = &notification;
            async move { (channel.name().to_string(), channel.send(notification).await) }
        });
        for (name, result) in future::join_all(sends).await {
            if let Err(e) = result {
                warn!(channel = %name, error = %e, "Response sync failed");
            }
        }
    }

    pub async fn statuses(&self) -> Vec<ChannelStatus> {
        let mut out = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            out.push(channel.status().await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::ConfigError;

    /// In-memory channel that records what it is asked to send.
    struct MockChannel {
        name: &'static str,
        enabled: bool,
        fail_send: bool,
        sent: Mutex<Vec<ChannelNotification>>,
        initialized: AtomicBool,
        polling: AtomicBool,
        disposed: AtomicBool,
    }

    impl MockChannel {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                enabled: true,
                fail_send: false,
                sent: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                polling: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                fail_send: true,
                ..Self::new(name)
            }
        }

        fn disabled(name: &'static str) -> Self {
            Self {
                enabled: false,
                ..Self::new(name)
            }
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
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
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, notification: &ChannelNotification) -> Result<String, ChannelError> {
            if self.fail_send {
                return Err(ChannelError::SendFailed {
                    name: self.name.to_string(),
                    reason: "mock failure".into(),
                });
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(format!("{}-msg-1", self.name))
        }

        async fn start_polling(&self, _callback: ResponseCallback) {
            self.polling.store(true, Ordering::SeqCst);
        }

        async fn stop_polling(&self) {
            self.polling.store(false, Ordering::SeqCst);
        }

        async fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }

        async fn status(&self) -> ChannelStatus {
            ChannelStatus {
                name: self.name.to_string(),
                enabled: self.enabled,
                connected: self.initialized.load(Ordering::SeqCst),
                last_activity: Some(Utc::now()),
                last_error: None,
            }
        }
    }

    fn notification() -> ChannelNotification {
        ChannelNotification::new(
            "s1",
            NotificationEvent::AwaitingApproval,
            "Approval needed",
            "continue?",
        )
    }

    #[test]
    fn register_rejects_duplicate_name() {
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::new(MockChannel::new("email"))).unwrap();
        assert!(matches!(
            mgr.register(Arc::new(MockChannel::new("email"))),
            Err(ChannelError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn send_to_all_aggregates_partial_failure() {
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::new(MockChannel::new("email"))).unwrap();
        mgr.register(Arc::new(MockChannel::failing("telegram")))
            .unwrap();
        mgr.register(Arc::new(MockChannel::new("sms"))).unwrap();

        let report = mgr.send_to_all(&notification()).await.unwrap();
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert!(report.results["email"].is_ok());
        assert!(report.results["telegram"].is_err());
        assert!(report.results["sms"].is_ok());
    }

    #[tokio::test]
    async fn send_to_all_skips_disabled_channels() {
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::new(MockChannel::new("email"))).unwrap();
        mgr.register(Arc::new(MockChannel::disabled("sms"))).unwrap();

        let report = mgr.send_to_all(&notification()).await.unwrap();
        assert_eq!(report.success_count, 1);
        assert!(!report.results.contains_key("sms"));
    }

    #[tokio::test]
    async fn send_to_all_with_zero_enabled_channels_fails() {
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::new(MockChannel::disabled("email")))
            .unwrap();

        assert!(matches!(
            mgr.send_to_all(&notification()).await,
            Err(ChannelError::NoEnabledChannels)
        ));
    }

    #[tokio::test]
    async fn send_to_all_on_empty_manager_fails() {
        let mgr = ChannelManager::new();
        assert!(matches!(
            mgr.send_to_all(&notification()).await,
            Err(ChannelError::NoEnabledChannels)
        ));
    }

    #[tokio::test]
    async fn initialize_all_touches_every_channel() {
        let email = Arc::new(MockChannel::new("email"));
        let sms = Arc::new(MockChannel::new("sms"));
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::clone(&email) as Arc<dyn Channel>).unwrap();
        mgr.register(Arc::clone(&sms) as Arc<dyn Channel>).unwrap();

        mgr.initialize_all().await.unwrap();
        assert!(email.initialized.load(Ordering::SeqCst));
        assert!(sms.initialized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sync_skips_origin_channel() {
        let email = Arc::new(MockChannel::new("email"));
        let telegram = Arc::new(MockChannel::new("telegram"));
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::clone(&email) as Arc<dyn Channel>).unwrap();
        mgr.register(Arc::clone(&telegram) as Arc<dyn Channel>)
            .unwrap();

        let response = ChannelResponse {
            session_id: "s1".into(),
            response: "yes".into(),
            from: "operator".into(),
            timestamp: Utc::now(),
            channel: "telegram".into(),
        };
        mgr.sync_response_to_other_channels(&response, "telegram")
            .await;

        assert_eq!(telegram.sent.lock().unwrap().len(), 0);
        let synced = email.sent.lock().unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].event, NotificationEvent::ResponseSync);
        assert_eq!(synced[0].message, "yes");
    }

    #[tokio::test]
    async fn sync_failures_are_swallowed() {
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::new(MockChannel::failing("email"))).unwrap();

        let response = ChannelResponse {
            session_id: "s1".into(),
            response: "no".into(),
            from: "operator".into(),
            timestamp: Utc::now(),
            channel: "sms".into(),
        };
        // Must not panic or propagate the send error.
        mgr.sync_response_to_other_channels(&response, "sms").await;
    }

    #[tokio::test]
    async fn dispose_all_clears_registry() {
        let email = Arc::new(MockChannel::new("email"));
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::clone(&email) as Arc<dyn Channel>).unwrap();

        mgr.dispose_all().await;
        assert!(email.disposed.load(Ordering::SeqCst));
        assert_eq!(mgr.channel_count(), 0);
    }

    #[tokio::test]
    async fn polling_lifecycle_hits_enabled_channels() {
        let email = Arc::new(MockChannel::new("email"));
        let off = Arc::new(MockChannel::disabled("sms"));
        let mut mgr = ChannelManager::new();
        mgr.register(Arc::clone(&email) as Arc<dyn Channel>).unwrap();
        mgr.register(Arc::clone(&off) as Arc<dyn Channel>).unwrap();

        let callback: ResponseCallback = Arc::new(|_| {});
        mgr.start_all_polling(callback).await;
        assert!(email.polling.load(Ordering::SeqCst));
        assert!(!off.polling.load(Ordering::SeqCst));

        mgr.stop_all_polling().await;
        assert!(!email.polling.load(Ordering::SeqCst));
    }
}
