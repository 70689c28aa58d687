use std::sync::Arc;

use agent_relay::channels::{
    ChannelManager, ChannelResponse, EmailChannel, ResponseCallback, SmsChannel, TelegramChannel,
};
use agent_relay::config::{EmailConfig, SmsConfig, TelegramConfig};
use agent_relay::error::SessionError;
use agent_relay::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    eprintln!("📡 agent-relay v{}", env!("CARGO_PKG_VERSION"));

    let sessions = Arc::new(SessionManager::new());
    let mut manager = ChannelManager::new();
    let mut active_channels: Vec<&str> = Vec::new();

    if let Some(email_config) = EmailConfig::from_env() {
        eprintln!(
            "   Email: configured (IMAP: {}, SMTP: {}, operator: {})",
            email_config.imap_host, email_config.smtp_host, email_config.operator_address
        );
        manager.register(Arc::new(EmailChannel::new(
            email_config,
            Arc::clone(&sessions),
        )))?;
        active_channels.push("email");
    }

    if let Some(telegram_config) = TelegramConfig::from_env() {
        eprintln!("   Telegram: configured (chat: {})", telegram_config.chat_id);
        manager.register(Arc::new(TelegramChannel::new(telegram_config)))?;
        active_channels.push("telegram");
    }

    if let Some(sms_config) = SmsConfig::from_env() {
        eprintln!("   SMS: configured (operator: {})", sms_config.operator_number);
        manager.register(Arc::new(SmsChannel::new(sms_config)))?;
        active_channels.push("sms");
    }

    if active_channels.is_empty() {
        anyhow::bail!(
            "No channels configured. Set EMAIL_IMAP_HOST, TELEGRAM_BOT_TOKEN \
             or SMS_ACCOUNT_SID to enable one."
        );
    }
    eprintln!("   Channels: {}\n", active_channels.join(", "));

    manager.initialize_all().await?;
    let sweeper = agent_relay::session::spawn_sweep_task(Arc::clone(&sessions));

    // All channels share one callback; replies drain through a single queue.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChannelResponse>();
    let callback: ResponseCallback = Arc::new(move |response| {
        let _ = tx.send(response);
    });
    manager.start_all_polling(callback).await;

    let manager = Arc::new(manager);
    let inbound = {
        let manager = Arc::clone(&manager);
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                tracing::info!(
                    session = %response.session_id,
                    channel = %response.channel,
                    "Reply received"
                );
                match sessions.store_response(
                    &response.session_id,
                    &response.response,
                    &response.from,
                ) {
                    Ok(()) => {
                        manager
                            .sync_response_to_other_channels(&response, &response.channel)
                            .await;
                    }
                    Err(SessionError::NotFound { id }) => {
                        // Tell the operator through the channel they used,
                        // never drop the reply silently.
                        tracing::warn!(session = %id, "Reply for unknown session");
                        if let Some(origin) = manager.get(&response.channel) {
                            let guidance = agent_relay::channels::ChannelNotification::new(
                                &response.session_id,
                                agent_relay::channels::NotificationEvent::ResponseSync,
                                "Session not found",
                                format!(
                                    "Session {id} is no longer active. It may have \
                                     expired or already been answered."
                                ),
                            );
                            if let Err(e) = origin.send(&guidance).await {
                                tracing::warn!("Failed to send session-not-found notice: {e}");
                            }
                        }
                    }
                }
            }
        })
    };

    tracing::info!("agent-relay running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    manager.stop_all_polling().await;
    inbound.abort();
    let _ = inbound.await;
    sweeper.abort();
    if let Ok(mut manager) = Arc::try_unwrap(manager) {
        manager.dispose_all().await;
    }

    Ok(())
}
