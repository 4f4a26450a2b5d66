use anyhow::{bail, Context, Result};
use colored::*;
use events::{EventEnvelope, EventType, Topic};
use log::*;
use service::{config::Config, logging::Logger};
use sse::{
    AuthState, ConnectionOptions, EventHub, EventSourceTransport, RetryPolicy, SessionScope,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use url::Url;

mod output;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::new();
    Logger::init_logger(&config).context("Failed to start the terminal logger")?;
    debug!(
        "Hiding log records from [{}]",
        Logger::hidden_dependencies(config.log_level_filter).join(", ")
    );

    let base_url = Url::parse(config.api_base_url())
        .with_context(|| format!("Invalid API base URL [{}]", config.api_base_url()))?;
    let Some(token) = config.access_token() else {
        bail!("No access token configured, set ACCESS_TOKEN or pass --access-token");
    };

    info!("Streaming ticket events from [{}]...", base_url);

    let hub = EventHub::new(
        &base_url,
        connection_options(&config),
        Arc::new(EventSourceTransport::new()),
    )?;
    let (_auth, auth_rx) = watch::channel(AuthState::signed_in(token));
    let scope = SessionScope::new(hub.clone(), auth_rx);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<EventEnvelope>();
    for event_type in EventType::ALL {
        let events_tx = events_tx.clone();
        scope.subscribe(event_type, move |payload| {
            // The receiver only goes away during shutdown
            let _ = events_tx.send(EventEnvelope::new(event_type, payload.clone()));
        });
    }
    drop(events_tx);

    let mut tickets_state = scope.watch_state(Topic::Tickets);
    let mut notifications_state = scope.watch_state(Topic::Notifications);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    println!("{} Waiting for events (Ctrl-C to stop)", "→".blue());

    let mut printed = 0usize;
    loop {
        tokio::select! {
            Some(envelope) = events_rx.recv() => {
                if config.ticket_id().map_or(true, |id| envelope.concerns_ticket(id)) {
                    output::print_event(&envelope);
                    printed += 1;
                }
            }
            Ok(()) = tickets_state.changed() => {
                let state = *tickets_state.borrow_and_update();
                output::print_state(Topic::Tickets, state);
            }
            Ok(()) = notifications_state.changed() => {
                let state = *notifications_state.borrow_and_update();
                output::print_state(Topic::Notifications, state);
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {e}");
                }
                break;
            }
        }
    }

    output::print_summary(
        &hub.recent_events(),
        hub.unread_notification_count(),
        printed,
    );

    drop(scope);
    hub.disconnect();

    Ok(())
}

fn connection_options(config: &Config) -> ConnectionOptions {
    ConnectionOptions::new(
        RetryPolicy::new(
            config.max_reconnect_attempts,
            config.initial_reconnect_delay(),
            config.max_reconnect_delay(),
        ),
        config.heartbeat_timeout(),
    )
}
