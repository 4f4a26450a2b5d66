//! Process-wide coordinator for the two topic streams.
//!
//! The hub owns one [`StreamConnection`] per [`Topic`], records every domain
//! event it receives into a bounded [`EventHistory`], counts unread
//! notifications and fans events out to local subscribers. Subscribers
//! register with the hub rather than with a connection, so they survive token
//! rotation and reconnects.

use events::{
    EventEnvelope, EventType, NotificationEvent, TicketAssignedEvent, TicketCreatedEvent,
    TicketStatusChangedEvent, TicketUpdatedEvent, Topic, WorklogAddedEvent,
};
use log::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use crate::connection::{
    topic_endpoint, ConnectionObserver, ConnectionOptions, ConnectionState, StreamConnection,
};
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::{Error, ErrorKind, TransportErrorKind};
use crate::history::EventHistory;
use crate::transport::EventTransport;

#[derive(Clone)]
pub struct EventHub {
    shared: Arc<HubShared>,
}

struct HubShared {
    tickets_endpoint: Url,
    notifications_endpoint: Url,
    options: ConnectionOptions,
    transport: Arc<dyn EventTransport>,
    inner: Mutex<HubInner>,
    subscribers: EventDispatcher,
    history: watch::Sender<EventHistory>,
    unread: watch::Sender<u64>,
    tickets_state: watch::Sender<ConnectionState>,
    notifications_state: watch::Sender<ConnectionState>,
    tickets_attempt: watch::Sender<u32>,
    notifications_attempt: watch::Sender<u32>,
}

#[derive(Default)]
struct HubInner {
    token: Option<String>,
    connections: Vec<StreamConnection>,
    // Bumped on every teardown so drivers of discarded connections can no
    // longer publish state.
    generation: u64,
}

impl EventHub {
    /// Create an idle hub whose streams live under `base_url`. Nothing is
    /// opened until [`EventHub::initialize`].
    pub fn new(
        base_url: &Url,
        options: ConnectionOptions,
        transport: Arc<dyn EventTransport>,
    ) -> Result<Self, Error> {
        let shared = HubShared {
            tickets_endpoint: topic_endpoint(base_url, Topic::Tickets)?,
            notifications_endpoint: topic_endpoint(base_url, Topic::Notifications)?,
            options,
            transport,
            inner: Mutex::new(HubInner::default()),
            subscribers: EventDispatcher::new(),
            history: watch::channel(EventHistory::new()).0,
            unread: watch::channel(0).0,
            tickets_state: watch::channel(ConnectionState::Disconnected).0,
            notifications_state: watch::channel(ConnectionState::Disconnected).0,
            tickets_attempt: watch::channel(0).0,
            notifications_attempt: watch::channel(0).0,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Open both topic streams with `token`. Without a token this only logs.
    /// Connections left over from an earlier call are closed first; local
    /// subscriptions are kept.
    pub fn initialize(&self, token: Option<&str>) {
        let Some(token) = token.filter(|token| !token.is_empty()) else {
            warn!("No auth token available, skipping SSE initialization");
            return;
        };

        let shared = &self.shared;
        let mut inner = shared.lock();
        if !inner.connections.is_empty() {
            debug!("Replacing existing SSE connections");
            shared.teardown(&mut inner);
        }
        inner.token = Some(token.to_string());

        for topic in Topic::ALL {
            let connection = StreamConnection::new(
                topic,
                shared.endpoint(topic).clone(),
                token,
                shared.options,
                Arc::clone(&shared.transport),
                Arc::new(HubObserver {
                    hub: Arc::downgrade(shared),
                    generation: inner.generation,
                }),
            );

            for &event_type in topic.event_types() {
                let hub = Arc::downgrade(shared);
                let _ = connection.on(event_type, move |payload| {
                    if let Some(hub) = hub.upgrade() {
                        hub.record(event_type, payload);
                    }
                });
            }

            connection.connect();
            inner.connections.push(connection);
        }

        info!("SSE hub initialized");
    }

    /// Close both streams, cancel their timers and drop every local
    /// subscription.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        self.shared.teardown(&mut inner);
        drop(inner);

        self.shared.subscribers.clear();
        info!("SSE hub disconnected");
    }

    /// [`EventHub::disconnect`] followed by [`EventHub::initialize`] with the
    /// current token. Local subscriptions are dropped as part of the
    /// disconnect.
    pub fn reconnect(&self) {
        let token = self.current_token();
        self.disconnect();
        self.initialize(token.as_deref());
    }

    /// Rotate the token. Live streams reopen with it, streams still retrying
    /// use it on their next attempt and streams that gave up or were closed
    /// are opened again with a fresh retry budget. Subscriptions are kept.
    pub fn update_token(&self, token: &str) {
        let mut inner = self.shared.lock();
        inner.token = Some(token.to_string());
        for connection in &inner.connections {
            connection.update_token(token);
            if matches!(
                connection.state(),
                ConnectionState::Failed | ConnectionState::Disconnected
            ) {
                info!("Reopening SSE {} stream with the new token", connection.topic());
                connection.connect();
            }
        }
    }

    pub fn current_token(&self) -> Option<String> {
        self.shared.lock().token.clone()
    }

    /// True while the hub holds connections, whatever their state.
    pub fn is_initialized(&self) -> bool {
        !self.shared.lock().connections.is_empty()
    }

    /// Register `callback` for `event_type`. The returned handle removes
    /// exactly this callback.
    pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.subscribers.on(event_type, callback)
    }

    /// Like [`EventHub::subscribe`], decoding the payload into `T` first.
    /// Payloads that do not decode are logged and skipped.
    pub fn subscribe_as<T, F>(&self, event_type: EventType, callback: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(event_type, move |payload| {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(event) => callback(event),
                Err(e) => warn!("Skipping {} event with unexpected payload: {}", event_type, e),
            }
        })
    }

    pub fn on_ticket_created<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketCreatedEvent) + Send + Sync + 'static,
    {
        self.subscribe_as(EventType::TicketCreated, callback)
    }

    pub fn on_ticket_updated<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketUpdatedEvent) + Send + Sync + 'static,
    {
        self.subscribe_as(EventType::TicketUpdated, callback)
    }

    pub fn on_ticket_status_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketStatusChangedEvent) + Send + Sync + 'static,
    {
        self.subscribe_as(EventType::TicketStatusChanged, callback)
    }

    pub fn on_ticket_assigned<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketAssignedEvent) + Send + Sync + 'static,
    {
        self.subscribe_as(EventType::TicketAssigned, callback)
    }

    pub fn on_worklog_added<F>(&self, callback: F) -> Subscription
    where
        F: Fn(WorklogAddedEvent) + Send + Sync + 'static,
    {
        self.subscribe_as(EventType::WorklogAdded, callback)
    }

    pub fn on_notification<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NotificationEvent) + Send + Sync + 'static,
    {
        self.subscribe_as(EventType::Notification, callback)
    }

    pub fn mark_notifications_read(&self) {
        self.shared.unread.send_replace(0);
    }

    pub fn unread_notification_count(&self) -> u64 {
        *self.shared.unread.borrow()
    }

    pub fn watch_unread_notifications(&self) -> watch::Receiver<u64> {
        self.shared.unread.subscribe()
    }

    pub fn clear_events(&self) {
        self.shared.history.send_modify(EventHistory::clear);
    }

    /// Snapshot of the history, most recent first.
    pub fn recent_events(&self) -> Vec<Arc<EventEnvelope>> {
        self.shared.history.borrow().snapshot()
    }

    pub fn watch_events(&self) -> watch::Receiver<EventHistory> {
        self.shared.history.subscribe()
    }

    pub fn get_events_by_type(&self, event_type: EventType) -> Vec<Arc<EventEnvelope>> {
        self.shared.history.borrow().by_type(event_type)
    }

    /// Events whose payload refers to `ticket_id` directly, through an
    /// embedded ticket or through an embedded worklog.
    pub fn get_events_for_ticket(&self, ticket_id: &str) -> Vec<Arc<EventEnvelope>> {
        self.shared.history.borrow().for_ticket(ticket_id)
    }

    pub fn state(&self, topic: Topic) -> ConnectionState {
        *self.shared.state_sender(topic).borrow()
    }

    pub fn watch_state(&self, topic: Topic) -> watch::Receiver<ConnectionState> {
        self.shared.state_sender(topic).subscribe()
    }

    /// Reconnect attempt the topic is currently waiting on, `0` while it is
    /// not retrying.
    pub fn reconnect_attempt(&self, topic: Topic) -> u32 {
        *self.shared.attempt_sender(topic).borrow()
    }

    pub fn watch_reconnect_attempt(&self, topic: Topic) -> watch::Receiver<u32> {
        self.shared.attempt_sender(topic).subscribe()
    }

    pub fn is_tickets_connected(&self) -> bool {
        self.state(Topic::Tickets) == ConnectionState::Connected
    }

    pub fn is_notifications_connected(&self) -> bool {
        self.state(Topic::Notifications) == ConnectionState::Connected
    }

    /// True when either stream is connected.
    pub fn is_connected(&self) -> bool {
        self.is_tickets_connected() || self.is_notifications_connected()
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("tickets", &self.state(Topic::Tickets))
            .field("notifications", &self.state(Topic::Notifications))
            .field("events", &self.shared.history.borrow().len())
            .finish()
    }
}

impl HubShared {
    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint(&self, topic: Topic) -> &Url {
        match topic {
            Topic::Tickets => &self.tickets_endpoint,
            Topic::Notifications => &self.notifications_endpoint,
        }
    }

    fn state_sender(&self, topic: Topic) -> &watch::Sender<ConnectionState> {
        match topic {
            Topic::Tickets => &self.tickets_state,
            Topic::Notifications => &self.notifications_state,
        }
    }

    fn attempt_sender(&self, topic: Topic) -> &watch::Sender<u32> {
        match topic {
            Topic::Tickets => &self.tickets_attempt,
            Topic::Notifications => &self.notifications_attempt,
        }
    }

    fn publish_state(&self, topic: Topic, state: ConnectionState) {
        self.state_sender(topic).send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if matches!(state, ConnectionState::Connected | ConnectionState::Disconnected) {
            self.publish_attempt(topic, 0);
        }
    }

    fn publish_attempt(&self, topic: Topic, attempt: u32) {
        self.attempt_sender(topic).send_if_modified(|current| {
            if *current == attempt {
                return false;
            }
            *current = attempt;
            true
        });
    }

    fn teardown(&self, inner: &mut HubInner) {
        inner.generation += 1;
        for connection in inner.connections.drain(..) {
            connection.disconnect();
        }
        for topic in Topic::ALL {
            self.publish_state(topic, ConnectionState::Disconnected);
        }
    }

    fn record(&self, event_type: EventType, payload: &Value) {
        if event_type.is_domain_event() {
            let envelope = Arc::new(EventEnvelope::new(event_type, payload.clone()));
            debug!("Recorded {} event {}", event_type, envelope.id);
            self.history.send_modify(|history| history.push(envelope));
        }

        if event_type == EventType::Notification {
            self.unread.send_modify(|count| *count += 1);
        }

        self.subscribers.dispatch(event_type, payload);
    }
}

struct HubObserver {
    hub: Weak<HubShared>,
    generation: u64,
}

impl HubObserver {
    /// Run `f` against the hub unless this observer's connections have been
    /// discarded. The inner lock is held for the duration.
    fn with_current_hub(&self, topic: Topic, f: impl FnOnce(&HubShared)) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let inner = hub.lock();
        if inner.generation != self.generation {
            trace!("Ignoring {} report from a discarded connection", topic);
            return;
        }
        f(hub.as_ref());
        drop(inner);
    }
}

impl ConnectionObserver for HubObserver {
    fn on_state_change(&self, topic: Topic, state: ConnectionState) {
        self.with_current_hub(topic, |hub| {
            info!("SSE {} connection state: {}", topic, state);
            hub.publish_state(topic, state);
        });
    }

    fn on_error(&self, topic: Topic, error: &Error) {
        self.with_current_hub(topic, |_| match error.kind() {
            ErrorKind::Transport(TransportErrorKind::Closed) | ErrorKind::HeartbeatTimeout => {
                warn!("SSE {} stream lost: {}", topic, error)
            }
            _ => error!("SSE {} stream error: {}", topic, error),
        });
    }

    fn on_reconnect(&self, topic: Topic, attempt: u32, delay: Duration) {
        self.with_current_hub(topic, |hub| {
            debug!(
                "SSE {} scheduling reconnect attempt {} after {}ms",
                topic,
                attempt,
                delay.as_millis()
            );
            hub.publish_attempt(topic, attempt);
        });
    }
}
