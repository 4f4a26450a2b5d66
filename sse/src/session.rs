//! Ties the hub's lifetime to authentication state.

use events::{
    EventType, NotificationEvent, TicketAssignedEvent, TicketCreatedEvent,
    TicketStatusChangedEvent, TicketUpdatedEvent, Topic, WorklogAddedEvent,
};
use log::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::ConnectionState;
use crate::dispatcher::Subscription;
use crate::hub::EventHub;

/// Authentication as published by whoever owns the login flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub token: Option<String>,
}

impl AuthState {
    pub fn signed_in(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|token| !token.is_empty())
    }
}

/// A consumer's view of the hub for as long as it lives.
///
/// On creation the hub is started if the user is already signed in. A
/// background task then follows `auth`: signing in starts the hub, signing
/// out stops it and a new token is rotated onto the live streams. Every
/// subscription made through the scope is removed when the scope is dropped;
/// the hub itself keeps running.
///
/// Must be created from within a Tokio runtime.
pub struct SessionScope {
    hub: EventHub,
    subscriptions: Mutex<Vec<Subscription>>,
    watcher: JoinHandle<()>,
}

impl SessionScope {
    pub fn new(hub: EventHub, mut auth: watch::Receiver<AuthState>) -> Self {
        let current = auth.borrow_and_update().clone();
        apply_auth(&hub, &AuthState::signed_out(), &current);

        let watcher = tokio::spawn(follow_auth(hub.clone(), auth, current));

        Self {
            hub,
            subscriptions: Mutex::new(Vec::new()),
            watcher,
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn is_connected(&self) -> bool {
        self.hub.is_connected()
    }

    pub fn watch_state(&self, topic: Topic) -> watch::Receiver<ConnectionState> {
        self.hub.watch_state(topic)
    }

    pub fn unread_notification_count(&self) -> u64 {
        self.hub.unread_notification_count()
    }

    pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.track(self.hub.subscribe(event_type, callback))
    }

    pub fn subscribe_as<T, F>(&self, event_type: EventType, callback: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.track(self.hub.subscribe_as(event_type, callback))
    }

    pub fn on_ticket_created<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketCreatedEvent) + Send + Sync + 'static,
    {
        self.track(self.hub.on_ticket_created(callback))
    }

    pub fn on_ticket_updated<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketUpdatedEvent) + Send + Sync + 'static,
    {
        self.track(self.hub.on_ticket_updated(callback))
    }

    pub fn on_ticket_status_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketStatusChangedEvent) + Send + Sync + 'static,
    {
        self.track(self.hub.on_ticket_status_changed(callback))
    }

    pub fn on_ticket_assigned<F>(&self, callback: F) -> Subscription
    where
        F: Fn(TicketAssignedEvent) + Send + Sync + 'static,
    {
        self.track(self.hub.on_ticket_assigned(callback))
    }

    pub fn on_worklog_added<F>(&self, callback: F) -> Subscription
    where
        F: Fn(WorklogAddedEvent) + Send + Sync + 'static,
    {
        self.track(self.hub.on_worklog_added(callback))
    }

    pub fn on_notification<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NotificationEvent) + Send + Sync + 'static,
    {
        self.track(self.hub.on_notification(callback))
    }

    fn track(&self, subscription: Subscription) -> Subscription {
        let mut subscriptions = self.lock();
        subscriptions.retain(Subscription::is_active);
        subscriptions.push(subscription.clone());
        subscription
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        self.watcher.abort();
        for subscription in self.lock().drain(..) {
            subscription.unsubscribe();
        }
    }
}

async fn follow_auth(hub: EventHub, mut auth: watch::Receiver<AuthState>, mut previous: AuthState) {
    while auth.changed().await.is_ok() {
        let current = auth.borrow_and_update().clone();
        apply_auth(&hub, &previous, &current);
        previous = current;
    }
    debug!("Auth state publisher dropped, no longer following sign-in changes");
}

fn apply_auth(hub: &EventHub, previous: &AuthState, current: &AuthState) {
    if !current.is_authenticated() {
        if hub.is_initialized() {
            info!("Signed out, stopping SSE hub");
            hub.disconnect();
        }
        return;
    }

    if !hub.is_initialized() {
        info!("Signed in, starting SSE hub");
        hub.initialize(current.token.as_deref());
    } else if previous.is_authenticated() && previous.token != current.token {
        if let Some(token) = current.token.as_deref() {
            info!("Auth token changed, rotating SSE token");
            hub.update_token(token);
        }
    }
}
