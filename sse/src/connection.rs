use events::{EventType, Topic};
use log::*;
use serde_json::Value;
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant, Sleep};
use url::Url;

use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::{config_error, Error};
use crate::retry::RetryPolicy;
use crate::transport::{authenticated_url, EventTransport, TransportEvent, TransportStream};

/// Chosen to exceed the server's 30 second heartbeat interval with margin.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(45_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries are exhausted. Only an explicit `connect()` resumes.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub retry: RetryPolicy,
    pub heartbeat_timeout: Duration,
}

impl ConnectionOptions {
    pub fn new(retry: RetryPolicy, heartbeat_timeout: Duration) -> Self {
        Self {
            retry,
            heartbeat_timeout,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

/// Receives lifecycle notifications from a connection. All methods default to
/// doing nothing. Calls are made from the connection's driver task, in the
/// order the transitions happen.
pub trait ConnectionObserver: Send + Sync {
    /// Called once per actual change of state, never for same-state re-entry.
    fn on_state_change(&self, _topic: Topic, _state: ConnectionState) {}

    fn on_error(&self, _topic: Topic, _error: &Error) {}

    /// Called before the delay of each reconnect attempt starts.
    fn on_reconnect(&self, _topic: Topic, _attempt: u32, _delay: Duration) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

enum Command {
    Connect,
    Disconnect,
    UpdateToken(String),
}

/// A self-healing subscription to one topic's server-push stream.
///
/// All operations return immediately. Opening, closing, dispatching and
/// timer handling happen on a driver task spawned at construction, which
/// processes commands in the order they were issued and ahead of any timer
/// that became due at the same moment. Dropping the connection closes the
/// transport and stops the driver.
///
/// Must be created from within a Tokio runtime.
pub struct StreamConnection {
    topic: Topic,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: EventDispatcher,
}

impl StreamConnection {
    pub fn new(
        topic: Topic,
        endpoint: Url,
        token: impl Into<String>,
        options: ConnectionOptions,
        transport: Arc<dyn EventTransport>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let dispatcher = EventDispatcher::new();

        let driver = Driver {
            topic,
            endpoint,
            token: token.into(),
            options,
            transport,
            observer,
            dispatcher: dispatcher.clone(),
            commands: command_rx,
            state_tx,
            state: ConnectionState::Disconnected,
            attempts: 0,
            stream: None,
            heartbeat: None,
            reconnect: None,
        };
        tokio::spawn(driver.run());

        Self {
            topic,
            commands,
            state,
            dispatcher,
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Open a fresh transport, closing any existing one first.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Cancel pending timers, close the transport and settle in
    /// `Disconnected`. Safe from any state.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Replace the token. A connected stream is closed and reopened with the
    /// new token; otherwise the token is used by the next attempt.
    pub fn update_token(&self, token: impl Into<String>) {
        self.send(Command::UpdateToken(token.into()));
    }

    /// Register a handler for `event_type`. Handlers registered while the
    /// stream is open receive every later event of that type.
    pub fn on<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.dispatcher.on(event_type, handler)
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.dispatcher.off(subscription)
    }

    pub fn off_all(&self, event_type: EventType) {
        self.dispatcher.off_all(event_type);
    }

    pub fn clear_handlers(&self) {
        self.dispatcher.clear();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("SSE {} driver is no longer running", self.topic);
        }
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

enum Wake {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    HeartbeatExpired,
    ReconnectDue,
}

/// Owns the transport and both timers. Each timer is a single optional
/// deadline, so cancelling it is just clearing the slot.
struct Driver {
    topic: Topic,
    endpoint: Url,
    token: String,
    options: ConnectionOptions,
    transport: Arc<dyn EventTransport>,
    observer: Arc<dyn ConnectionObserver>,
    dispatcher: EventDispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    attempts: u32,
    stream: Option<TransportStream>,
    heartbeat: Option<Pin<Box<Sleep>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                command = self.commands.recv() => Wake::Command(command),
                event = next_event(&mut self.stream) => Wake::Transport(event),
                _ = expire(&mut self.heartbeat) => Wake::HeartbeatExpired,
                _ = expire(&mut self.reconnect) => Wake::ReconnectDue,
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => {
                    // Every handle is gone
                    self.disconnect();
                    break;
                }
                Wake::Transport(Some(event)) => self.handle_transport_event(event),
                Wake::Transport(None) => {
                    debug!("SSE {} stream ended by server", self.topic);
                    self.stream = None;
                    self.handle_error(Error::stream_closed());
                }
                Wake::HeartbeatExpired => {
                    warn!("SSE {} heartbeat timeout - connection may be dead", self.topic);
                    self.handle_error(Error::heartbeat_timeout(self.options.heartbeat_timeout));
                }
                Wake::ReconnectDue => {
                    self.reconnect = None;
                    self.open();
                }
            }
        }

        debug!("SSE {} driver stopped", self.topic);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                // An explicit connect starts a fresh retry budget
                self.attempts = 0;
                self.open();
            }
            Command::Disconnect => self.disconnect(),
            Command::UpdateToken(token) => {
                self.token = token;
                if self.state == ConnectionState::Connected {
                    info!("SSE {} token updated, reconnecting", self.topic);
                    self.disconnect();
                    self.open();
                }
            }
        }
    }

    fn open(&mut self) {
        if self.stream.is_some() {
            self.disconnect();
        }
        self.reconnect = None;

        self.set_state(ConnectionState::Connecting);

        let url = authenticated_url(&self.endpoint, &self.token);
        match self.transport.open(&url) {
            Ok(stream) => {
                self.stream = Some(stream);
                // Armed from the first moment so a server that never answers
                // is detected the same way as one that goes quiet.
                self.reset_heartbeat();
            }
            Err(e) => {
                debug!("Failed to open SSE {} transport: {}", self.topic, e);
                self.handle_error(e);
            }
        }
    }

    fn disconnect(&mut self) {
        self.reconnect = None;
        self.heartbeat = None;
        if self.stream.take().is_some() {
            debug!("SSE {} transport closed", self.topic);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                self.reset_heartbeat();
            }
            TransportEvent::Frame(frame) => {
                self.reset_heartbeat();
                self.dispatcher.dispatch_frame(&frame);
            }
            TransportEvent::Heartbeat => {
                trace!("SSE {} keep-alive", self.topic);
                self.reset_heartbeat();
            }
            TransportEvent::Failed(e) => {
                debug!("SSE {} connection error: {}", self.topic, e);
                self.handle_error(e);
            }
        }
    }

    /// Single path for every failure: stop the liveness timer, report, discard
    /// the transport and hand over to the retry policy.
    fn handle_error(&mut self, error: Error) {
        self.heartbeat = None;
        self.observer.on_error(self.topic, &error);
        self.stream = None;
        self.attempt_reconnect();
    }

    fn attempt_reconnect(&mut self) {
        let retry = self.options.retry;
        if !retry.allows(self.attempts) {
            error!(
                "SSE {} giving up after {} reconnect attempts",
                self.topic, self.attempts
            );
            self.set_state(ConnectionState::Failed);
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        self.attempts += 1;
        let delay = retry.delay_for(self.attempts);
        self.observer.on_reconnect(self.topic, self.attempts, delay);

        info!(
            "SSE {} reconnecting in {}ms (attempt {})",
            self.topic,
            delay.as_millis(),
            self.attempts
        );

        self.reconnect = Some(Box::pin(sleep(delay)));
    }

    fn reset_heartbeat(&mut self) {
        let deadline = Instant::now() + self.options.heartbeat_timeout;
        match &mut self.heartbeat {
            Some(timer) => timer.as_mut().reset(deadline),
            slot @ None => *slot = Some(Box::pin(sleep_until(deadline))),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.state_tx.send_replace(state);
            self.observer.on_state_change(self.topic, state);
        }
    }
}

async fn next_event(stream: &mut Option<TransportStream>) -> Option<TransportEvent> {
    use futures_util::StreamExt;

    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

/// Build the endpoint for `topic` under `base`.
pub fn topic_endpoint(base: &Url, topic: Topic) -> Result<Url, Error> {
    if base.cannot_be_a_base() {
        return Err(config_error("base URL cannot carry a path"));
    }
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(&topic.path())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TransportErrorKind};
    use crate::mock::MockTransport;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::advance;

    #[derive(Debug, Clone, PartialEq)]
    enum Note {
        State(ConnectionState),
        Error(ErrorKind),
        Reconnect(u32, Duration),
    }

    #[derive(Default)]
    struct RecordingObserver {
        notes: Mutex<Vec<Note>>,
    }

    impl RecordingObserver {
        fn notes(&self) -> Vec<Note> {
            self.notes.lock().unwrap().clone()
        }

        fn states(&self) -> Vec<ConnectionState> {
            self.notes()
                .into_iter()
                .filter_map(|note| match note {
                    Note::State(state) => Some(state),
                    _ => None,
                })
                .collect()
        }

        fn reconnects(&self) -> Vec<(u32, Duration)> {
            self.notes()
                .into_iter()
                .filter_map(|note| match note {
                    Note::Reconnect(attempt, delay) => Some((attempt, delay)),
                    _ => None,
                })
                .collect()
        }
    }

    impl ConnectionObserver for RecordingObserver {
        fn on_state_change(&self, _topic: Topic, state: ConnectionState) {
            self.notes.lock().unwrap().push(Note::State(state));
        }

        fn on_error(&self, _topic: Topic, error: &Error) {
            self.notes.lock().unwrap().push(Note::Error(error.kind()));
        }

        fn on_reconnect(&self, _topic: Topic, attempt: u32, delay: Duration) {
            self.notes
                .lock()
                .unwrap()
                .push(Note::Reconnect(attempt, delay));
        }
    }

    fn endpoint() -> Url {
        Url::parse("http://localhost:8000/api/v1/sse/tickets").unwrap()
    }

    fn connection(
        transport: &MockTransport,
        observer: &Arc<RecordingObserver>,
        options: ConnectionOptions,
    ) -> StreamConnection {
        StreamConnection::new(
            Topic::Tickets,
            endpoint(),
            "T1",
            options,
            Arc::new(transport.clone()),
            observer.clone(),
        )
    }

    /// Let the driver task catch up without moving the paused clock.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn connected(
        transport: &MockTransport,
        observer: &Arc<RecordingObserver>,
        options: ConnectionOptions,
    ) -> StreamConnection {
        let conn = connection(transport, observer, options);
        conn.connect();
        settle().await;
        transport.last_link().unwrap().open();
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn connect_opens_transport_with_token_and_reaches_connected() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connection(&transport, &observer, ConnectionOptions::default());

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.connect();
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Connecting);
        let link = transport.last_link().unwrap();
        assert_eq!(link.token().as_deref(), Some("T1"));
        assert_eq!(link.url().path(), "/api/v1/sse/tickets");

        link.open();
        settle().await;

        assert!(conn.is_connected());
        assert_eq!(
            observer.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_delivered_in_order_and_only_to_matching_type() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _created = conn.on(EventType::TicketCreated, {
            let seen = Arc::clone(&seen);
            move |payload| seen.lock().unwrap().push(payload["n"].as_i64().unwrap())
        });

        let link = transport.last_link().unwrap();
        for n in 1..=5 {
            link.frame("ticket_created", json!({ "n": n }));
            link.frame("ticket_updated", json!({ "n": n * 100 }));
        }
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_until_cap_and_resets_after_open() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connection(&transport, &observer, ConnectionOptions::default());
        conn.connect();
        settle().await;

        for attempt in 1..=7u32 {
            let expected = Duration::from_millis((1000u64 << (attempt - 1)).min(30_000));
            let opens = transport.open_count();

            transport.last_link().unwrap().fail("connection refused");
            settle().await;

            assert_eq!(conn.state(), ConnectionState::Reconnecting);
            assert_eq!(observer.reconnects().last(), Some(&(attempt, expected)));

            advance(expected - Duration::from_millis(1)).await;
            settle().await;
            assert_eq!(transport.open_count(), opens, "reopened too early");

            advance(Duration::from_millis(1)).await;
            settle().await;
            assert_eq!(transport.open_count(), opens + 1);
            assert_eq!(conn.state(), ConnectionState::Connecting);
        }

        transport.last_link().unwrap().open();
        settle().await;
        assert!(conn.is_connected());

        transport.last_link().unwrap().fail("dropped");
        settle().await;
        assert_eq!(
            observer.reconnects().last(),
            Some(&(1, Duration::from_millis(1000)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_triggers_exactly_one_reconnect() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let link = transport.last_link().unwrap();

        advance(Duration::from_millis(44_999)).await;
        settle().await;
        assert!(conn.is_connected());

        // Any traffic pushes the deadline out again
        link.heartbeat();
        settle().await;
        advance(Duration::from_millis(44_999)).await;
        settle().await;
        assert!(conn.is_connected());

        advance(Duration::from_millis(1)).await;
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert!(link.is_closed());
        let reconnecting = observer
            .states()
            .into_iter()
            .filter(|state| *state == ConnectionState::Reconnecting)
            .count();
        assert_eq!(reconnecting, 1);
        assert!(observer
            .notes()
            .contains(&Note::Error(ErrorKind::HeartbeatTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn domain_frames_also_count_as_liveness() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let link = transport.last_link().unwrap();

        for _ in 0..4 {
            advance(Duration::from_millis(30_000)).await;
            link.frame("connected", json!({}));
            settle().await;
        }

        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_reconnecting_cancels_pending_reconnect() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;

        transport.last_link().unwrap().fail("dropped");
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Reconnecting);

        conn.disconnect();
        advance(Duration::from_secs(120)).await;
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.live_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_heartbeat_timer() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;

        conn.disconnect();
        settle().await;
        advance(Duration::from_secs(300)).await;
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_count(), 1);
        assert!(!observer
            .notes()
            .contains(&Note::Error(ErrorKind::HeartbeatTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_end_in_failed_until_explicit_connect() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let options = ConnectionOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(1000), Duration::from_millis(30_000)),
            ..ConnectionOptions::default()
        };
        let conn = connection(&transport, &observer, options);
        conn.connect();
        settle().await;

        transport.last_link().unwrap().fail("refused");
        settle().await;
        advance(Duration::from_millis(1000)).await;
        settle().await;
        transport.last_link().unwrap().fail("refused");
        settle().await;
        advance(Duration::from_millis(2000)).await;
        settle().await;
        transport.last_link().unwrap().fail("refused");
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(transport.open_count(), 3);

        advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(transport.open_count(), 3);

        conn.connect();
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(transport.open_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn update_token_while_connected_replaces_transport() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let first = transport.last_link().unwrap();

        conn.update_token("T2");
        settle().await;

        let second = transport.last_link().unwrap();
        assert!(first.is_closed());
        assert_eq!(second.token().as_deref(), Some("T2"));
        assert_eq!(transport.live_links(), 1);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(
            observer.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn update_token_while_reconnecting_applies_to_next_attempt() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;

        transport.last_link().unwrap().fail("dropped");
        settle().await;
        conn.update_token("T2");
        settle().await;
        assert_eq!(transport.open_count(), 1);

        advance(Duration::from_millis(1000)).await;
        settle().await;

        assert_eq!(transport.open_count(), 2);
        assert_eq!(transport.last_link().unwrap().token().as_deref(), Some("T2"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_never_overlaps_transports() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;

        conn.connect();
        settle().await;
        assert_eq!(transport.live_links(), 1);

        transport.last_link().unwrap().open();
        transport.last_link().unwrap().end();
        settle().await;
        assert_eq!(transport.live_links(), 0);
        assert_eq!(conn.state(), ConnectionState::Reconnecting);

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(transport.live_links(), 1);
        assert_eq!(transport.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscription_receives_later_events() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let link = transport.last_link().unwrap();

        link.frame("notification", json!({"n": 1}));
        settle().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = conn.on(EventType::Notification, {
            let seen = Arc::clone(&seen);
            move |payload| seen.lock().unwrap().push(payload["n"].as_i64().unwrap())
        });

        link.frame("notification", json!({"n": 2}));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_keeps_connection_and_next_frame_flows() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let seen = Arc::new(Mutex::new(0));
        let _sub = conn.on(EventType::TicketUpdated, {
            let seen = Arc::clone(&seen);
            move |_| *seen.lock().unwrap() += 1
        });

        let link = transport.last_link().unwrap();
        link.raw_frame("ticket_updated", "{not json");
        link.frame("ticket_updated", json!({"ticket": {"id": "1"}}));
        settle().await;

        assert!(conn.is_connected());
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(observer.reconnects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_disturb_connection() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let count = Arc::new(Mutex::new(0));
        let _bad = conn.on(EventType::TicketCreated, |_| panic!("boom"));
        let _good = conn.on(EventType::TicketCreated, {
            let count = Arc::clone(&count);
            move |_| *count.lock().unwrap() += 1
        });

        let link = transport.last_link().unwrap();
        link.frame("ticket_created", json!({}));
        link.frame("ticket_created", json!({}));
        settle().await;

        assert!(conn.is_connected());
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn construction_failure_goes_through_reconnect_path() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connection(&transport, &observer, ConnectionOptions::default());
        transport.refuse_next(1);

        conn.connect();
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert!(observer
            .notes()
            .contains(&Note::Error(ErrorKind::Transport(TransportErrorKind::Builder))));

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(transport.links().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redundant_disconnect_emits_no_notification() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connection(&transport, &observer, ConnectionOptions::default());

        conn.disconnect();
        conn.disconnect();
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(observer.notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_handlers_stop_receiving() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let count = Arc::new(Mutex::new(0));
        let counter = |count: &Arc<Mutex<i32>>| {
            let count = Arc::clone(count);
            move |_: &Value| *count.lock().unwrap() += 1
        };

        let one = conn.on(EventType::TicketAssigned, counter(&count));
        let _two = conn.on(EventType::TicketAssigned, counter(&count));
        let _three = conn.on(EventType::WorklogAdded, counter(&count));
        let link = transport.last_link().unwrap();

        conn.off(&one);
        link.frame("ticket_assigned", json!({}));
        settle().await;
        assert_eq!(*count.lock().unwrap(), 1);

        conn.off_all(EventType::TicketAssigned);
        link.frame("ticket_assigned", json!({}));
        link.frame("worklog_added", json!({}));
        settle().await;
        assert_eq!(*count.lock().unwrap(), 2);

        conn.clear_handlers();
        link.frame("worklog_added", json!({}));
        settle().await;
        assert_eq!(*count.lock().unwrap(), 2);
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_connection_closes_transport() {
        let transport = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let conn = connected(&transport, &observer, ConnectionOptions::default()).await;
        let link = transport.last_link().unwrap();

        drop(conn);
        settle().await;

        assert!(link.is_closed());
        assert_eq!(
            observer.states().last(),
            Some(&ConnectionState::Disconnected)
        );
    }

    #[test]
    fn topic_endpoints_join_under_base_path() {
        let base = Url::parse("http://localhost:8000/api/v1").unwrap();

        assert_eq!(
            topic_endpoint(&base, Topic::Tickets).unwrap().as_str(),
            "http://localhost:8000/api/v1/sse/tickets"
        );
        assert_eq!(
            topic_endpoint(&base, Topic::Notifications).unwrap().as_str(),
            "http://localhost:8000/api/v1/sse/notifications"
        );
    }

    #[test]
    fn trailing_slash_base_is_accepted() {
        let base = Url::parse("https://example.com/api/v1/").unwrap();

        assert_eq!(
            topic_endpoint(&base, Topic::Tickets).unwrap().as_str(),
            "https://example.com/api/v1/sse/tickets"
        );
    }

    #[test]
    fn default_options() {
        let options = ConnectionOptions::default();

        assert_eq!(options.heartbeat_timeout, Duration::from_millis(45_000));
        assert_eq!(options.retry.max_attempts, 0);
        assert_eq!(options.retry.initial_delay, Duration::from_millis(1000));
        assert_eq!(options.retry.max_delay, Duration::from_millis(30_000));
    }
}
