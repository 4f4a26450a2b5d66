//! Server-Sent Events (SSE) client for real-time ticket updates.
//!
//! This crate keeps a long-lived, self-healing subscription to the ticket
//! service's server-push streams and fans the received events out to local
//! subscribers.
//!
//! # Architecture
//!
//! - **One connection per topic**: `tickets` and `notifications` each get a
//!   [`StreamConnection`] with its own state machine, retry budget and
//!   heartbeat deadline. A failure on one never affects the other.
//! - **Driver task**: every connection owns a Tokio task that holds the
//!   transport and both timers. Public operations only enqueue commands, so
//!   none of them block, and `disconnect()` cancels timers deterministically.
//! - **Handler registry**: [`EventDispatcher`] keys handlers by event type and
//!   removes them by identity. Malformed payloads and panicking handlers are
//!   logged and isolated per frame and per handler.
//! - **Hub**: [`EventHub`] owns both connections, a bounded most-recent-first
//!   history, an unread notification counter and the subscriber registry the
//!   rest of the application talks to.
//! - **Session glue**: [`SessionScope`] starts, stops and re-tokens the hub
//!   as authentication state changes.
//!
//! # Message Flow
//!
//! 1. `EventHub::initialize(token)` opens `{base}/sse/tickets` and
//!    `{base}/sse/notifications` with the token in the query string
//! 2. The transport yields named frames; any traffic resets the heartbeat
//! 3. The connection's dispatcher parses the payload and invokes the hub's
//!    internal handler for that event type
//! 4. The hub records the event into history and invokes local subscribers
//! 5. On transport error or heartbeat timeout the connection backs off
//!    exponentially and reopens
//!
//! # Example
//!
//! ```rust,ignore
//! use sse::{ConnectionOptions, EventHub, EventSourceTransport};
//!
//! let hub = EventHub::new(&base_url, ConnectionOptions::default(), Arc::new(EventSourceTransport::new()))?;
//! let _sub = hub.on_ticket_created(|event| println!("new ticket {}", event.ticket.ticket_number));
//! hub.initialize(Some(&token));
//! ```
//!
//! # Modules
//!
//! - `connection`: StreamConnection state machine and its driver task
//! - `dispatcher`: Per-event-type handler registry
//! - `history`: Bounded event history
//! - `hub`: EventHub coordinating both topics
//! - `message`: Raw frames as received from the transport
//! - `retry`: Exponential backoff policy
//! - `session`: Authentication-bound lifecycle
//! - `transport`: Transport seam and the eventsource-client implementation

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod hub;
pub mod message;
pub mod retry;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use connection::{
    ConnectionObserver, ConnectionOptions, ConnectionState, NoopObserver, StreamConnection,
};
pub use dispatcher::{EventDispatcher, Subscription};
pub use error::{Error, ErrorKind, TransportErrorKind};
pub use history::{EventHistory, MAX_STORED_EVENTS};
pub use hub::EventHub;
pub use retry::RetryPolicy;
pub use session::{AuthState, SessionScope};
pub use transport::{EventSourceTransport, EventTransport};
