//! Event vocabulary for the ticket streaming client.
//!
//! This crate defines the shared language between the stream transport, the
//! hub and the application code consuming events.
//!
//! # Architecture
//!
//! - **Topic**: one independent server-push stream (`tickets` or `notifications`)
//! - **EventType**: the fixed set of frame labels the server emits
//! - **EventEnvelope**: immutable record kept in the hub's history for each frame
//! - **payload**: typed records for every event type, decoded on demand
//!
//! This crate has no dependencies on the transport or the hub. Payloads travel
//! through the dispatch layer as untyped `serde_json::Value` and are decoded
//! into the typed records only by subscribers that ask for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod payload;

pub use payload::{
    Assignment, NotificationEvent, Ticket, TicketAssignedEvent, TicketCategory, TicketChannel,
    TicketCreatedEvent, TicketPriority, TicketStatus, TicketStatusChangedEvent, TicketSummary,
    TicketUpdatedEvent, Worklog, WorklogAddedEvent,
};

/// An independent event stream served at `{base}/sse/{topic}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Tickets,
    Notifications,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Tickets, Topic::Notifications];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Tickets => "tickets",
            Topic::Notifications => "notifications",
        }
    }

    /// Path of this topic's stream, relative to the API base URL.
    pub fn path(&self) -> String {
        format!("sse/{}", self.as_str())
    }

    /// Event types the server emits on this topic.
    pub fn event_types(&self) -> &'static [EventType] {
        match self {
            Topic::Tickets => &[
                EventType::Connected,
                EventType::TicketCreated,
                EventType::TicketUpdated,
                EventType::TicketStatusChanged,
                EventType::TicketAssigned,
                EventType::WorklogAdded,
            ],
            Topic::Notifications => &[EventType::Connected, EventType::Notification],
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame labels understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Sent by the server once a stream is established.
    Connected,
    TicketCreated,
    TicketUpdated,
    TicketStatusChanged,
    TicketAssigned,
    WorklogAdded,
    Notification,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::Connected,
        EventType::TicketCreated,
        EventType::TicketUpdated,
        EventType::TicketStatusChanged,
        EventType::TicketAssigned,
        EventType::WorklogAdded,
        EventType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::TicketCreated => "ticket_created",
            EventType::TicketUpdated => "ticket_updated",
            EventType::TicketStatusChanged => "ticket_status_changed",
            EventType::TicketAssigned => "ticket_assigned",
            EventType::WorklogAdded => "worklog_added",
            EventType::Notification => "notification",
        }
    }

    /// The topic whose stream carries this event type. `Connected` is sent on
    /// both streams and reports `None`.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            EventType::Connected => None,
            EventType::Notification => Some(Topic::Notifications),
            _ => Some(Topic::Tickets),
        }
    }

    /// Whether events of this type are business events kept in history, as
    /// opposed to stream bookkeeping.
    pub fn is_domain_event(&self) -> bool {
        !matches!(self, EventType::Connected)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

impl fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for UnknownEventType {}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == label)
            .ok_or_else(|| UnknownEventType(label.to_string()))
    }
}

/// A received event as recorded in history. Created once on receipt and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: EventType,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Returns true when the payload refers to `ticket_id`, either directly
    /// (`ticket_id`), through an embedded ticket (`ticket.id`) or through an
    /// embedded worklog (`worklog.ticket_id`).
    pub fn concerns_ticket(&self, ticket_id: &str) -> bool {
        let matches = |value: Option<&Value>| value.and_then(Value::as_str) == Some(ticket_id);

        matches(self.payload.pointer("/ticket/id"))
            || matches(self.payload.get("ticket_id"))
            || matches(self.payload.pointer("/worklog/ticket_id"))
    }
}
