//! Typed payload records for each event type.
//!
//! Timestamps are kept as the server's ISO 8601 strings. Fields the client
//! doesn't use are ignored on decode, and optional fields default to `None`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Assigned,
    InProgress,
    PendingCustomer,
    PendingVendor,
    Resolved,
    Closed,
    Cancelled,
    /// A status this client does not know yet.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketCategory {
    Hardware,
    Software,
    Network,
    Power,
    Connector,
    Firmware,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketChannel {
    Phone,
    Email,
    Web,
    Mobile,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub ticket_number: String,
    pub title: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub charger_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub channel: Option<TicketChannel>,
    #[serde(default)]
    pub category: Option<TicketCategory>,
    #[serde(default)]
    pub priority: Option<TicketPriority>,
    #[serde(default)]
    pub current_status: Option<TicketStatus>,
    #[serde(default)]
    pub opened_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub sla_breached: bool,
}

/// The reduced ticket view embedded in worklog events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketSummary {
    pub id: String,
    pub ticket_number: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub ticket_id: String,
    pub assignee_type: String,
    #[serde(default)]
    pub assignee_user_id: Option<String>,
    #[serde(default)]
    pub assignee_vendor_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worklog {
    pub id: String,
    pub ticket_id: String,
    pub body: String,
    pub work_type: String,
    #[serde(default)]
    pub time_spent_minutes: Option<u32>,
    pub is_internal: bool,
    pub author_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketCreatedEvent {
    pub ticket: Ticket,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketUpdatedEvent {
    pub ticket: Ticket,
    #[serde(default)]
    pub updated_fields: Map<String, Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketStatusChangedEvent {
    pub ticket: Ticket,
    pub old_status: TicketStatus,
    pub new_status: TicketStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketAssignedEvent {
    pub assignment: Assignment,
    pub ticket: Ticket,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorklogAddedEvent {
    pub worklog: Worklog,
    pub ticket: TicketSummary,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Application-level notification kind, distinct from the frame label.
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    pub timestamp: String,
}
