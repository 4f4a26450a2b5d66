use events::EventType;
use serde_json::Value;

use crate::error::Error;

/// One server-pushed message as delivered by the transport: the raw event
/// label and the undecoded data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event_type: String,
    pub data: String,
}

impl Frame {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    /// The typed label, or `None` for labels outside the vocabulary (including
    /// the default unnamed `message` event).
    pub fn event_type(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    pub fn payload(&self) -> Result<Value, Error> {
        Ok(serde_json::from_str(&self.data)?)
    }
}
