use serde::{Deserialize, Serialize};

/// Domain event handed to the bus by callers. Never modified by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventRecord {
    pub event_id: i64,
    pub message_id: String,
    pub content: String,
    pub event_type_name: String,
}

impl EventRecord {
    pub fn new(
        event_id: i64,
        message_id: impl Into<String>,
        content: impl Into<String>,
        event_type_name: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            message_id: message_id.into(),
            content: content.into(),
            event_type_name: event_type_name.into(),
        }
    }

    /// Build a record whose content is the JSON encoding of `payload`.
    pub fn from_payload<T: Serialize>(
        event_id: i64,
        message_id: impl Into<String>,
        event_type_name: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(
            event_id,
            message_id,
            serde_json::to_string(payload)?,
            event_type_name,
        ))
    }
}

/// Address of a service instance as reported by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServiceEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}
