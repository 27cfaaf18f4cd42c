use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tokio::sync::mpsc;

/// Per-channel sequence number identifying a publish or a delivery.
pub type DeliveryTag = u64;

/// Argument and header table attached to queues and messages.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// Raw broker signals emitted on a channel in confirm mode.
pub type ConfirmStream = mpsc::UnboundedReceiver<ConfirmSignal>;

/// Deliveries pushed to a consumer.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

pub const ARG_EXPIRES: &str = "x-expires";
pub const ARG_MESSAGE_TTL: &str = "x-message-ttl";
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Str(String),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            FieldValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(value) => Some(value),
            FieldValue::Int(_) => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unknown exchange kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub delivery_mode: u8,
    pub headers: FieldTable,
}

impl MessageProperties {
    pub fn persistent(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            headers: FieldTable::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message staged for a batched publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// A message handed to a consumer or returned from a get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    /// The message id, if present and non-empty.
    pub fn message_id(&self) -> Option<&str> {
        self.properties
            .message_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmSignal {
    Ack {
        delivery_tag: DeliveryTag,
        multiple: bool,
    },
    Nack {
        delivery_tag: DeliveryTag,
        multiple: bool,
    },
    /// A mandatory message could not be routed to any queue.
    Return {
        message_id: Option<String>,
        reply_code: u16,
        reply_text: String,
    },
}
