//! Event values and their type tags.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Event payload: string keys to arbitrary JSON values
pub type Payload = HashMap<String, Value>;

/// Categories an event may belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum EventType {
    /// Price updates, order book changes
    MarketData,
    /// Order lifecycle changes
    OrderUpdate,
    /// Trade executions
    TradeUpdate,
    /// Strategy state changes
    StrategyUpdate,
    /// Errors, including listener failures published by the engine
    Error,
    /// Informational messages
    Info,
    /// Engine lifecycle, heartbeats
    System,
}

impl EventType {
    /// Every known event type, in declaration order
    pub const ALL: [EventType; 7] = [
        EventType::MarketData,
        EventType::OrderUpdate,
        EventType::TradeUpdate,
        EventType::StrategyUpdate,
        EventType::Error,
        EventType::Info,
        EventType::System,
    ];

    /// Stable upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "MARKET_DATA",
            Self::OrderUpdate => "ORDER_UPDATE",
            Self::TradeUpdate => "TRADE_UPDATE",
            Self::StrategyUpdate => "STRATEGY_UPDATE",
            Self::Error => "ERROR",
            Self::Info => "INFO",
            Self::System => "SYSTEM",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| EngineError::InvalidEventType(s.to_string()))
    }
}

/// An immutable record of something that happened.
///
/// Equality covers the type and the payload only: two events carrying the
/// same content compare equal whatever their id, timestamp or source.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: EventType,
    data: Payload,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(event_type: EventType, data: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            data,
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// Create a new event tagged with the producer that emitted it
    pub fn with_source(event_type: EventType, data: Payload, source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new(event_type, data)
        }
    }

    /// Create an event from a type name, for producers that carry types as strings
    pub fn try_new(type_name: &str, data: Payload, source: Option<&str>) -> Result<Self> {
        let event_type = type_name.parse::<EventType>()?;
        Ok(match source {
            Some(source) => Self::with_source(event_type, data, source),
            None => Self::new(event_type, data),
        })
    }

    /// Create an event from a JSON object
    pub fn from_json(event_type: EventType, value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::new(event_type, map.into_iter().collect())),
            other => Err(EngineError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    /// Look up a single payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.event_type == other.event_type && self.data == other.data
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = serde_json::to_string(&self.data).map_err(|_| fmt::Error)?;
        write!(
            f,
            "Event(type: {}, data: {}, time: {}",
            self.event_type, data, self.timestamp
        )?;
        if let Some(source) = &self.source {
            write!(f, ", source: {}", source)?;
        }
        f.write_str(")")
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
