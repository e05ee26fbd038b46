//! Error types for the event engine

use crate::events::EventType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Listener {listener} failed on {event_type}: {detail}")]
    ListenerFailure {
        listener: String,
        event_type: EventType,
        detail: String,
    },

    #[error("Engine is running; stop it before draining the queue")]
    EngineRunning,

    #[error("Engine is busy: another consumer is draining the queue")]
    EngineBusy,

    #[error("Engine has failed and cannot be restarted")]
    EngineFailed,

    #[error("Engine has been dropped")]
    EngineDropped,

    #[error("Event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
