//! Trading Event Engine
//!
//! A single-process event bus routing typed events from market data and
//! execution producers to strategies, risk managers and loggers.

pub mod config;
pub mod error;
pub mod events;


pub use config::{Config, EngineConfig};
pub use error::{EngineError, Result};
pub use events::{Event, EventEngine, EventType, Listener};
