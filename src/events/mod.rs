//! Event-Driven Architecture (EDA) Module
//!
//! In-process event bus decoupling producers (market data feeds, execution
//! clients, strategies) from consumers (strategies, risk managers, loggers).
//!
//! # Architecture
//! ```text
//! producers --submit--> [ queue ] --> dispatch thread --> bucket[type] --> listener.handle()
//!                          ^                                  |
//!                          |                                  v
//!                      scheduler                      failure reporter
//!                   (submit_after)               (tracing / ERROR events)
//! ```
//!
//! # Guarantees
//! - Events are delivered in the order the queue accepted them
//! - Listeners sharing a type are called in registration order
//! - A failing or panicking listener never stops delivery to others
//! - Registration may happen from inside a handler; it applies to every
//!   event dispatched after the call returns
//!
//! # Example
//! ```no_run
//! use event_engine::config::EngineConfig;
//! use event_engine::events::{Event, EventEngine, EventType, FnListener};
//! use serde_json::json;
//!
//! let engine = EventEngine::new(EngineConfig::default());
//! engine.register(FnListener::shared("printer", [EventType::MarketData], |event| {
//!     println!("{event}");
//!     Ok(())
//! }));
//! engine.start().unwrap();
//! engine.submit(Event::from_json(EventType::MarketData, json!({"symbol": "ETH-USD"})).unwrap());
//! engine.stop();
//! ```

mod dispatch;
mod engine;
mod event;
mod listener;
mod reporter;
mod scheduler;


pub use dispatch::DispatchTable;
pub use engine::{EngineHandle, EngineMetrics, EngineState, EventEngine};
pub use event::{Event, EventType, Payload};
pub use listener::{same_listener, FnListener, Listener, ListenerRef};
pub use reporter::{FailureReporter, ListenerFailure, TracingReporter, ENGINE_SOURCE};
