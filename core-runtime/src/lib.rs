//! # Runtime Infrastructure
//!
//! Ambient services shared across the tunecore workspace:
//! - Structured logging built on `tracing`
//! - A broadcast event bus for decoupled module communication
//! - Common runtime error types

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, PlaybackEvent};
pub use logging::{init_logging, LogFormat, LoggingConfig};
