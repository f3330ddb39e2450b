#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured control logging and event distribution for the arrow control stack.

/// Append-only JSON-lines log with size based rotation.
#[path = "../log.rs"]
pub mod log;

/// Control event records, publishers and the in-memory broadcast bus.
#[path = "../bus.rs"]
pub mod bus;

pub use bus::{ControlEvent, ControlEventBus, EventPublisher, FanoutPublisher, FileEventPublisher};
pub use log::{JsonLinesLogger, LogLevel, LogRecord};
