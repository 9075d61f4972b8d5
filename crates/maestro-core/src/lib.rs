//! Core types, error definitions, and the message bus for Maestro.
//!
//! This crate provides the foundational pieces shared by every other Maestro
//! crate: the unified error type, the inter-agent [`Message`] envelope, and
//! the topic-based [`MessageBus`] that carries those messages between
//! components.
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`Message`] — An immutable event published on the bus.
//! - [`MessageKind`] — Command, event, result, or error.
//! - [`MessageBus`] — Publish/subscribe transport with per-subscriber ordering.

/// Topic-based publish/subscribe transport.
pub mod bus;
/// Error taxonomy shared by all crates.
pub mod error;
/// Message envelope published on the bus.
pub mod message;
/// Tracing subscriber bootstrap.
pub mod telemetry;

pub use bus::{
    handler_fn, BusConfig, HistoryFilter, MessageBus, MessageHandler, Subscription,
    WILDCARD_TOPIC,
};
pub use error::{MaestroError, MaestroResult};
pub use message::{Message, MessageKind};
pub use telemetry::{init_tracing, LogConfig};
