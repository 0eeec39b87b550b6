//! # relay-core
//!
//! Core types, configuration, and the wire codec for the relay event bus.
//!
//! This crate holds everything that does not need a runtime or a backend
//! connection: the [`Event`] model, channel naming, subscription patterns,
//! the JSON envelope codec, the error taxonomy, and bus configuration.
//! `relay-bus` builds the connected machinery on top of it.

pub mod channel;
pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;

// Re-export commonly used types at crate root
pub use channel::{validate_event_type, BackendChannel, ChannelClass, ChannelNamer, Pattern};
pub use config::{BackoffConfig, BusConfig, DispatchConfig, HealthConfig, PoolConfig};
pub use error::{Error, Result};
pub use events::{decode_event, encode_event, Event, ENVELOPE_VERSION};
