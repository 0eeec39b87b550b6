//! # relay-bus
//!
//! Connected machinery of the relay event bus.
//!
//! An [`EventBus`] relays events between independently running processes
//! through a shared pub/sub backend and fans each received event out to
//! in-process subscribers:
//!
//! ```text
//! publish ──► Publisher ──► backend channel ──► SubscriberLoop ──► Dispatcher ──► callbacks
//!                │                                    ▲
//!                └──── local loopback ────────────────┼──────────────────────────► callbacks
//!                                                     │
//!                               HealthMonitor ────────┘ (probe, heartbeat, staleness)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use relay_bus::{handler_fn, EventBus};
//! use relay_core::BusConfig;
//!
//! # async fn run() -> relay_core::Result<()> {
//! let bus = EventBus::connect(BusConfig::new("memory://")).await?;
//! bus.subscribe(
//!     "room:*",
//!     handler_fn(|event| async move {
//!         println!("{} {}", event.event_type, event.data);
//!         Ok(())
//!     }),
//! )?;
//! bus.publish("room:42:joined", serde_json::json!({"user": "a"})).await?;
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backoff;
pub mod bus;
pub mod dispatcher;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod publisher;
pub mod registry;
pub mod state;
pub mod subscriber;

pub use backend::{memory::MemoryBackend, redis::RedisBackend, Backend, RawMessage};
pub use bus::EventBus;
pub use handler::{handler_fn, ChannelHandler, EventHandler, HandlerError, HandlerResult};
pub use health::HealthSnapshot;
pub use pool::PoolStats;
pub use publisher::PublishReceipt;
pub use registry::SubscriptionId;
pub use state::BusState;

pub use relay_core::{BusConfig, Error, Event, Result};
