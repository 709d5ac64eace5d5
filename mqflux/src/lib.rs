#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//!
//! use std::sync::Arc;
//!
//! use mqflux::conf::Settings;
//! use mqflux::consumer::{Consumer, ConsumerConfig};
//! use mqflux::context::ServerContext;
//! use mqflux::writer::MemoryWriter;
//! use mqflux::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scx = ServerContext::builder(Settings::from_toml("")?).build()?;
//!
//!     let writer = Arc::new(MemoryWriter::default());
//!     let consumer = Consumer::new(scx.bus.clone(), &ConsumerConfig::default(), writer)?;
//!     let handle = consumer.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown(std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

/// Access control
pub mod auth; // Control-plane client and cached authorizer
pub mod cache; // Authorization cache backends

/// Message plane
pub mod bus; // Subject based publish/subscribe
pub mod codec; // Bus wire encoding of messages
pub mod queue; // Bounded async queue
pub mod topic; // MQTT topic to channel/subtopic parsing
pub mod types; // Shared data types

/// MQTT adapter
pub mod context; // Shared services of one process
pub mod events; // Lifecycle event store and cache invalidation
pub mod handler; // Session hooks and layers
pub mod session; // Per-connection session state

/// Persistence
pub mod consumer; // Bus subscriber driving a writer
pub mod forwarder; // Bus to MQTT republishing
pub mod reader; // Paged reads of stored messages
pub mod transformer; // Payload normalization
pub mod writer; // Storage writers

pub use mqflux_conf as conf;
pub use mqflux_utils as utils;

/// Crate-wide result type
pub type Result<T, E = anyhow::Error> = anyhow::Result<T, E>;
