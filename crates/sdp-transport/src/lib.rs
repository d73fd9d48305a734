//! # SDP Transport
//!
//! Transport layer for the SDP protocol.
//!
//! This crate provides:
//! - Media identifiers and capability bitmasks
//! - The `Transport` trait every physical driver implements
//! - The bounded work queue each transport (and the dispatcher) runs on
//! - An in-memory bus for tests and simulation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod media;
pub mod memory;
pub mod transport;
pub mod worker;

pub use media::{MacAddress, MediaMask, MediaType, SenderId};
pub use memory::{MemoryBus, MemoryTransport};
pub use transport::{Inbound, Transport, TransportError, TransportResult, TransportStats};
pub use worker::{QueueConfig, QueueError, QueueStats, WorkQueue, WorkQueueBuilder};
