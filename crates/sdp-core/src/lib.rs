//! # SDP Core
//!
//! Protocol engine for SDP, a peer-to-peer messaging layer for small
//! embedded nodes that talk over several physical media at once.
//!
//! This crate provides:
//! - Frame encoding and decoding with CRC-32 integrity
//! - The peer store with per-media link statistics
//! - Media scoring and selection
//! - Conversation tracking for request/reply exchanges
//! - The dispatcher routing inbound frames and sending outbound ones
//! - Wake/sleep orchestration between nodes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Node                                    │
//! │   (transport queues + application queue + orchestrator)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Dispatcher                                │
//! │   (routing, handshakes, priority receipts, media failover)      │
//! ├──────────────────┬──────────────────┬───────────────────────────┤
//! │    PeerStore     │   MediaScorer    │   ConversationTracker     │
//! ├──────────────────┴──────────────────┴───────────────────────────┤
//! │                          Frames                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod node;
pub mod orchestration;
pub mod peer;
pub mod scorer;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::NodeConfig;
pub use conversation::{Conversation, ConversationTracker, Origin};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherConfig, DispatcherStats};
pub use error::{FrameError, Result, SdpError};
pub use frame::{
    PREAMBLE_LEN, PayloadBuilder, WorkItem, WorkType, build_frame, crc32_be, parse_frame,
    verify_crc,
};
pub use node::{Node, NodeBuilder};
pub use orchestration::{
    Alignment, OrchestrationConfig, OrchestrationLink, Orchestrator, PowerControl, SleepReport,
    ThreadSleep,
};
pub use peer::{
    Availability, MediaStats, Peer, PeerHandle, PeerState, PeerStore, ProtocolVersion,
    relation_id,
};
pub use scorer::{MediaProfile, MediaScorer};

pub use sdp_transport::{MacAddress, MediaMask, MediaType};
