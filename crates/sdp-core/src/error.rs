//! Error types for the SDP protocol engine.
//!
//! Errors are grouped so callers can decide what to do without matching every
//! variant:
//!
//! - **Transient**: send failures, transport faults, CRC mismatches. Counted
//!   into media statistics and retried within the attempt budget.
//! - **Protocol**: malformed or unwanted messages. Logged and dropped, never
//!   retried.
//! - **Resource**: peer pool exhausted, queue full or shut down, lock timeout.
//!   Surfaced to the caller immediately.
//! - **Fatal**: configuration problems found at startup. Init fails closed.

use std::borrow::Cow;
use thiserror::Error;

use sdp_transport::{QueueError, TransportError};

use crate::frame::WorkType;
use crate::peer::PeerHandle;

/// Frame-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame shorter than the preamble
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum size
        expected: usize,
        /// Size received
        actual: usize,
    },

    /// Work type byte outside the known range
    #[error("unknown work type: 0x{0:02X}")]
    UnknownWorkType(u8),

    /// CRC field disagrees with the frame contents
    #[error("CRC mismatch: frame says {expected:08x}, computed {actual:08x}")]
    CrcMismatch {
        /// CRC carried in the frame
        expected: u32,
        /// CRC computed over the frame
        actual: u32,
    },
}

/// Errors raised by the SDP engine
#[derive(Debug, Error)]
pub enum SdpError {
    // ============ Protocol Errors ============
    /// Frame could not be parsed
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// An installed filter rejected the message
    #[error("Message filtered: {0}")]
    MessageFiltered(WorkType),

    /// Payload fields do not match what the work type requires
    #[error("Invalid payload: {0}")]
    InvalidPayload(Cow<'static, str>),

    /// Conversation is not open for this peer
    #[error("Conversation {id} not open for peer {peer}")]
    ConvQueueError {
        /// Owning peer
        peer: PeerHandle,
        /// Conversation id
        id: u16,
    },

    /// Frame arrived with a relation id no known peer owns
    #[error("Unknown relation id {0:08x}")]
    UnknownRelation(u32),

    // ============ Peer Errors ============
    /// A peer with this identity already exists
    #[error("Peer already exists: {0}")]
    PeerExists(String),

    /// Handle does not refer to a live peer
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerHandle),

    /// Peer identity rejected
    #[error("Invalid peer: {0}")]
    InvalidPeer(Cow<'static, str>),

    // ============ Transmission Errors ============
    /// Every send attempt failed
    #[error("Send to peer {peer} failed after {attempts} attempts")]
    SendFail {
        /// Destination peer
        peer: PeerHandle,
        /// Attempts made
        attempts: u32,
    },

    /// No media is shared with the peer
    #[error("No common media with peer {0}")]
    NoMedia(PeerHandle),

    /// Driver error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ============ Resource Errors ============
    /// Peer pool is full
    #[error("Peer pool exhausted (capacity {capacity})")]
    OutOfMemory {
        /// Pool capacity
        capacity: usize,
    },

    /// Work queue refused the item
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Shared state lock could not be acquired in time
    #[error("Lock timeout: {0}")]
    LockTimeout(Cow<'static, str>),

    // ============ Configuration Errors ============
    /// Mandatory component missing at startup
    #[error("Initialization failed: {0}")]
    InitFail(Cow<'static, str>),

    /// Configuration value rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl SdpError {
    /// Transient failures worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SdpError::SendFail { .. }
                | SdpError::Transport(_)
                | SdpError::Frame(FrameError::CrcMismatch { .. })
        )
    }

    /// Malformed or unwanted messages: log and drop
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            SdpError::Frame(FrameError::TooShort { .. } | FrameError::UnknownWorkType(_))
                | SdpError::MessageFiltered(_)
                | SdpError::InvalidPayload(_)
                | SdpError::ConvQueueError { .. }
                | SdpError::UnknownRelation(_)
        )
    }

    /// Resource exhaustion surfaced to the caller
    #[must_use]
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            SdpError::OutOfMemory { .. }
                | SdpError::LockTimeout(_)
                | SdpError::Queue(
                    QueueError::Busy | QueueError::ShutDown | QueueError::LockTimeout
                )
        )
    }

    /// Startup problems; the component must not run
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SdpError::InitFail(_) | SdpError::InvalidConfig(_) | SdpError::Queue(QueueError::InitFail(_))
        )
    }

    /// Lock timeout with static context (zero allocation)
    #[must_use]
    pub const fn lock_timeout(context: &'static str) -> Self {
        SdpError::LockTimeout(Cow::Borrowed(context))
    }

    /// Invalid payload with static context (zero allocation)
    #[must_use]
    pub const fn invalid_payload(context: &'static str) -> Self {
        SdpError::InvalidPayload(Cow::Borrowed(context))
    }

    /// Init failure with static context (zero allocation)
    #[must_use]
    pub const fn init_fail(context: &'static str) -> Self {
        SdpError::InitFail(Cow::Borrowed(context))
    }

    /// Invalid configuration with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        SdpError::InvalidConfig(Cow::Borrowed(context))
    }
}

/// Result type for SDP operations
pub type Result<T> = std::result::Result<T, SdpError>;
