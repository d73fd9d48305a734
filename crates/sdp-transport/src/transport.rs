//! Transport trait abstraction for the physical drivers.
//!
//! Each physical channel (radio, bus, modem) implements `Transport` once. The
//! dispatcher only ever talks to drivers through this trait, so the protocol
//! engine never depends on a specific radio or bus.

use std::io;

use crate::media::{MacAddress, MediaType, SenderId};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying driver
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Destination not reachable on this media
    #[error("Destination unreachable: {0}")]
    Unreachable(MacAddress),

    /// Frame exceeds what the media can carry
    #[error("Frame too large for {media}: {len} > {max}")]
    TooLarge {
        /// Media the send was attempted on
        media: MediaType,
        /// Frame length
        len: usize,
        /// Media limit
        max: usize,
    },

    /// The remote end did not acknowledge the frame
    #[error("No acknowledgment from {0}")]
    NoAck(MacAddress),

    /// Media not handled by this driver
    #[error("Media not supported: {0}")]
    Unsupported(MediaType),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A frame handed up by a driver.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Who sent it, as far as the driver can tell
    pub sender: SenderId,
    /// Media it arrived on
    pub media: MediaType,
    /// Raw frame bytes
    pub bytes: Vec<u8>,
    /// Ask the dispatcher to verify the frame CRC. Drivers whose hardware
    /// already checks integrity leave this off.
    pub check_crc: bool,
}

impl Inbound {
    /// Frame from `sender` on `media`, CRC to be checked by the receiver
    pub fn new(sender: SenderId, media: MediaType, bytes: Vec<u8>) -> Self {
        Self {
            sender,
            media,
            bytes,
            check_crc: true,
        }
    }
}

/// Driver interface consumed by the dispatcher.
///
/// Drivers deliver inbound frames through [`Transport::poll`]; byte-oriented
/// drivers drain their receive buffers there on every queue iteration.
pub trait Transport: Send + Sync {
    /// Media this driver operates
    fn media(&self) -> MediaType;

    /// Send one frame to `to` on `media`.
    ///
    /// # Errors
    /// Returns `TransportError` if the frame could not be delivered, and
    /// [`TransportError::Unsupported`] for a media this driver does not carry.
    /// The caller counts the failure against the peer/media pair.
    fn send(&self, to: &MacAddress, media: MediaType, bytes: &[u8]) -> TransportResult<()>;

    /// Drain pending inbound frames into `sink`. Returns how many were delivered.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive path is broken.
    fn poll(&self, sink: &mut dyn FnMut(Inbound)) -> TransportResult<usize>;

    /// Whether this driver can carry `media`.
    fn supports(&self, media: MediaType) -> bool {
        media == self.media()
    }

    /// Largest frame the media accepts in one send. The dispatcher skips
    /// drivers that cannot carry a frame.
    fn max_frame_len(&self) -> usize {
        usize::MAX
    }

    /// Throughput last measured towards `to` (bytes/s), if the driver knows it
    fn observed_bps(&self, _to: &MacAddress) -> Option<u32> {
        None
    }

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub frames_sent: u64,
    /// Total frames received
    pub frames_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.frames_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
