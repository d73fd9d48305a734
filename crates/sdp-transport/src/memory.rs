//! In-process loopback transport.
//!
//! A [`MemoryBus`] connects any number of [`MemoryTransport`] endpoints keyed by
//! `(address, media)`. Frames travel over crossbeam channels, so several
//! simulated nodes can run inside one process. Faults can be injected per
//! endpoint to exercise retry and scoring paths.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, trace};

use crate::media::{MacAddress, MediaType, SenderId};
use crate::transport::{Inbound, Transport, TransportError, TransportResult, TransportStats};

/// Shared medium connecting memory endpoints
#[derive(Debug, Default)]
pub struct MemoryBus {
    endpoints: Mutex<HashMap<(MacAddress, MediaType), Sender<Inbound>>>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint for `address` on `media`. Re-attaching replaces the
    /// previous endpoint, whose receiver then sees no further frames.
    pub fn attach(self: &Arc<Self>, address: MacAddress, media: MediaType) -> Arc<MemoryTransport> {
        let (tx, rx) = unbounded();
        self.endpoints.lock().insert((address, media), tx);
        debug!("Attached {} on {}", address, media);

        Arc::new(MemoryTransport {
            bus: Arc::clone(self),
            address,
            media,
            rx,
            relation_id: Mutex::new(None),
            fail_next: AtomicU32::new(0),
            corrupt_next: AtomicU32::new(0),
            link_down: AtomicBool::new(false),
            max_frame_len: AtomicUsize::new(usize::MAX),
            observed_bps: Mutex::new(None),
            stats: Mutex::new(TransportStats::new()),
        })
    }

    /// Remove an endpoint
    pub fn detach(&self, address: MacAddress, media: MediaType) {
        self.endpoints.lock().remove(&(address, media));
    }

    /// Number of attached endpoints
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    fn deliver(&self, to: MacAddress, frame: Inbound) -> TransportResult<()> {
        let endpoints = self.endpoints.lock();
        let tx = endpoints
            .get(&(to, frame.media))
            .ok_or(TransportError::Unreachable(to))?;
        tx.send(frame).map_err(|_| TransportError::Unreachable(to))
    }
}

/// One node's endpoint on a [`MemoryBus`] for a single media
#[derive(Debug)]
pub struct MemoryTransport {
    bus: Arc<MemoryBus>,
    address: MacAddress,
    media: MediaType,
    rx: Receiver<Inbound>,
    relation_id: Mutex<Option<u32>>,
    fail_next: AtomicU32,
    corrupt_next: AtomicU32,
    link_down: AtomicBool,
    max_frame_len: AtomicUsize,
    observed_bps: Mutex<Option<u32>>,
    stats: Mutex<TransportStats>,
}

impl MemoryTransport {
    /// Local address of this endpoint
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// Make the next `n` sends fail with [`TransportError::NoAck`]
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Flip a bit in the last byte of the next `n` delivered frames
    pub fn corrupt_next(&self, n: u32) {
        self.corrupt_next.store(n, Ordering::Release);
    }

    /// Drop every frame in both directions while down
    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::Release);
    }

    /// Identify outgoing frames by relation id instead of address, as
    /// bandwidth-poor media do. `None` restores address mode.
    pub fn set_relation_id(&self, relation: Option<u32>) {
        *self.relation_id.lock() = relation;
    }

    /// Limit the frame size this endpoint accepts for sending
    pub fn set_max_frame_len(&self, max: usize) {
        self.max_frame_len.store(max, Ordering::Release);
    }

    /// Throughput this endpoint reports after each send
    pub fn set_observed_bps(&self, bps: Option<u32>) {
        *self.observed_bps.lock() = bps;
    }

    fn take_injected_failure(&self) -> bool {
        take_one(&self.fail_next)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl Transport for MemoryTransport {
    fn media(&self) -> MediaType {
        self.media
    }

    fn send(&self, to: &MacAddress, media: MediaType, bytes: &[u8]) -> TransportResult<()> {
        let result = (|| {
            if media != self.media {
                return Err(TransportError::Unsupported(media));
            }
            if self.link_down.load(Ordering::Acquire) {
                return Err(TransportError::Unreachable(*to));
            }
            if self.take_injected_failure() {
                return Err(TransportError::NoAck(*to));
            }
            let max = self.max_frame_len.load(Ordering::Acquire);
            if bytes.len() > max {
                return Err(TransportError::TooLarge {
                    media: self.media,
                    len: bytes.len(),
                    max,
                });
            }

            let sender = match *self.relation_id.lock() {
                Some(relation) => SenderId::Relation(relation),
                None => SenderId::Address(self.address),
            };
            let mut frame = bytes.to_vec();
            if take_one(&self.corrupt_next) {
                if let Some(last) = frame.last_mut() {
                    *last ^= 0x01;
                }
            }
            self.bus.deliver(*to, Inbound::new(sender, self.media, frame))
        })();

        let mut stats = self.stats.lock();
        match &result {
            Ok(()) => {
                stats.record_send(bytes.len());
                trace!("{} -> {} on {}: {} bytes", self.address, to, self.media, bytes.len());
            }
            Err(e) => {
                stats.record_send_error();
                debug!("{} -> {} on {} failed: {}", self.address, to, self.media, e);
            }
        }
        result
    }

    fn poll(&self, sink: &mut dyn FnMut(Inbound)) -> TransportResult<usize> {
        let down = self.link_down.load(Ordering::Acquire);
        let mut delivered = 0;
        for frame in self.rx.try_iter() {
            if down {
                self.stats.lock().record_recv_error();
                continue;
            }
            self.stats.lock().record_recv(frame.bytes.len());
            sink(frame);
            delivered += 1;
        }
        Ok(delivered)
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len.load(Ordering::Acquire)
    }

    fn observed_bps(&self, _to: &MacAddress) -> Option<u32> {
        *self.observed_bps.lock()
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddress = MacAddress([0xA, 0, 0, 0, 0, 1]);
    const B: MacAddress = MacAddress([0xB, 0, 0, 0, 0, 2]);

    fn drain(t: &MemoryTransport) -> Vec<Inbound> {
        let mut out = Vec::new();
        t.poll(&mut |frame| out.push(frame)).unwrap();
        out
    }

    #[test]
    fn test_send_and_poll() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::BusCan);
        let b = bus.attach(B, MediaType::BusCan);
        assert_eq!(bus.endpoint_count(), 2);

        a.send(&B, MediaType::BusCan, b"hello").unwrap();
        let got = drain(&b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sender, SenderId::Address(A));
        assert_eq!(got[0].media, MediaType::BusCan);
        assert_eq!(got[0].bytes, b"hello");

        assert_eq!(a.stats().frames_sent, 1);
        assert_eq!(b.stats().bytes_received, 5);
    }

    #[test]
    fn test_media_are_isolated() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::RadioShort);
        let _b_can = bus.attach(B, MediaType::BusCan);

        let err = a.send(&B, MediaType::RadioShort, b"x").unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(addr) if addr == B));
        assert_eq!(a.stats().send_errors, 1);
    }

    #[test]
    fn test_fail_next_counts_down() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::RadioLong);
        let b = bus.attach(B, MediaType::RadioLong);

        a.fail_next(2);
        assert!(matches!(a.send(&B, MediaType::RadioLong, b"1"), Err(TransportError::NoAck(_))));
        assert!(matches!(a.send(&B, MediaType::RadioLong, b"2"), Err(TransportError::NoAck(_))));
        assert!(a.send(&B, MediaType::RadioLong, b"3").is_ok());
        assert_eq!(drain(&b).len(), 1);
    }

    #[test]
    fn test_link_down_drops_both_ways() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::BusTtl);
        let b = bus.attach(B, MediaType::BusTtl);

        a.set_link_down(true);
        assert!(a.send(&B, MediaType::BusTtl, b"x").is_err());

        b.send(&A, MediaType::BusTtl, b"y").unwrap();
        assert!(drain(&a).is_empty());
        assert_eq!(a.stats().recv_errors, 1);

        a.set_link_down(false);
        a.send(&B, MediaType::BusTtl, b"z").unwrap();
        assert_eq!(drain(&b).len(), 1);
    }

    #[test]
    fn test_relation_sender_mode() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::BusI2c);
        let b = bus.attach(B, MediaType::BusI2c);

        a.set_relation_id(Some(0xDEAD_BEEF));
        a.send(&B, MediaType::BusI2c, b"r").unwrap();
        assert_eq!(drain(&b)[0].sender, SenderId::Relation(0xDEAD_BEEF));
    }

    #[test]
    fn test_max_frame_len() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::BusCan);
        let _b = bus.attach(B, MediaType::BusCan);

        a.set_max_frame_len(8);
        assert_eq!(a.max_frame_len(), 8);
        let err = a.send(&B, MediaType::BusCan, &[0u8; 9]).unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { len: 9, max: 8, .. }));
    }

    #[test]
    fn test_wrong_media_unsupported() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::RadioShort);
        let _b = bus.attach(B, MediaType::RadioShort);

        let err = a.send(&B, MediaType::RadioMesh, b"x").unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(MediaType::RadioMesh)));
        assert!(!a.supports(MediaType::RadioMesh));
    }

    #[test]
    fn test_corrupt_next_flips_last_byte() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::BusCan);
        let b = bus.attach(B, MediaType::BusCan);

        a.corrupt_next(1);
        a.send(&B, MediaType::BusCan, &[1, 2, 3]).unwrap();
        a.send(&B, MediaType::BusCan, &[1, 2, 3]).unwrap();
        let got = drain(&b);
        assert_eq!(got[0].bytes, [1, 2, 2]);
        assert_eq!(got[1].bytes, [1, 2, 3]);
        assert!(got[0].check_crc);
    }

    #[test]
    fn test_observed_bps_reported() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::RadioLong);
        assert_eq!(a.observed_bps(&B), None);
        a.set_observed_bps(Some(2_400));
        assert_eq!(a.observed_bps(&B), Some(2_400));
    }

    #[test]
    fn test_detach() {
        let bus = MemoryBus::new();
        let a = bus.attach(A, MediaType::Cellular);
        let _b = bus.attach(B, MediaType::Cellular);
        bus.detach(B, MediaType::Cellular);
        assert!(a.send(&B, MediaType::Cellular, b"gone").is_err());
    }
}
