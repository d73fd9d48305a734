//! Peer store: a fixed-capacity pool of known remote nodes.
//!
//! Peers live in a slot arena allocated once at startup. Everything outside the
//! store refers to a peer by [`PeerHandle`]; handles come from a monotonic
//! counter and are never reused, so a stale handle simply stops resolving.
//!
//! All peer state, including the per-media statistics the scorer reads and
//! writes, sits behind one lock. Drivers reporting send/receive outcomes and
//! the scorer therefore serialize on the same critical section.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use sdp_transport::{MacAddress, MediaMask, MediaType};
use tracing::{debug, info, trace};

use crate::error::{Result, SdpError};
use crate::frame::crc32_be;
use crate::scorer::MediaProfile;

/// Longest accepted peer name in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Failure-rate history length per media
pub const HISTORY_LEN: usize = 10;

/// Stable reference to a peer in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u32);

impl PeerHandle {
    /// Raw handle value
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Rebuild a handle from its raw value
    pub const fn from_raw(raw: u32) -> Self {
        PeerHandle(raw)
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Trust level of a peer. Secure is tracked but never established here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Seen, identity not exchanged
    #[default]
    Unknown,
    /// Identity exchanged in the clear
    KnownInsecure,
    /// Identity authenticated
    KnownSecure,
}

/// Protocol version announced by a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ProtocolVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl ProtocolVersion {
    /// Version spoken by this implementation
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid version: {s}"))?;
        Ok(ProtocolVersion {
            major: major.parse().map_err(|_| format!("invalid version: {s}"))?,
            minor: minor.parse().map_err(|_| format!("invalid version: {s}"))?,
        })
    }
}

/// When a peer will next be listening, in local clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    /// Start of the peer's next awake window (µs since local boot)
    pub next_us: u64,
    /// How long that window lasts (µs)
    pub awake_us: u64,
    /// When this was learned (µs since local boot)
    pub updated_us: u64,
}

/// Link quality bookkeeping for one peer on one media
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStats {
    history: [f32; HISTORY_LEN],
    head: usize,
    filled: usize,
    /// Successful sends since the last score
    pub send_ok: u32,
    /// Failed sends since the last score
    pub send_fail: u32,
    /// Successful receives since the last score
    pub recv_ok: u32,
    /// Failed receives since the last score
    pub recv_fail: u32,
    /// Previous score, if any
    pub last_score: Option<f32>,
    /// When `last_score` was computed
    pub last_score_us: u64,
    /// Nominal media throughput (bytes/s)
    pub theoretical_bps: u32,
    /// Last throughput reported by the driver (bytes/s)
    pub observed_bps: u32,
}

impl MediaStats {
    /// Fresh statistics with no history
    pub fn new(theoretical_bps: u32) -> Self {
        Self {
            history: [0.0; HISTORY_LEN],
            head: 0,
            filled: 0,
            send_ok: 0,
            send_fail: 0,
            recv_ok: 0,
            recv_fail: 0,
            last_score: None,
            last_score_us: 0,
            theoretical_bps,
            observed_bps: 0,
        }
    }

    /// Failures since the last reset
    pub fn failures(&self) -> u32 {
        self.send_fail.saturating_add(self.recv_fail)
    }

    /// Successes since the last reset
    pub fn successes(&self) -> u32 {
        self.send_ok.saturating_add(self.recv_ok)
    }

    /// failures / (failures + successes); 0 with no attempts
    pub fn current_failure_rate(&self) -> f32 {
        let failures = self.failures();
        let total = failures.saturating_add(self.successes());
        if total == 0 {
            0.0
        } else {
            failures as f32 / total as f32
        }
    }

    /// Push a rate into the ring buffer, evicting the oldest when full
    pub fn push_failure_rate(&mut self, rate: f32) {
        self.history[self.head] = rate.clamp(0.0, 1.0);
        self.head = (self.head + 1) % HISTORY_LEN;
        self.filled = (self.filled + 1).min(HISTORY_LEN);
    }

    /// Mean of the recorded rates; 0 before the first push
    pub fn average_failure_rate(&self) -> f32 {
        if self.filled == 0 {
            return 0.0;
        }
        let sum: f32 = if self.filled == HISTORY_LEN {
            self.history.iter().sum()
        } else {
            self.history[..self.filled].iter().sum()
        };
        sum / self.filled as f32
    }

    /// Number of recorded rates
    pub fn history_len(&self) -> usize {
        self.filled
    }

    /// Zero the outcome counters
    pub fn reset_counters(&mut self) {
        self.send_ok = 0;
        self.send_fail = 0;
        self.recv_ok = 0;
        self.recv_fail = 0;
    }
}

/// A remote node
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    handle: PeerHandle,
    /// Identity name
    pub name: String,
    /// Hardware address
    pub address: MacAddress,
    /// Protocol version announced in the handshake
    pub version: ProtocolVersion,
    /// Shared id derived from both addresses
    pub relation_id: u32,
    /// Trust level
    pub state: PeerState,
    /// Next listening window, once announced
    pub availability: Option<Availability>,
    /// Added by configuration rather than discovered
    pub provisioned: bool,
    media: MediaMask,
    stats: [Option<MediaStats>; 7],
}

impl Peer {
    fn new(handle: PeerHandle, name: String, address: MacAddress, media: MediaMask, local: MacAddress) -> Self {
        let mut peer = Self {
            handle,
            name,
            address,
            version: ProtocolVersion::default(),
            relation_id: relation_id(&local, &address),
            state: PeerState::Unknown,
            availability: None,
            provisioned: false,
            media: MediaMask::EMPTY,
            stats: Default::default(),
        };
        peer.set_media(media);
        peer
    }

    /// Handle of this peer
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    /// Media the peer supports
    pub fn media(&self) -> MediaMask {
        self.media
    }

    /// Replace the supported media. Stats for dropped media are discarded;
    /// new media start fresh.
    pub fn set_media(&mut self, media: MediaMask) {
        for m in MediaType::ALL {
            let slot = &mut self.stats[media_index(m)];
            if media.contains(m) {
                if slot.is_none() {
                    *slot = Some(MediaStats::new(MediaProfile::for_media(m).theoretical_bps));
                }
            } else {
                *slot = None;
            }
        }
        self.media = media;
    }

    /// Statistics for one media
    pub fn stats(&self, media: MediaType) -> Option<&MediaStats> {
        self.stats[media_index(media)].as_ref()
    }

    /// Mutable statistics for one media
    pub fn stats_mut(&mut self, media: MediaType) -> Option<&mut MediaStats> {
        self.stats[media_index(media)].as_mut()
    }
}

const fn media_index(media: MediaType) -> usize {
    media.bit().trailing_zeros() as usize
}

/// Symmetric 32-bit id for a pair of addresses
pub fn relation_id(a: &MacAddress, b: &MacAddress) -> u32 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 12];
    buf[..6].copy_from_slice(lo.as_bytes());
    buf[6..].copy_from_slice(hi.as_bytes());
    crc32_be(&buf)
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Option<Peer>>,
    next_handle: u32,
}

impl Slots {
    fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.slots.iter().flatten()
    }

    fn get(&self, handle: PeerHandle) -> Option<&Peer> {
        self.iter().find(|p| p.handle == handle)
    }

    fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.slots.iter_mut().flatten().find(|p| p.handle == handle)
    }
}

/// Fixed-capacity pool of peers
#[derive(Debug)]
pub struct PeerStore {
    local: MacAddress,
    capacity: usize,
    lock_timeout: Duration,
    inner: Mutex<Slots>,
}

impl PeerStore {
    /// Default lock acquisition bound
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Allocate a pool of `capacity` slots for the node at `local`
    pub fn new(local: MacAddress, capacity: usize) -> Self {
        Self {
            local,
            capacity,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
            inner: Mutex::new(Slots {
                slots: (0..capacity).map(|_| None).collect(),
                next_handle: 1,
            }),
        }
    }

    /// Override the lock acquisition bound
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.inner
            .try_lock_for(self.lock_timeout)
            .ok_or(SdpError::lock_timeout("peer store"))
    }

    /// Address of the local node
    pub fn local_address(&self) -> MacAddress {
        self.local
    }

    /// Pool size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live peers
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.iter().count())
    }

    /// True when no peer is stored
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Add a peer.
    ///
    /// # Errors
    /// - [`SdpError::InvalidPeer`] for an empty or over-long name
    /// - [`SdpError::PeerExists`] if the name or address is taken
    /// - [`SdpError::OutOfMemory`] when every slot is in use or the handle
    ///   counter is spent
    pub fn add(&self, name: &str, address: MacAddress, media: MediaMask) -> Result<PeerHandle> {
        validate_name(name)?;
        let mut inner = self.lock()?;

        if inner.iter().any(|p| p.name == name) {
            return Err(SdpError::PeerExists(name.to_string()));
        }
        if inner.iter().any(|p| p.address == address) {
            return Err(SdpError::PeerExists(address.to_string()));
        }

        let Some(index) = inner.slots.iter().position(Option::is_none) else {
            return Err(SdpError::OutOfMemory {
                capacity: self.capacity,
            });
        };

        let handle = PeerHandle(inner.next_handle);
        inner.next_handle = inner.next_handle.checked_add(1).ok_or(SdpError::OutOfMemory {
            capacity: self.capacity,
        })?;
        inner.slots[index] = Some(Peer::new(handle, name.to_string(), address, media, self.local));

        info!("Added peer {} '{}' at {} ({})", handle, name, address, media);
        Ok(handle)
    }

    /// Remove a peer, returning its final state.
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] for an unknown handle.
    pub fn remove(&self, handle: PeerHandle) -> Result<Peer> {
        let mut inner = self.lock()?;
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|p| p.handle == handle))
            .ok_or(SdpError::PeerNotFound(handle))?;
        let peer = slot.take().ok_or(SdpError::PeerNotFound(handle))?;
        info!("Removed peer {} '{}'", handle, peer.name);
        Ok(peer)
    }

    /// Whether `handle` refers to a live peer
    ///
    /// # Errors
    /// The `find_by_*` lookups return [`SdpError::LockTimeout`] when the store
    /// is contended; a miss is `Ok(None)`.
    pub fn find_by_handle(&self, handle: PeerHandle) -> Result<Option<PeerHandle>> {
        self.find(|p| p.handle == handle)
    }

    /// Look up by hardware address
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn find_by_address(&self, address: &MacAddress) -> Result<Option<PeerHandle>> {
        self.find(|p| p.address == *address)
    }

    /// Look up by identity name
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn find_by_name(&self, name: &str) -> Result<Option<PeerHandle>> {
        self.find(|p| p.name == name)
    }

    /// Look up by relation id
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn find_by_relation(&self, relation: u32) -> Result<Option<PeerHandle>> {
        self.find(|p| p.relation_id == relation)
    }

    fn find(&self, pred: impl Fn(&Peer) -> bool) -> Result<Option<PeerHandle>> {
        let inner = self.lock()?;
        Ok(inner.iter().find(|p| pred(*p)).map(|p| p.handle))
    }

    /// Run `f` against a peer
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn with_peer<R>(&self, handle: PeerHandle, f: impl FnOnce(&Peer) -> R) -> Result<R> {
        let inner = self.lock()?;
        inner.get(handle).map(f).ok_or(SdpError::PeerNotFound(handle))
    }

    /// Run `f` against a peer with mutable access
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn with_peer_mut<R>(&self, handle: PeerHandle, f: impl FnOnce(&mut Peer) -> R) -> Result<R> {
        let mut inner = self.lock()?;
        inner
            .get_mut(handle)
            .map(f)
            .ok_or(SdpError::PeerNotFound(handle))
    }

    /// Copy of one peer
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn snapshot(&self, handle: PeerHandle) -> Result<Peer> {
        self.with_peer(handle, Peer::clone)
    }

    /// Copies of every live peer
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn peers(&self) -> Result<Vec<Peer>> {
        Ok(self.lock()?.iter().cloned().collect())
    }

    /// Apply identity learned from a handshake. A name already held by another
    /// peer is ignored.
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn update_identity(
        &self,
        handle: PeerHandle,
        name: Option<&str>,
        media: MediaMask,
        version: ProtocolVersion,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let name = name.filter(|n| {
            validate_name(n).is_ok() && !inner.iter().any(|p| p.handle != handle && p.name == *n)
        });
        let name = name.map(str::to_string);

        let peer = inner.get_mut(handle).ok_or(SdpError::PeerNotFound(handle))?;
        if let Some(name) = name {
            peer.name = name;
        }
        if !media.is_empty() {
            peer.set_media(media);
        }
        peer.version = version;
        if peer.state == PeerState::Unknown {
            peer.state = PeerState::KnownInsecure;
        }
        debug!(
            "Peer {} is '{}' v{} on {}",
            handle, peer.name, peer.version, peer.media
        );
        Ok(())
    }

    /// Record the outcome of a send
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn record_send(&self, handle: PeerHandle, media: MediaType, ok: bool) -> Result<()> {
        self.with_peer_mut(handle, |p| {
            if let Some(stats) = p.stats_mut(media) {
                if ok {
                    stats.send_ok = stats.send_ok.saturating_add(1);
                } else {
                    stats.send_fail = stats.send_fail.saturating_add(1);
                }
            }
        })?;
        trace!("Peer {} {} send {}", handle, media, if ok { "ok" } else { "failed" });
        Ok(())
    }

    /// Record the outcome of a receive
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn record_receive(&self, handle: PeerHandle, media: MediaType, ok: bool) -> Result<()> {
        self.with_peer_mut(handle, |p| {
            if let Some(stats) = p.stats_mut(media) {
                if ok {
                    stats.recv_ok = stats.recv_ok.saturating_add(1);
                } else {
                    stats.recv_fail = stats.recv_fail.saturating_add(1);
                }
            }
        })
    }

    /// Record throughput measured by a driver
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn record_throughput(&self, handle: PeerHandle, media: MediaType, bytes_per_sec: u32) -> Result<()> {
        self.with_peer_mut(handle, |p| {
            if let Some(stats) = p.stats_mut(media) {
                stats.observed_bps = bytes_per_sec;
            }
        })
    }

    /// Store the peer's announced next window
    ///
    /// # Errors
    /// Returns [`SdpError::PeerNotFound`] or [`SdpError::LockTimeout`].
    pub fn set_availability(&self, handle: PeerHandle, availability: Availability) -> Result<()> {
        self.with_peer_mut(handle, |p| p.availability = Some(availability))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SdpError::InvalidPeer("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SdpError::InvalidPeer(
            format!("name longer than {MAX_NAME_LEN} bytes: {name}").into(),
        ));
    }
    Ok(())
}
