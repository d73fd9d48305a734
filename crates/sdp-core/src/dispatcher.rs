//! Messaging dispatcher.
//!
//! Inbound frames from every transport land in [`Dispatcher::on_receive`],
//! which resolves the sender, then routes by work type:
//!
//! | Work type     | Action                                                  |
//! |---------------|---------------------------------------------------------|
//! | Handshake     | learn identity from "HI"/"HIR", answer "HI" with "HIR"  |
//! | Request       | filter, open remote conversation, queue                 |
//! | Reply         | filter, close the local conversation it answers, queue  |
//! | Data          | filter, queue                                           |
//! | Priority      | echo CRC32 as a Reply, then run the priority handler    |
//! | Orchestration | "WHEN" answered with "NEXT"; "NEXT" updates availability|
//! | QoS           | accepted, no action                                     |
//!
//! Frames whose driver asks for it are CRC-checked first; a mismatch is
//! counted as a failed receive on that media and the frame is dropped.
//!
//! Outbound traffic goes through [`Dispatcher::send_message`], which re-runs
//! media selection on every attempt so failures steer later attempts away
//! from a bad link.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sdp_transport::{Inbound, MacAddress, MediaMask, MediaType, SenderId, Transport, WorkQueue};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::conversation::{ConversationTracker, Origin};
use crate::error::{Result, SdpError};
use crate::frame::{PayloadBuilder, WorkItem, WorkType, build_frame, parse_frame, verify_crc};
use crate::orchestration::{OrchestrationConfig, OrchestrationLink, Orchestrator, ThreadSleep};
use crate::peer::{Availability, PeerHandle, PeerState, PeerStore, ProtocolVersion};
use crate::scorer::MediaScorer;

/// Handshake greeting
pub const HELLO: &str = "HI";
/// Handshake answer
pub const HELLO_REPLY: &str = "HIR";
/// Orchestration schedule query
pub const WHEN: &str = "WHEN";
/// Orchestration schedule answer prefix
pub const NEXT: &str = "NEXT";

/// Inspects a Request, Reply or Data item; true drops it
pub type MessageFilter = Box<dyn Fn(&WorkItem) -> bool + Send + Sync>;

/// Runs Priority items inline
pub type PriorityHandler = Box<dyn Fn(&WorkItem) + Send + Sync>;

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name announced in handshakes
    pub name: String,
    /// Send attempts per message
    pub send_attempts: u32,
    /// Version announced in handshakes
    pub version: ProtocolVersion,
    /// Lock bound for the conversation list
    pub lock_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "sdp-node".to_string(),
            send_attempts: 4,
            version: ProtocolVersion::CURRENT,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Frames handed to `on_receive`
    pub received: AtomicU64,
    /// Frames dropped for protocol errors
    pub dropped: AtomicU64,
    /// Items rejected by filters
    pub filtered: AtomicU64,
    /// Items handed to the application queue
    pub queued: AtomicU64,
    /// Priority items handled inline
    pub priority: AtomicU64,
    /// Frames sent
    pub sent: AtomicU64,
    /// Failed send attempts
    pub send_failures: AtomicU64,
}

impl DispatcherStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Assembles a [`Dispatcher`]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    peers: Arc<PeerStore>,
    transports: Vec<Arc<dyn Transport>>,
    filters: HashMap<WorkType, MessageFilter>,
    priority: Option<PriorityHandler>,
    orchestrator: Option<Arc<Orchestrator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DispatcherBuilder {
    /// Start with a config and the peer store to use
    pub fn new(config: DispatcherConfig, peers: Arc<PeerStore>) -> Self {
        Self {
            config,
            peers,
            transports: Vec::new(),
            filters: HashMap::new(),
            priority: None,
            orchestrator: None,
            clock: None,
        }
    }

    /// Add a driver
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Install a filter for Request, Reply or Data
    #[must_use]
    pub fn filter<F>(mut self, work_type: WorkType, filter: F) -> Self
    where
        F: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(work_type, Box::new(filter));
        self
    }

    /// Handler for Priority items
    #[must_use]
    pub fn on_priority<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkItem) + Send + Sync + 'static,
    {
        self.priority = Some(Box::new(handler));
        self
    }

    /// Orchestrator answering "WHEN" and notified on "NEXT"
    #[must_use]
    pub fn orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Time source for scoring and availability
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build, handing queued items to `queue`.
    ///
    /// # Errors
    /// - [`SdpError::InitFail`] with no transport
    /// - [`SdpError::InvalidConfig`] for a filter on a non-filterable type or
    ///   a zero attempt budget
    pub fn build(self, queue: Arc<WorkQueue<WorkItem>>) -> Result<Dispatcher> {
        if self.transports.is_empty() {
            return Err(SdpError::init_fail("dispatcher has no transports"));
        }
        if self.config.send_attempts == 0 {
            return Err(SdpError::invalid_config("send_attempts must be at least 1"));
        }
        if let Some(wt) = self.filters.keys().find(|wt| !wt.is_filterable()) {
            return Err(SdpError::InvalidConfig(
                format!("{wt} messages cannot be filtered").into(),
            ));
        }

        let local_media: MediaMask = MediaType::ALL
            .into_iter()
            .filter(|m| self.transports.iter().any(|t| t.supports(*m)))
            .collect();

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let orchestrator = self.orchestrator.unwrap_or_else(|| {
            Arc::new(Orchestrator::new(
                OrchestrationConfig::default(),
                clock.clone(),
                Arc::new(ThreadSleep),
            ))
        });

        info!(
            "Dispatcher '{}' ready on {} ({} transports)",
            self.config.name,
            local_media,
            self.transports.len()
        );

        Ok(Dispatcher {
            conversations: ConversationTracker::new(self.config.lock_timeout),
            scorer: MediaScorer::new(clock.clone()),
            config: self.config,
            peers: self.peers,
            transports: self.transports,
            local_media,
            queue,
            filters: self.filters,
            priority: self.priority,
            orchestrator,
            clock,
            stats: DispatcherStats::default(),
        })
    }
}

/// Routes inbound frames and sends outbound ones
pub struct Dispatcher {
    config: DispatcherConfig,
    peers: Arc<PeerStore>,
    conversations: ConversationTracker,
    scorer: MediaScorer,
    transports: Vec<Arc<dyn Transport>>,
    local_media: MediaMask,
    queue: Arc<WorkQueue<WorkItem>>,
    filters: HashMap<WorkType, MessageFilter>,
    priority: Option<PriorityHandler>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    stats: DispatcherStats,
}

impl Dispatcher {
    /// Peer store
    pub fn peers(&self) -> &Arc<PeerStore> {
        &self.peers
    }

    /// Open conversations
    pub fn conversations(&self) -> &ConversationTracker {
        &self.conversations
    }

    /// Media scorer
    pub fn scorer(&self) -> &MediaScorer {
        &self.scorer
    }

    /// Orchestrator
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Media this node can send on
    pub fn local_media(&self) -> MediaMask {
        self.local_media
    }

    /// Local hardware address
    pub fn local_address(&self) -> MacAddress {
        self.peers.local_address()
    }

    /// Counters
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Handle one frame from a driver.
    ///
    /// # Errors
    /// Protocol errors mean the frame was dropped; resource errors mean it
    /// could not be queued.
    pub fn on_receive(&self, inbound: Inbound) -> Result<()> {
        DispatcherStats::bump(&self.stats.received);

        let result = self.route(inbound);
        if let Err(e) = &result {
            if e.is_protocol() {
                DispatcherStats::bump(&self.stats.dropped);
            }
        }
        result
    }

    fn route(&self, inbound: Inbound) -> Result<()> {
        let mut item = parse_frame(&inbound.bytes)?;
        if inbound.check_crc {
            self.check_integrity(&inbound)?;
        }
        let peer = self.resolve_sender(&inbound.sender, inbound.media, item.work_type)?;
        item.media = Some(inbound.media);
        item.peer = Some(peer);
        self.peers.record_receive(peer, inbound.media, true)?;

        trace!(
            "{} from peer {} on {} (conv {}, {} bytes)",
            item.work_type,
            peer,
            inbound.media,
            item.conversation_id,
            item.payload.len()
        );

        match item.work_type {
            WorkType::Handshake => self.handle_handshake(peer, &item),
            WorkType::Request => {
                self.apply_filter(&item)?;
                let id = item.conversation_id;
                let tracked = match self.conversations.open(peer, "request", Origin::Remote(id)) {
                    Ok(_) => true,
                    Err(e) => {
                        debug!("Untracked request {} from {}: {}", id, peer, e);
                        false
                    }
                };
                let queued = self.enqueue(item);
                if queued.is_err() && tracked {
                    // nobody will answer it
                    self.conversations.close_remote(peer, id).ok();
                }
                queued
            }
            WorkType::Reply => {
                self.apply_filter(&item)?;
                // unknown ids are logged by the tracker and still delivered
                self.conversations.close_local(peer, item.conversation_id).ok();
                self.enqueue(item)
            }
            WorkType::Data => {
                self.apply_filter(&item)?;
                self.enqueue(item)
            }
            WorkType::Priority => self.handle_priority(peer, item),
            WorkType::Orchestration => self.handle_orchestration(peer, &item),
            WorkType::Qos => {
                trace!("QoS from peer {}", peer);
                Ok(())
            }
        }
    }

    /// Drop a corrupted frame, charging the failure to the sender's media
    /// when the sender is known. Unknown senders are not learned from it.
    fn check_integrity(&self, inbound: &Inbound) -> Result<()> {
        let Err(e) = verify_crc(&inbound.bytes) else {
            return Ok(());
        };
        let known = match &inbound.sender {
            SenderId::Relation(relation) => self.peers.find_by_relation(*relation)?,
            SenderId::Address(address) => self.peers.find_by_address(address)?,
        };
        if let Some(peer) = known {
            self.peers.record_receive(peer, inbound.media, false)?;
        }
        DispatcherStats::bump(&self.stats.dropped);
        debug!("Corrupt frame on {} from {:?}: {}", inbound.media, inbound.sender, e);
        Err(e.into())
    }

    fn resolve_sender(&self, sender: &SenderId, media: MediaType, work_type: WorkType) -> Result<PeerHandle> {
        match sender {
            SenderId::Relation(relation) => self
                .peers
                .find_by_relation(*relation)?
                .ok_or(SdpError::UnknownRelation(*relation)),
            SenderId::Address(address) => {
                if let Some(handle) = self.peers.find_by_address(address)? {
                    return Ok(handle);
                }
                let handle = self.learn_peer(*address, media)?;
                if work_type != WorkType::Handshake {
                    if let Err(e) = self.handshake(handle) {
                        warn!("Greeting new peer {} failed: {}", handle, e);
                    }
                }
                Ok(handle)
            }
        }
    }

    fn learn_peer(&self, address: MacAddress, media: MediaType) -> Result<PeerHandle> {
        let short = format!("peer-{}", hex::encode(&address.as_bytes()[3..]));
        let handle = match self.peers.add(&short, address, media.into()) {
            Err(SdpError::PeerExists(_)) if self.peers.find_by_address(&address)?.is_none() => {
                let full = format!("peer-{}", hex::encode(address.as_bytes()));
                self.peers.add(&full, address, media.into())?
            }
            other => other?,
        };
        info!("Learned peer {} at {} on {}", handle, address, media);
        Ok(handle)
    }

    fn apply_filter(&self, item: &WorkItem) -> Result<()> {
        if let Some(filter) = self.filters.get(&item.work_type) {
            if filter(item) {
                DispatcherStats::bump(&self.stats.filtered);
                debug!("Filtered {} conv {}", item.work_type, item.conversation_id);
                return Err(SdpError::MessageFiltered(item.work_type));
            }
        }
        Ok(())
    }

    fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.queue.enqueue(item)?;
        DispatcherStats::bump(&self.stats.queued);
        Ok(())
    }

    fn handle_handshake(&self, peer: PeerHandle, item: &WorkItem) -> Result<()> {
        let answer = match item.field_str(0) {
            Some(HELLO) => true,
            Some(HELLO_REPLY) => false,
            _ => return Err(SdpError::invalid_payload("handshake without HI/HIR tag")),
        };

        let name = item.field_str(1).filter(|n| !n.is_empty());
        let mut media = item
            .field_str(2)
            .and_then(|s| s.parse::<u8>().ok())
            .map(MediaMask::from_bits)
            .unwrap_or_default();
        if let Some(arrived) = item.media {
            media.insert(arrived);
        }
        let version = item
            .field_str(3)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        self.peers.update_identity(peer, name, media, version)?;

        if answer {
            let payload = self.hello_payload(HELLO_REPLY);
            self.send(peer, WorkType::Handshake, item.conversation_id, &payload)?;
        }
        Ok(())
    }

    fn handle_priority(&self, peer: PeerHandle, item: WorkItem) -> Result<()> {
        DispatcherStats::bump(&self.stats.priority);
        let receipt = PayloadBuilder::new().field(&item.crc.to_be_bytes()).build();
        let echoed = self.send(peer, WorkType::Reply, item.conversation_id, &receipt);
        if let Err(e) = &echoed {
            warn!("Priority receipt to peer {} failed: {}", peer, e);
        }

        if let Some(handler) = &self.priority {
            handler(&item);
        }
        echoed.map(|_| ())
    }

    fn handle_orchestration(&self, peer: PeerHandle, item: &WorkItem) -> Result<()> {
        let text = item
            .field_str(0)
            .ok_or(SdpError::invalid_payload("orchestration payload is not text"))?;

        if text == WHEN {
            let (until_us, awake_us) = self.orchestrator.next_window();
            let payload = PayloadBuilder::new()
                .text(&format!("{NEXT}|{until_us}|{awake_us}"))
                .build();
            self.send(peer, WorkType::Orchestration, item.conversation_id, &payload)?;
            return Ok(());
        }

        let (until_us, awake_us) = parse_next(text)
            .ok_or(SdpError::invalid_payload("orchestration payload is neither WHEN nor NEXT"))?;
        let now = self.clock.now_us();
        self.peers.set_availability(
            peer,
            Availability {
                next_us: now.saturating_add(until_us),
                awake_us,
                updated_us: now,
            },
        )?;
        debug!("Peer {} awake in {}us for {}us", peer, until_us, awake_us);
        self.orchestrator.notify_next();
        Ok(())
    }

    fn hello_payload(&self, tag: &str) -> Vec<u8> {
        PayloadBuilder::new()
            .text(tag)
            .text(&self.config.name)
            .number(u64::from(self.local_media.bits()))
            .text(&self.config.version.to_string())
            .build()
    }

    /// Driver able to carry a `len`-byte frame on `media`
    fn carrier(&self, media: MediaType, len: usize) -> Option<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.supports(media) && t.max_frame_len() >= len)
    }

    /// Send a framed message, up to the attempt budget. Media selection is
    /// re-run before each attempt and every failure is recorded against the
    /// chosen media. Media whose driver cannot carry the frame are skipped.
    ///
    /// # Errors
    /// - [`SdpError::NoMedia`] if no media shared with the peer can carry it
    /// - [`SdpError::SendFail`] once every attempt failed
    pub fn send_message(&self, peer: PeerHandle, bytes: &[u8]) -> Result<MediaType> {
        let attempts = self.config.send_attempts;
        let usable: MediaMask = self
            .local_media
            .iter()
            .filter(|m| self.carrier(*m, bytes.len()).is_some())
            .collect();

        for attempt in 1..=attempts {
            let (media, address) = self.peers.with_peer_mut(peer, |p| {
                (self.scorer.select_media(p, bytes.len(), usable), p.address)
            })?;
            let media = media.ok_or(SdpError::NoMedia(peer))?;
            let transport = self
                .carrier(media, bytes.len())
                .ok_or(SdpError::NoMedia(peer))?;

            match transport.send(&address, media, bytes) {
                Ok(()) => {
                    self.peers.record_send(peer, media, true)?;
                    if let Some(bps) = transport.observed_bps(&address) {
                        self.peers.record_throughput(peer, media, bps)?;
                    }
                    DispatcherStats::bump(&self.stats.sent);
                    trace!("Sent {} bytes to peer {} on {}", bytes.len(), peer, media);
                    return Ok(media);
                }
                Err(e) => {
                    DispatcherStats::bump(&self.stats.send_failures);
                    warn!(
                        "Send to peer {} on {} failed (attempt {}/{}): {}",
                        peer, media, attempt, attempts, e
                    );
                    self.peers.record_send(peer, media, false)?;
                }
            }
        }

        Err(SdpError::SendFail { peer, attempts })
    }

    /// Frame and send one message
    ///
    /// # Errors
    /// As [`Dispatcher::send_message`].
    pub fn send(&self, peer: PeerHandle, work_type: WorkType, conversation_id: u16, payload: &[u8]) -> Result<MediaType> {
        self.send_message(peer, &build_frame(work_type, conversation_id, payload))
    }

    /// Open a local conversation and send its first message. The conversation
    /// is closed again if the send fails.
    ///
    /// # Errors
    /// Returns the send failure ([`SdpError::SendFail`] when attempts ran
    /// out) or a conversation tracker error.
    pub fn start_conversation(&self, peer: PeerHandle, work_type: WorkType, reason: &str, payload: &[u8]) -> Result<u16> {
        let id = self.conversations.open(peer, reason, Origin::Local)?;
        match self.send(peer, work_type, id, payload) {
            Ok(media) => {
                debug!("Conversation {} with peer {} started on {}", id, peer, media);
                Ok(id)
            }
            Err(e) => {
                self.conversations.close_local(peer, id).ok();
                Err(e)
            }
        }
    }

    /// Answer a received item on its conversation. Answering a Request ends
    /// the peer-initiated conversation whether or not the answer got through;
    /// a local conversation sharing the id is left open.
    ///
    /// # Errors
    /// [`SdpError::InvalidPayload`] if the item has no sender, else the send failure.
    pub fn reply(&self, item: &WorkItem, payload: &[u8]) -> Result<()> {
        let peer = item
            .peer
            .ok_or(SdpError::invalid_payload("work item has no sender"))?;
        let sent = self.send(peer, WorkType::Reply, item.conversation_id, payload);
        if item.work_type == WorkType::Request {
            self.conversations.close_remote(peer, item.conversation_id).ok();
        }
        sent.map(|_| ())
    }

    /// Add a peer from configuration. No handshake is sent.
    ///
    /// # Errors
    /// As [`PeerStore::add`].
    pub fn provision_peer(&self, name: &str, address: MacAddress, media: MediaMask) -> Result<PeerHandle> {
        let handle = self.peers.add(name, address, media)?;
        self.peers.with_peer_mut(handle, |p| {
            p.provisioned = true;
            p.state = PeerState::KnownInsecure;
        })?;
        Ok(handle)
    }

    /// Forget a peer and everything open with it
    ///
    /// # Errors
    /// [`SdpError::PeerNotFound`] for an unknown handle.
    pub fn remove_peer(&self, peer: PeerHandle) -> Result<()> {
        self.peers.remove(peer)?;
        let dropped = self.conversations.close_all(peer)?;
        if dropped > 0 {
            debug!("Dropped {} conversations with removed peer {}", dropped, peer);
        }
        Ok(())
    }

    /// Send "HI" to a peer
    ///
    /// # Errors
    /// The send failure.
    pub fn handshake(&self, peer: PeerHandle) -> Result<()> {
        let payload = self.hello_payload(HELLO);
        self.send(peer, WorkType::Handshake, 0, &payload).map(|_| ())
    }
}

impl OrchestrationLink for Dispatcher {
    fn send_when(&self, peer: PeerHandle) -> Result<()> {
        let payload = PayloadBuilder::new().text(WHEN).build();
        self.send(peer, WorkType::Orchestration, 0, &payload).map(|_| ())
    }

    fn availability(&self, peer: PeerHandle) -> Option<Availability> {
        self.peers.with_peer(peer, |p| p.availability).ok().flatten()
    }
}

/// "NEXT|<until>|<awake>" into its two numbers
fn parse_next(text: &str) -> Option<(u64, u64)> {
    let mut parts = text.split('|');
    if parts.next()? != NEXT {
        return None;
    }
    let until = parts.next()?.parse().ok()?;
    let awake = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((until, awake))
}
