//! Two-node test fixture
//!
//! Node A and node B share a [`MemoryBus`] on one or more media and know
//! each other as provisioned peers. Every item either node queues for its
//! application lands in that node's inbox; node B additionally answers each
//! Request with a Reply carrying `"echo"` and the request's first field.
//!
//! # Example
//!
//! ```no_run
//! use sdp_integration_tests::fixtures::TwoNodeFixture;
//! use sdp_core::{MediaType, WorkType};
//!
//! let fx = TwoNodeFixture::new(&[MediaType::BusCan]).unwrap();
//! fx.a.dispatcher()
//!     .start_conversation(fx.b_on_a, WorkType::Request, "ping", b"hi\0")
//!     .unwrap();
//! let reply = fx.a_inbox.recv().unwrap();
//! assert_eq!(reply.field_str(0), Some("echo"));
//! ```

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use sdp_core::{
    MacAddress, MediaType, Node, NodeConfig, PayloadBuilder, PeerHandle, PowerControl, Result,
    WorkItem, WorkType,
};
use sdp_transport::{MemoryBus, MemoryTransport};

/// Node A's address
pub const ADDR_A: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x0a]);
/// Node B's address
pub const ADDR_B: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x0b]);

/// Records requested sleeps instead of sleeping
#[derive(Debug, Default)]
pub struct RecordingPower {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingPower {
    /// Every sleep requested so far
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl PowerControl for RecordingPower {
    fn sleep_for(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}

/// Fixture settings
pub struct FixtureOptions {
    /// Media both nodes attach to
    pub media: Vec<MediaType>,
    /// Base configuration; name and address are overridden per node
    pub config: NodeConfig,
    /// Provision node A on node B
    pub b_knows_a: bool,
    /// Node B drops Data items whose first field is "spam"
    pub b_filters_spam: bool,
}

impl FixtureOptions {
    /// Defaults for the given media
    pub fn new(media: &[MediaType]) -> Self {
        let mut config = NodeConfig::default();
        config.queue.idle_wait_ms = 1;
        Self {
            media: media.to_vec(),
            config,
            b_knows_a: true,
            b_filters_spam: false,
        }
    }
}

/// Two connected nodes
pub struct TwoNodeFixture {
    /// Shared medium
    pub bus: Arc<MemoryBus>,
    /// Node A
    pub a: Node,
    /// Node B
    pub b: Node,
    /// A's links, in media order
    pub a_links: Vec<Arc<MemoryTransport>>,
    /// B's links, in media order
    pub b_links: Vec<Arc<MemoryTransport>>,
    /// Items queued to A's application
    pub a_inbox: Receiver<WorkItem>,
    /// Items queued to B's application
    pub b_inbox: Receiver<WorkItem>,
    /// Priority items B handled
    pub b_priority: Receiver<WorkItem>,
    /// B as seen by A
    pub b_on_a: PeerHandle,
    /// A as seen by B, if provisioned
    pub a_on_b: Option<PeerHandle>,
    /// A's power controller
    pub a_power: Arc<RecordingPower>,
}

impl TwoNodeFixture {
    /// Started fixture with default options
    ///
    /// # Errors
    /// Any node construction failure.
    pub fn new(media: &[MediaType]) -> Result<Self> {
        Self::with_options(FixtureOptions::new(media))
    }

    /// Started fixture
    ///
    /// # Errors
    /// Any node construction failure.
    pub fn with_options(options: FixtureOptions) -> Result<Self> {
        let bus = MemoryBus::new();
        let mask = options.media.iter().copied().collect();

        let mut config_a = options.config.clone();
        config_a.node.name = "node-a".to_string();
        config_a.node.address = ADDR_A.to_string();
        let mut config_b = options.config;
        config_b.node.name = "node-b".to_string();
        config_b.node.address = ADDR_B.to_string();

        let a_links: Vec<_> = options.media.iter().map(|m| bus.attach(ADDR_A, *m)).collect();
        let b_links: Vec<_> = options.media.iter().map(|m| bus.attach(ADDR_B, *m)).collect();

        let a_power = Arc::new(RecordingPower::default());
        let (a_tx, a_inbox) = unbounded();
        let mut builder = Node::builder(config_a)
            .power(a_power.clone())
            .on_message(move |_, item| {
                let _ = a_tx.send(item);
            });
        for link in &a_links {
            builder = builder.transport(link.clone());
        }
        let a = builder.build()?;

        let (b_tx, b_inbox) = unbounded();
        let (p_tx, b_priority) = unbounded();
        let mut builder = Node::builder(config_b)
            .power(Arc::new(RecordingPower::default()))
            .on_message(move |dispatcher, item| {
                if item.work_type == WorkType::Request {
                    let payload = PayloadBuilder::new()
                        .text("echo")
                        .field(item.field(0).unwrap_or_default())
                        .build();
                    if let Err(e) = dispatcher.reply(&item, &payload) {
                        tracing::warn!("fixture echo failed: {}", e);
                    }
                }
                let _ = b_tx.send(item);
            })
            .on_priority(move |item| {
                let _ = p_tx.send(item.clone());
            });
        if options.b_filters_spam {
            builder = builder.filter(WorkType::Data, |item| item.field_str(0) == Some("spam"));
        }
        for link in &b_links {
            builder = builder.transport(link.clone());
        }
        let b = builder.build()?;

        let b_on_a = a.dispatcher().provision_peer("b", ADDR_B, mask)?;
        let a_on_b = if options.b_knows_a {
            Some(b.dispatcher().provision_peer("a", ADDR_A, mask)?)
        } else {
            None
        };

        a.start()?;
        b.start()?;

        Ok(Self {
            bus,
            a,
            b,
            a_links,
            b_links,
            a_inbox,
            b_inbox,
            b_priority,
            b_on_a,
            a_on_b,
            a_power,
        })
    }

    /// Stop both nodes
    pub fn shutdown(&self) {
        self.a.shutdown();
        self.b.shutdown();
    }
}
