//! Node wiring: one work queue per transport feeding the dispatcher, and one
//! application queue fed by the dispatcher.
//!
//! ```text
//!  driver --poll--> [transport queue] --on_receive--> Dispatcher
//!                                                        |
//!                                   application <-- [dispatch queue]
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sdp_transport::{Inbound, QueueConfig, Transport, WorkQueue};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::NodeConfig;
use crate::dispatcher::{Dispatcher, DispatcherBuilder, MessageFilter, PriorityHandler};
use crate::error::{Result, SdpError};
use crate::frame::{WorkItem, WorkType};
use crate::orchestration::{Orchestrator, PowerControl, PreSleepHook, ThreadSleep};
use crate::peer::PeerStore;

/// Application callback for queued Request, Reply and Data items
pub type MessageHandler = Box<dyn Fn(&Dispatcher, WorkItem) + Send + Sync>;

/// Assembles a [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    transports: Vec<Arc<dyn Transport>>,
    on_message: Option<MessageHandler>,
    on_priority: Option<PriorityHandler>,
    filters: Vec<(WorkType, MessageFilter)>,
    pre_sleep: Option<PreSleepHook>,
    power: Arc<dyn PowerControl>,
    clock: Arc<dyn Clock>,
}

impl NodeBuilder {
    /// Start from a configuration
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            transports: Vec::new(),
            on_message: None,
            on_priority: None,
            filters: Vec::new(),
            pre_sleep: None,
            power: Arc::new(ThreadSleep),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Add a driver
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Handler for queued items. Mandatory.
    #[must_use]
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Dispatcher, WorkItem) + Send + Sync + 'static,
    {
        self.on_message = Some(Box::new(handler));
        self
    }

    /// Handler for Priority items
    #[must_use]
    pub fn on_priority<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkItem) + Send + Sync + 'static,
    {
        self.on_priority = Some(Box::new(handler));
        self
    }

    /// Filter for Request, Reply or Data; returning true drops the item
    #[must_use]
    pub fn filter<F>(mut self, work_type: WorkType, filter: F) -> Self
    where
        F: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        self.filters.push((work_type, Box::new(filter)));
        self
    }

    /// Hook that may veto sleep
    #[must_use]
    pub fn pre_sleep<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.pre_sleep = Some(Box::new(hook));
        self
    }

    /// Host sleep primitive
    #[must_use]
    pub fn power(mut self, power: Arc<dyn PowerControl>) -> Self {
        self.power = power;
        self
    }

    /// Time source
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and wire everything. Nothing runs until [`Node::start`].
    ///
    /// # Errors
    /// - [`SdpError::InvalidConfig`] from validation
    /// - [`SdpError::InitFail`] without a message handler or transport
    pub fn build(self) -> Result<Node> {
        self.config.validate()?;
        let handler = self
            .on_message
            .ok_or(SdpError::init_fail("node has no message handler"))?;

        let peers = Arc::new(
            PeerStore::new(self.config.address()?, self.config.node.peer_capacity)
                .with_lock_timeout(Duration::from_millis(self.config.queue.lock_timeout_ms)),
        );

        let mut orchestrator = Orchestrator::new(
            self.config.orchestration_config(),
            self.clock.clone(),
            self.power,
        );
        if let Some(hook) = self.pre_sleep {
            orchestrator = orchestrator.with_pre_sleep(hook);
        }
        let orchestrator = Arc::new(orchestrator);

        // Filled in once the dispatcher exists; the queue only holds a weak ref.
        let slot: Arc<OnceLock<Weak<Dispatcher>>> = Arc::new(OnceLock::new());
        let app_queue = {
            let slot = slot.clone();
            WorkQueue::builder(self.config.queue_config("sdp-dispatch"))
                .on_work(move |item: WorkItem| {
                    match slot.get().and_then(Weak::upgrade) {
                        Some(dispatcher) => handler(&dispatcher, item),
                        None => warn!("Dispatcher gone, dropping {} item", item.work_type),
                    }
                })
                .build()?
        };

        let mut builder = DispatcherBuilder::new(self.config.dispatcher_config(), peers.clone())
            .orchestrator(orchestrator.clone())
            .clock(self.clock);
        for transport in &self.transports {
            builder = builder.transport(transport.clone());
        }
        for (work_type, filter) in self.filters {
            builder = builder.filter(work_type, filter);
        }
        if let Some(priority) = self.on_priority {
            builder = builder.on_priority(priority);
        }
        let dispatcher = Arc::new(builder.build(app_queue.clone())?);
        // The slot is private and set exactly once here.
        let _ = slot.set(Arc::downgrade(&dispatcher));

        let transport_queues = self
            .transports
            .iter()
            .map(|t| transport_queue(&self.config, t.clone(), dispatcher.clone()))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Node '{}' at {} built with {} transports",
            self.config.node.name,
            peers.local_address(),
            transport_queues.len()
        );

        Ok(Node {
            config: self.config,
            dispatcher,
            orchestrator,
            app_queue,
            transport_queues,
            threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }
}

fn transport_queue(
    config: &NodeConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
) -> Result<Arc<WorkQueue<Inbound>>> {
    let name = format!("sdp-{}", transport.media());
    // frames from one driver are handled in arrival order
    let queue_config = QueueConfig {
        multitask: false,
        max_tasks: 0,
        ..config.queue_config(&name)
    };

    let queue = WorkQueue::builder(queue_config)
        .on_poll(move |queue: &WorkQueue<Inbound>| {
            let polled = transport.poll(&mut |inbound| {
                if let Err(e) = queue.enqueue(inbound) {
                    warn!("{}: inbound frame dropped: {}", queue.name(), e);
                }
            });
            if let Err(e) = polled {
                error!("{}: poll failed: {}", queue.name(), e);
            }
        })
        .on_work(move |inbound: Inbound| {
            if let Err(e) = dispatcher.on_receive(inbound) {
                log_receive_error(&e);
            }
        })
        .build()?;
    Ok(queue)
}

fn log_receive_error(e: &SdpError) {
    match e {
        SdpError::MessageFiltered(_) => debug!("Inbound dropped: {}", e),
        e if e.is_resource() => error!("Inbound lost: {}", e),
        e => warn!("Inbound dropped: {}", e),
    }
}

/// A running SDP node
pub struct Node {
    config: NodeConfig,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    app_queue: Arc<WorkQueue<WorkItem>>,
    transport_queues: Vec<Arc<WorkQueue<Inbound>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Node {
    /// Shorthand for [`NodeBuilder::new`]
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Spawn every queue thread.
    ///
    /// # Errors
    /// [`SdpError::InitFail`] if already started or a thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SdpError::init_fail("node already started"));
        }

        let mut threads = self.threads.lock();
        let spawned = std::iter::once(self.app_queue.spawn())
            .chain(self.transport_queues.iter().map(|q| q.spawn()))
            .collect::<std::io::Result<Vec<_>>>();

        match spawned {
            Ok(handles) => {
                threads.extend(handles);
                info!("Node '{}' started ({} queues)", self.config.node.name, threads.len());
                Ok(())
            }
            Err(e) => {
                drop(threads);
                self.shutdown();
                Err(SdpError::InitFail(format!("failed to spawn queue: {e}").into()))
            }
        }
    }

    /// Stop every queue and wait for in-flight work to finish
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.orchestrator.stop();
        for queue in &self.transport_queues {
            queue.shutdown();
        }
        self.app_queue.shutdown();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Queue thread panicked");
            }
        }
        debug!("Node '{}' shut down", self.config.node.name);
    }

    /// Wait until every queue is empty and idle, up to `timeout`
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        self.transport_queues.iter().all(|q| q.wait_idle(remaining()))
            && self.app_queue.wait_idle(remaining())
    }

    /// The dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The peer store
    pub fn peers(&self) -> &Arc<PeerStore> {
        self.dispatcher.peers()
    }

    /// The orchestrator
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Configuration in use
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Application queue statistics
    pub fn queue_stats(&self) -> &sdp_transport::QueueStats {
        self.app_queue.stats()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PayloadBuilder, build_frame, parse_frame};
    use sdp_transport::{MacAddress, MediaType, MemoryBus};
    use std::sync::atomic::AtomicUsize;

    fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.queue.idle_wait_ms = 1;
        config
    }

    #[test]
    fn test_build_requires_handler() {
        let bus = MemoryBus::new();
        let result = Node::builder(config())
            .transport(bus.attach(MacAddress([2, 0, 0, 0, 0, 1]), MediaType::BusCan))
            .build();
        assert!(matches!(result, Err(SdpError::InitFail(_))));
    }

    #[test]
    fn test_build_validates_config() {
        let mut bad = config();
        bad.node.peer_capacity = 0;
        let result = Node::builder(bad).on_message(|_, _| {}).build();
        assert!(matches!(result, Err(SdpError::InvalidConfig(_))));
    }

    #[test]
    fn test_frames_flow_to_handler() {
        let bus = MemoryBus::new();
        let local = MacAddress([2, 0, 0, 0, 0, 1]);
        let remote = MacAddress([2, 0, 0, 0, 0, 9]);
        let remote_end = bus.attach(remote, MediaType::BusCan);

        let handled = Arc::new(AtomicUsize::new(0));
        let h = handled.clone();
        let node = Node::builder(config())
            .transport(bus.attach(local, MediaType::BusCan))
            .on_message(move |dispatcher, item| {
                h.fetch_add(1, Ordering::SeqCst);
                if item.work_type == WorkType::Request {
                    dispatcher.reply(&item, b"pong\0").unwrap();
                }
            })
            .build()
            .unwrap();
        node.dispatcher()
            .provision_peer("remote", remote, MediaType::BusCan.into())
            .unwrap();
        node.start().unwrap();

        let request = build_frame(WorkType::Request, 41, &PayloadBuilder::new().text("ping").build());
        remote_end.send(&local, MediaType::BusCan, &request).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut replies = Vec::new();
        while replies.is_empty() && Instant::now() < deadline {
            remote_end
                .poll(&mut |f| replies.push(parse_frame(&f.bytes).unwrap()))
                .unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        node.shutdown();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].work_type, WorkType::Reply);
        assert_eq!(replies[0].conversation_id, 41);
        assert_eq!(replies[0].field_str(0), Some("pong"));
    }

    #[test]
    fn test_start_twice_fails() {
        let bus = MemoryBus::new();
        let node = Node::builder(config())
            .transport(bus.attach(MacAddress([2, 0, 0, 0, 0, 1]), MediaType::RadioShort))
            .on_message(|_, _| {})
            .build()
            .unwrap();
        node.start().unwrap();
        assert!(node.start().is_err());
        node.shutdown();
    }
}
