//! Wake/sleep orchestration.
//!
//! A node alternates an awake window with a fixed sleep. The awake window has
//! a nominal length that work in progress may extend through
//! [`Orchestrator::ask_for_time`], up to a hard timebox of twice the nominal
//! length. A subordinate node aligns itself to a controller peer with
//! [`Orchestrator::give_control`]: it asks "WHEN", waits for "NEXT", then
//! sleeps until the controller's next window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::clock::{Clock, duration_us};
use crate::error::Result;
use crate::peer::{Availability, PeerHandle};

/// Orchestration timings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationConfig {
    /// Nominal awake window
    pub awake: Duration,
    /// Sleep between windows
    pub sleep: Duration,
    /// Extra delay after the controller's window opens
    pub wake_margin: Duration,
    /// "WHEN" attempts before giving up
    pub when_retries: u32,
    /// Wait for "NEXT" per attempt
    pub when_timeout: Duration,
    /// Sleep when the controller never answers
    pub retry_sleep: Duration,
    /// Extension requested when the pre-sleep hook vetoes
    pub veto_slice: Duration,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            awake: Duration::from_secs(5),
            sleep: Duration::from_secs(30),
            wake_margin: Duration::from_millis(50),
            when_retries: 3,
            when_timeout: Duration::from_millis(500),
            retry_sleep: Duration::from_secs(10),
            veto_slice: Duration::from_millis(500),
        }
    }
}

/// Host sleep primitive
pub trait PowerControl: Send + Sync {
    /// Put the node to sleep for `duration`
    fn sleep_for(&self, duration: Duration);
}

/// Sleeps the calling thread. Stands in for light sleep on hosts without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl PowerControl for ThreadSleep {
    fn sleep_for(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// What orchestration needs from the messaging layer
pub trait OrchestrationLink: Send + Sync {
    /// Send "WHEN" to `peer`
    ///
    /// # Errors
    /// Returns the send failure.
    fn send_when(&self, peer: PeerHandle) -> Result<()>;

    /// Latest "NEXT" information learned from `peer`
    fn availability(&self, peer: PeerHandle) -> Option<Availability>;
}

/// Called before sleeping; returning true vetoes the sleep
pub type PreSleepHook = Box<dyn Fn() -> bool + Send + Sync>;

/// Outcome of [`Orchestrator::take_control`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepReport {
    /// Time spent awake this cycle
    pub awake: Duration,
    /// Time handed to the power controller
    pub slept: Duration,
    /// Vetoes raised by the pre-sleep hook
    pub vetoes: u32,
    /// Slept despite a veto because the timebox was exhausted
    pub forced: bool,
}

/// Outcome of [`Orchestrator::give_control`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Slept until the controller's window
    Aligned {
        /// Time slept
        slept: Duration,
        /// Controller's announced awake duration
        awake: Duration,
    },
    /// No "NEXT" arrived; slept the retry interval
    NoAnswer {
        /// Time slept
        slept: Duration,
    },
}

#[derive(Debug)]
struct Window {
    start_us: u64,
    deadline_us: u64,
    cycles: u64,
}

/// Awake-window bookkeeping for one node
pub struct Orchestrator {
    config: OrchestrationConfig,
    clock: Arc<dyn Clock>,
    power: Arc<dyn PowerControl>,
    pre_sleep: Option<PreSleepHook>,
    window: Mutex<Window>,
    changed: Condvar,
    stopped: AtomicBool,
}

impl Orchestrator {
    /// Orchestrator whose first window opens now
    pub fn new(config: OrchestrationConfig, clock: Arc<dyn Clock>, power: Arc<dyn PowerControl>) -> Self {
        let now = clock.now_us();
        let awake = duration_us(config.awake);
        Self {
            config,
            clock,
            power,
            pre_sleep: None,
            window: Mutex::new(Window {
                start_us: now,
                deadline_us: now.saturating_add(awake),
                cycles: 0,
            }),
            changed: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Install the pre-sleep hook
    #[must_use]
    pub fn with_pre_sleep<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.pre_sleep = Some(Box::new(hook));
        self
    }

    /// Timings in use
    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Completed awake/sleep cycles
    pub fn cycles(&self) -> u64 {
        self.window.lock().cycles
    }

    /// Restart the current awake window at the current time
    pub fn start_window(&self) {
        let now = self.clock.now_us();
        let mut w = self.window.lock();
        w.start_us = now;
        w.deadline_us = now.saturating_add(duration_us(self.config.awake));
        self.changed.notify_all();
    }

    /// Request `extra` more awake time.
    ///
    /// Granted iff `elapsed + pending + extra < 2 * nominal awake`.
    pub fn ask_for_time(&self, extra: Duration) -> bool {
        let extra_us = duration_us(extra);
        let limit = duration_us(self.config.awake).saturating_mul(2);
        let now = self.clock.now_us();

        let mut w = self.window.lock();
        let elapsed = now.saturating_sub(w.start_us);
        let pending = w.deadline_us.saturating_sub(now);
        let total = elapsed.saturating_add(pending).saturating_add(extra_us);

        if total < limit {
            w.deadline_us = w.deadline_us.max(now).saturating_add(extra_us);
            self.changed.notify_all();
            debug!("Granted {}us extension ({}us of {}us)", extra_us, total, limit);
            true
        } else {
            debug!("Denied {}us extension ({}us >= {}us)", extra_us, total, limit);
            false
        }
    }

    /// Microseconds until this node's next awake window, and its length.
    /// This is what a "NEXT" reply advertises.
    pub fn next_window(&self) -> (u64, u64) {
        let now = self.clock.now_us();
        let remaining = self.window.lock().deadline_us.saturating_sub(now);
        (
            remaining.saturating_add(duration_us(self.config.sleep)),
            duration_us(self.config.awake),
        )
    }

    /// Run out the awake window, then sleep.
    ///
    /// Extensions granted while waiting are honored. When the budget is spent
    /// the pre-sleep hook may veto; each veto asks for one more veto slice,
    /// and once the timebox refuses the node sleeps anyway.
    pub fn take_control(&self) -> SleepReport {
        let mut vetoes = 0;
        let mut forced = false;

        loop {
            if !self.wait_for_deadline() {
                return self.report(0, vetoes, false);
            }

            let vetoed = self.pre_sleep.as_ref().is_some_and(|hook| hook());
            if !vetoed {
                break;
            }
            vetoes += 1;
            if self.ask_for_time(self.config.veto_slice) {
                debug!("Sleep vetoed, extended by {:?}", self.config.veto_slice);
                continue;
            }
            warn!("Sleep vetoed but the timebox is exhausted, sleeping anyway");
            forced = true;
            break;
        }

        let awake_us = {
            let w = self.window.lock();
            self.clock.now_us().saturating_sub(w.start_us)
        };
        info!(
            "Sleeping for {:?} after {}us awake ({} vetoes)",
            self.config.sleep, awake_us, vetoes
        );
        self.power.sleep_for(self.config.sleep);
        self.begin_cycle(self.config.awake);

        SleepReport {
            awake: Duration::from_micros(awake_us),
            slept: self.config.sleep,
            vetoes,
            forced,
        }
    }

    /// Align with `peer`'s schedule: ask "WHEN", wait for "NEXT", sleep until
    /// its window plus the wake margin. Falls back to the retry sleep when no
    /// answer arrives within the retry budget.
    ///
    /// # Errors
    /// Infallible today; send failures count as unanswered attempts.
    pub fn give_control(&self, link: &dyn OrchestrationLink, peer: PeerHandle) -> Result<Alignment> {
        for attempt in 1..=self.config.when_retries {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let asked_at = self.clock.now_us();
            if let Err(e) = link.send_when(peer) {
                warn!("WHEN to peer {} failed (attempt {}): {}", peer, attempt, e);
                continue;
            }

            let Some(availability) = self.wait_for_next(link, peer, asked_at) else {
                debug!("No NEXT from peer {} (attempt {})", peer, attempt);
                continue;
            };

            let target = availability
                .next_us
                .saturating_add(duration_us(self.config.wake_margin));
            let slept = Duration::from_micros(target.saturating_sub(self.clock.now_us()));
            let awake = Duration::from_micros(availability.awake_us);
            info!("Aligning with peer {}: sleeping {:?}", peer, slept);
            self.power.sleep_for(slept);
            self.begin_cycle(awake);
            return Ok(Alignment::Aligned { slept, awake });
        }

        warn!(
            "Peer {} never answered WHEN, sleeping {:?}",
            peer, self.config.retry_sleep
        );
        self.power.sleep_for(self.config.retry_sleep);
        self.begin_cycle(self.config.awake);
        Ok(Alignment::NoAnswer {
            slept: self.config.retry_sleep,
        })
    }

    /// Wake anyone waiting for a "NEXT"
    pub fn notify_next(&self) {
        let _w = self.window.lock();
        self.changed.notify_all();
    }

    /// Abort waits; `take_control` returns without sleeping
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _w = self.window.lock();
        self.changed.notify_all();
    }

    /// Returns false if stopped while waiting
    fn wait_for_deadline(&self) -> bool {
        let mut w = self.window.lock();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            let now = self.clock.now_us();
            if now >= w.deadline_us {
                return true;
            }
            let wait = Duration::from_micros(w.deadline_us - now);
            self.changed.wait_for(&mut w, wait);
        }
    }

    fn wait_for_next(
        &self,
        link: &dyn OrchestrationLink,
        peer: PeerHandle,
        asked_at: u64,
    ) -> Option<Availability> {
        let give_up = Instant::now() + self.config.when_timeout;
        let mut w = self.window.lock();
        loop {
            if let Some(av) = link.availability(peer) {
                if av.updated_us >= asked_at {
                    return Some(av);
                }
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            if self.changed.wait_until(&mut w, give_up).timed_out() {
                return link.availability(peer).filter(|av| av.updated_us >= asked_at);
            }
        }
    }

    fn begin_cycle(&self, awake: Duration) {
        let now = self.clock.now_us();
        let mut w = self.window.lock();
        w.start_us = now;
        w.deadline_us = now.saturating_add(duration_us(awake));
        w.cycles += 1;
    }

    fn report(&self, slept_us: u64, vetoes: u32, forced: bool) -> SleepReport {
        let w = self.window.lock();
        SleepReport {
            awake: Duration::from_micros(self.clock.now_us().saturating_sub(w.start_us)),
            slept: Duration::from_micros(slept_us),
            vetoes,
            forced,
        }
    }
}
