//! Conversation tracking: ties requests to their asynchronous replies.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{Result, SdpError};
use crate::peer::PeerHandle;

/// Who started a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Opened by this node; id allocated locally
    Local,
    /// Opened by the peer; id supplied in its frame
    Remote(u16),
}

/// One open exchange with a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Conversation id
    pub id: u16,
    /// Peer on the other end
    pub peer: PeerHandle,
    /// Free-text tag
    pub reason: String,
    /// True if this node opened it
    pub local: bool,
}

#[derive(Debug)]
struct Inner {
    open: Vec<Conversation>,
    next_id: u16,
}

impl Inner {
    fn position(&self, peer: PeerHandle, id: u16) -> Option<usize> {
        self.open.iter().position(|c| c.peer == peer && c.id == id)
    }

    fn remove_where(&mut self, peer: PeerHandle, id: u16, keep: impl Fn(&Conversation) -> bool) -> Result<Conversation> {
        match self.position(peer, id).filter(|pos| keep(&self.open[*pos])) {
            Some(pos) => {
                let conv = self.open.swap_remove(pos);
                debug!("Closed conversation {} with peer {}", id, peer);
                Ok(conv)
            }
            None => {
                warn!("Close of unknown conversation {} with peer {}", id, peer);
                Err(SdpError::ConvQueueError { peer, id })
            }
        }
    }

    /// Next local id: monotonic, never 0, skipping ids live for this peer
    fn allocate(&mut self, peer: PeerHandle) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if self.position(peer, id).is_none() {
                return Some(id);
            }
        }
        None
    }
}

/// Open conversations behind a single lock
#[derive(Debug)]
pub struct ConversationTracker {
    inner: Mutex<Inner>,
    lock_timeout: Duration,
}

impl ConversationTracker {
    /// Empty tracker with the given lock acquisition bound
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                open: Vec::new(),
                next_id: 1,
            }),
            lock_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .try_lock_for(self.lock_timeout)
            .ok_or(SdpError::lock_timeout("conversation list"))
    }

    /// Open a conversation and return its id.
    ///
    /// A remote id that is already open for the peer as a remote conversation
    /// is reused (retransmitted request).
    ///
    /// # Errors
    /// - [`SdpError::ConvQueueError`] if a remote id collides with a live
    ///   local conversation, or the local id space is exhausted for the peer
    /// - [`SdpError::LockTimeout`]
    pub fn open(&self, peer: PeerHandle, reason: &str, origin: Origin) -> Result<u16> {
        let mut inner = self.lock()?;

        let id = match origin {
            Origin::Local => inner
                .allocate(peer)
                .ok_or(SdpError::ConvQueueError { peer, id: 0 })?,
            Origin::Remote(id) => {
                if let Some(pos) = inner.position(peer, id) {
                    if inner.open[pos].local {
                        warn!("Peer {} reused id {} of a local conversation", peer, id);
                        return Err(SdpError::ConvQueueError { peer, id });
                    }
                    return Ok(id);
                }
                id
            }
        };

        inner.open.push(Conversation {
            id,
            peer,
            reason: reason.to_string(),
            local: origin == Origin::Local,
        });
        debug!("Opened conversation {} with peer {} ({})", id, peer, reason);
        Ok(id)
    }

    /// Look up an open conversation
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn find(&self, peer: PeerHandle, id: u16) -> Result<Option<Conversation>> {
        let inner = self.lock()?;
        Ok(inner.position(peer, id).map(|pos| inner.open[pos].clone()))
    }

    /// Close a conversation.
    ///
    /// # Errors
    /// Returns [`SdpError::ConvQueueError`] if it is not open, which includes
    /// closing it a second time.
    pub fn close(&self, peer: PeerHandle, id: u16) -> Result<Conversation> {
        self.lock()?.remove_where(peer, id, |_| true)
    }

    /// Close a conversation only if this node opened it, as when its reply
    /// arrives.
    ///
    /// # Errors
    /// Returns [`SdpError::ConvQueueError`] if no local conversation `id` is
    /// open with `peer`.
    pub fn close_local(&self, peer: PeerHandle, id: u16) -> Result<Conversation> {
        self.lock()?.remove_where(peer, id, |c| c.local)
    }

    /// Close a conversation only if the peer opened it, as when it has been
    /// answered.
    ///
    /// # Errors
    /// Returns [`SdpError::ConvQueueError`] if no remote conversation `id` is
    /// open with `peer`.
    pub fn close_remote(&self, peer: PeerHandle, id: u16) -> Result<Conversation> {
        self.lock()?.remove_where(peer, id, |c| !c.local)
    }

    /// Close everything open with `peer`; returns how many were dropped
    ///
    /// # Errors
    /// Returns [`SdpError::LockTimeout`].
    pub fn close_all(&self, peer: PeerHandle) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.open.len();
        inner.open.retain(|c| c.peer != peer);
        Ok(before - inner.open.len())
    }

    /// Number of open conversations
    pub fn len(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// True when nothing is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConversationTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P1: PeerHandle = PeerHandle::from_raw(1);
    const P2: PeerHandle = PeerHandle::from_raw(2);

    #[test]
    fn test_local_ids_are_monotonic() {
        let tracker = ConversationTracker::default();
        let a = tracker.open(P1, "read", Origin::Local).unwrap();
        let b = tracker.open(P1, "write", Origin::Local).unwrap();
        let c = tracker.open(P2, "read", Origin::Local).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_remote_id_accepted_and_reused() {
        let tracker = ConversationTracker::default();
        assert_eq!(tracker.open(P1, "req", Origin::Remote(900)).unwrap(), 900);
        assert_eq!(tracker.open(P1, "req", Origin::Remote(900)).unwrap(), 900);
        assert_eq!(tracker.len(), 1);

        let conv = tracker.find(P1, 900).unwrap().unwrap();
        assert!(!conv.local);
        assert_eq!(conv.reason, "req");
    }

    #[test]
    fn test_remote_collision_with_local() {
        let tracker = ConversationTracker::default();
        let id = tracker.open(P1, "mine", Origin::Local).unwrap();
        assert!(matches!(
            tracker.open(P1, "theirs", Origin::Remote(id)),
            Err(SdpError::ConvQueueError { .. })
        ));
        // same id with a different peer is fine
        assert!(tracker.open(P2, "theirs", Origin::Remote(id)).is_ok());
    }

    #[test]
    fn test_close_twice_errors() {
        let tracker = ConversationTracker::default();
        let id = tracker.open(P1, "once", Origin::Local).unwrap();
        assert_eq!(tracker.close(P1, id).unwrap().id, id);
        assert!(matches!(
            tracker.close(P1, id),
            Err(SdpError::ConvQueueError { id: i, .. }) if i == id
        ));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_close_is_per_peer() {
        let tracker = ConversationTracker::default();
        let id = tracker.open(P1, "x", Origin::Local).unwrap();
        assert!(tracker.close(P2, id).is_err());
        assert!(tracker.find(P1, id).unwrap().is_some());
    }

    #[test]
    fn test_local_allocation_skips_zero_and_live_ids() {
        let tracker = ConversationTracker::default();
        tracker.inner.lock().next_id = u16::MAX;
        assert_eq!(tracker.open(P1, "a", Origin::Local).unwrap(), u16::MAX);
        // wraps past 0
        assert_eq!(tracker.open(P1, "b", Origin::Local).unwrap(), 1);

        tracker.open(P1, "c", Origin::Remote(2)).unwrap();
        assert_eq!(tracker.open(P1, "d", Origin::Local).unwrap(), 3);
    }

    #[test]
    fn test_close_respects_origin() {
        let tracker = ConversationTracker::default();
        let mine = tracker.open(P1, "mine", Origin::Local).unwrap();
        tracker.open(P1, "theirs", Origin::Remote(500)).unwrap();

        assert!(tracker.close_remote(P1, mine).is_err());
        assert!(tracker.close_local(P1, 500).is_err());
        assert_eq!(tracker.len(), 2);

        assert!(tracker.close_remote(P1, 500).unwrap().reason == "theirs");
        assert!(tracker.close_local(P1, mine).unwrap().local);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_close_all() {
        let tracker = ConversationTracker::default();
        tracker.open(P1, "a", Origin::Local).unwrap();
        tracker.open(P1, "b", Origin::Local).unwrap();
        tracker.open(P2, "c", Origin::Local).unwrap();
        assert_eq!(tracker.close_all(P1).unwrap(), 2);
        assert_eq!(tracker.len(), 1);
    }
}
