//! Subscriber handles.
//!
//! The registry keeps a [`Subscriber`] (the writing side) for every open
//! connection; the connection itself owns the matching [`Subscription`]
//! (the reading side). Dropping the subscription deregisters it.

use std::fmt;
use std::sync::Weak;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;

use beacon_core::Frame;

use super::HubInner;

/// Unique identifier assigned to a subscriber when it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl SubscriberId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Registry entry: the writing side of one connection.
#[derive(Clone)]
pub(crate) struct Subscriber {
    /// Frames flow through this channel, in publish order
    pub(crate) sender: mpsc::Sender<Frame>,

    /// Cancelling this ends the connection's stream immediately
    pub(crate) close: CancellationToken,
}

/// The reading side of one subscriber connection.
///
/// Yields frames in publish order until the subscriber is removed from the
/// registry (after flushing what it already accepted) or force-closed
/// (immediately).
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Frame>,
    close: CancellationToken,
    hub: Weak<HubInner>,
    _tracked: TaskTrackerToken,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriberId,
        receiver: mpsc::Receiver<Frame>,
        close: CancellationToken,
        hub: Weak<HubInner>,
        tracked: TaskTrackerToken,
    ) -> Self {
        Self {
            id,
            receiver,
            close,
            hub,
            _tracked: tracked,
        }
    }

    /// Returns this subscriber's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next frame.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            _ = self.close.cancelled() => None,
            frame = self.receiver.recv() => frame,
        }
    }

    /// Returns the token that force-closes this subscriber.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Returns true if the connection was force-closed.
    pub fn is_force_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id, "disconnected");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
