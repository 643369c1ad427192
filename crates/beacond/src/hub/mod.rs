//! Subscriber registry and fan-out engine.
//!
//! The hub tracks every open subscriber connection and delivers each
//! published frame to all of them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   publish()   ┌──────────────────────────────┐
//! │  Broadcast loop  │──────────────▶│             Hub              │
//! │ (single writer)  │               │  Mutex<HashMap<id, sender>>  │
//! └──────────────────┘               └──────────────┬───────────────┘
//!                                                   │ mpsc (per subscriber)
//!                                                   ▼
//!                                    ┌──────────────────────────────┐
//!                                    │  Subscription (per client)   │
//!                                    │  owned by the SSE response   │
//!                                    └──────────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! - The registry lock is never held across an `.await`. `publish` clones a
//!   snapshot of the senders under the lock and writes outside it.
//! - Each subscriber has exactly one ordered channel and only the broadcast
//!   loop writes to it, so frames never interleave on a connection.
//! - A write that fails or exceeds the write timeout closes that subscriber
//!   only; the rest of the fan-out continues.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned registry lock is recovered, the map is still consistent
//!   because no code path panics while holding it

mod subscriber;

pub use subscriber::{SubscriberId, Subscription};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use beacon_core::{Frame, FrameError, Message};

use subscriber::Subscriber;

// ============================================================================
// Errors
// ============================================================================

/// Errors when registering a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("Hub is shutting down")]
    ShuttingDown,

    #[error("Too many subscribers (max: {max})")]
    TooManySubscribers { max: usize },
}

/// Errors when publishing a message.
///
/// Per-subscriber delivery failures are not errors; they only reduce the
/// delivered count.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("Malformed message: {0}")]
    Frame(#[from] FrameError),
}

// ============================================================================
// Configuration
// ============================================================================

/// Limits applied by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    /// Frames buffered per subscriber
    pub subscriber_buffer: usize,

    /// Maximum concurrent subscribers
    pub max_subscribers: usize,

    /// Per-subscriber write timeout
    pub write_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 32,
            max_subscribers: 1024,
            write_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&beacon_core::BeaconConfig> for HubSettings {
    fn from(config: &beacon_core::BeaconConfig) -> Self {
        Self {
            subscriber_buffer: config.subscriber_buffer,
            max_subscribers: config.max_subscribers,
            write_timeout: config.write_timeout(),
        }
    }
}

/// How the subscriber connections ended during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberShutdown {
    /// Subscribers registered when shutdown began
    pub closed: usize,

    /// Streams still open at the deadline and force-closed
    pub forced: usize,
}

impl SubscriberShutdown {
    pub fn is_graceful(&self) -> bool {
        self.forced == 0
    }
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Default)]
struct Registry {
    next_id: u64,
    closed: bool,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

/// Shared state behind every [`Hub`] clone.
pub(crate) struct HubInner {
    registry: Mutex<Registry>,
    settings: HubSettings,

    /// Tracks live subscription streams for the shutdown wait
    streams: TaskTracker,

    /// Parent of every per-subscriber close token
    force_close: CancellationToken,
}

impl HubInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a subscriber and closes its stream after buffered frames.
    pub(crate) fn remove(&self, id: SubscriberId, reason: &'static str) -> bool {
        let removed = self.registry().subscribers.remove(&id);
        match removed {
            Some(_) => {
                debug!(subscriber = %id, reason, "Removed subscriber");
                true
            }
            None => false,
        }
    }
}

/// Subscriber registry and fan-out engine.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Creates an empty hub.
    ///
    /// A zero subscriber buffer is raised to one.
    pub fn new(mut settings: HubSettings) -> Self {
        settings.subscriber_buffer = settings.subscriber_buffer.max(1);
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(Registry::default()),
                settings,
                streams: TaskTracker::new(),
                force_close: CancellationToken::new(),
            }),
        }
    }

    /// Registers a new subscriber connection.
    ///
    /// # Errors
    ///
    /// - `HubError::ShuttingDown` once [`shutdown`](Self::shutdown) started
    /// - `HubError::TooManySubscribers` at capacity
    pub fn subscribe(&self) -> Result<Subscription, HubError> {
        let (sender, receiver) = mpsc::channel(self.inner.settings.subscriber_buffer);
        let close = self.inner.force_close.child_token();

        let id = {
            let mut registry = self.inner.registry();
            if registry.closed {
                return Err(HubError::ShuttingDown);
            }
            if registry.subscribers.len() >= self.inner.settings.max_subscribers {
                warn!(
                    max = self.inner.settings.max_subscribers,
                    "Subscriber limit reached, rejecting connection"
                );
                return Err(HubError::TooManySubscribers {
                    max: self.inner.settings.max_subscribers,
                });
            }

            registry.next_id += 1;
            let id = SubscriberId(registry.next_id);
            registry.subscribers.insert(
                id,
                Subscriber {
                    sender,
                    close: close.clone(),
                },
            );
            id
        };

        debug!(subscriber = %id, "Added subscriber");

        Ok(Subscription::new(
            id,
            receiver,
            close,
            Arc::downgrade(&self.inner),
            self.inner.streams.token(),
        ))
    }

    /// Removes a subscriber.
    ///
    /// Frames it already accepted are still delivered before its stream
    /// ends. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.remove(id, "unsubscribed")
    }

    /// Returns the ids of all registered subscribers.
    pub fn snapshot(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<_> = self.inner.registry().subscribers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().subscribers.len()
    }

    /// Returns true once shutdown has started.
    pub fn is_closed(&self) -> bool {
        self.inner.registry().closed
    }

    /// Delivers a message to every registered subscriber.
    ///
    /// The frame is built once. Each subscriber gets up to the configured
    /// write timeout to accept it; subscribers that are gone or too slow
    /// are closed and removed after the pass.
    ///
    /// Callers must not publish concurrently; the broadcast loop is the
    /// only caller in the daemon.
    ///
    /// # Errors
    ///
    /// `PublishError::Frame` if the message cannot be framed. Nothing is
    /// delivered in that case.
    pub async fn publish(&self, message: &Message) -> Result<usize, PublishError> {
        let frame = Frame::encode(message)?;

        let targets: Vec<(SubscriberId, Subscriber)> = self
            .inner
            .registry()
            .subscribers
            .iter()
            .map(|(id, sub)| (*id, sub.clone()))
            .collect();

        let write_timeout = self.inner.settings.write_timeout;
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, sub) in targets {
            match sub.sender.send_timeout(frame.clone(), write_timeout).await {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        subscriber = %id,
                        timeout_ms = write_timeout.as_millis() as u64,
                        "Subscriber too slow, closing connection"
                    );
                    failed.push((id, sub));
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(subscriber = %id, "Subscriber gone during fan-out");
                    failed.push((id, sub));
                }
            }
        }

        for (id, sub) in failed {
            sub.close.cancel();
            self.inner.remove(id, "write failed");
        }

        Ok(delivered)
    }

    /// Closes every subscriber connection.
    ///
    /// New subscriptions are refused from here on. Each stream first
    /// flushes frames it already accepted; streams still open after
    /// `grace` are force-closed.
    pub async fn shutdown(&self, grace: Duration) -> SubscriberShutdown {
        let drained: Vec<Subscriber> = {
            let mut registry = self.inner.registry();
            registry.closed = true;
            registry.subscribers.drain().map(|(_, sub)| sub).collect()
        };
        let closed = drained.len();
        // Dropping the senders ends each stream once its buffer is empty.
        drop(drained);

        info!(subscribers = closed, "Closing subscriber connections");

        self.inner.streams.close();
        if timeout(grace, self.inner.streams.wait()).await.is_ok() {
            return SubscriberShutdown { closed, forced: 0 };
        }

        let forced = self.inner.streams.len();
        warn!(
            forced,
            grace_ms = grace.as_millis() as u64,
            "Subscriber close deadline exceeded, forcing remaining connections closed"
        );
        self.inner.force_close.cancel();

        SubscriberShutdown { closed, forced }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubSettings::default())
    }
}
