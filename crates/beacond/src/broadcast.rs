//! Publish queue and broadcast loop.
//!
//! Producers submit messages through a [`Publisher`]; a single spawned
//! task (the broadcast loop) is the only consumer and calls
//! [`Hub::publish`] for each message in submission order. Having exactly
//! one consumer is what serializes fan-out.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐                 ┌────────────────┐           ┌───────┐
//! │ Console   │──┐              │                │           │       │
//! └───────────┘  │ Publisher    │ BroadcastLoop  │ publish() │  Hub  │
//!                ├─────────────▶│ (one task)     │──────────▶│       │
//! ┌───────────┐  │ mpsc (FIFO)  │                │           │       │
//! │ Other     │──┘              └────────────────┘           └───────┘
//! └───────────┘
//! ```
//!
//! # Close and drain
//!
//! [`BroadcastHandle::close`] stops the queue from accepting messages; the
//! loop keeps going until every message already buffered has been
//! published, then exits. The loop also exits when every publisher has
//! been dropped and the buffer is empty.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use beacon_core::Message;

use crate::hub::Hub;

// ============================================================================
// Errors
// ============================================================================

/// Errors when submitting a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Publish queue is closed")]
    Closed,

    #[error("Publish queue is full")]
    Full,
}

// ============================================================================
// Publisher
// ============================================================================

/// Producer handle for the publish queue.
///
/// Cheap to clone; every clone feeds the same ordered queue.
#[derive(Clone)]
pub struct Publisher {
    sender: mpsc::Sender<Message>,
}

impl Publisher {
    /// Enqueues a message, waiting for capacity if the queue is full.
    ///
    /// # Errors
    ///
    /// `QueueError::Closed` once the queue has been closed.
    pub async fn submit(&self, message: Message) -> Result<(), QueueError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Enqueues a message without waiting.
    ///
    /// # Errors
    ///
    /// - `QueueError::Full` if the queue has no free capacity
    /// - `QueueError::Closed` once the queue has been closed
    pub fn try_submit(&self, message: Message) -> Result<(), QueueError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Returns true if the queue no longer accepts messages.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

// ============================================================================
// Broadcast Loop
// ============================================================================

/// Counters reported when the broadcast loop finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Messages taken off the queue
    pub processed: u64,

    /// Frames accepted by subscribers, summed over all messages
    pub delivered: u64,

    /// Messages dropped because they could not be framed
    pub rejected: u64,
}

/// The single consumer of the publish queue.
pub struct BroadcastLoop {
    receiver: mpsc::Receiver<Message>,
    hub: Hub,
    close: CancellationToken,
    stats: BroadcastStats,
}

impl BroadcastLoop {
    /// Runs until the queue is closed and drained.
    pub async fn run(mut self) -> BroadcastStats {
        info!("Broadcast loop starting");

        let mut closing = false;
        loop {
            tokio::select! {
                biased;

                _ = self.close.cancelled(), if !closing => {
                    // Refuse new sends; buffered messages are still received.
                    self.receiver.close();
                    closing = true;
                    debug!("Publish queue closed, draining");
                }

                next = self.receiver.recv() => match next {
                    Some(message) => self.broadcast(message).await,
                    None => break,
                },
            }
        }

        info!(
            processed = self.stats.processed,
            delivered = self.stats.delivered,
            rejected = self.stats.rejected,
            "Broadcast loop stopped"
        );
        self.stats
    }

    async fn broadcast(&mut self, message: Message) {
        self.stats.processed += 1;

        match self.hub.publish(&message).await {
            Ok(delivered) => {
                self.stats.delivered += delivered as u64;
                info!(
                    message = %message.preview(),
                    delivered,
                    "Broadcast message"
                );
            }
            Err(e) => {
                self.stats.rejected += 1;
                warn!(
                    message = %message.preview(),
                    error = %e,
                    "Dropped message that could not be published"
                );
            }
        }
    }
}

/// Handle to a running broadcast loop.
pub struct BroadcastHandle {
    publisher: Publisher,
    close: CancellationToken,
    task: JoinHandle<BroadcastStats>,
}

impl BroadcastHandle {
    /// Returns a new producer handle.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Closes the publish queue. Buffered messages are still delivered.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Waits for the loop to drain and stop.
    ///
    /// Close the queue first, otherwise this waits until every publisher
    /// has been dropped.
    pub async fn drained(self) -> BroadcastStats {
        let Self { publisher, task, .. } = self;
        drop(publisher);

        match task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Broadcast loop task failed");
                BroadcastStats::default()
            }
        }
    }
}

/// Spawns the broadcast loop and returns its handle.
///
/// This function:
/// 1. Creates the bounded publish queue
/// 2. Spawns the [`BroadcastLoop`] on a tokio task
/// 3. Returns a [`BroadcastHandle`] holding the first [`Publisher`]
pub fn spawn_broadcast_loop(hub: Hub, queue_capacity: usize) -> BroadcastHandle {
    let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
    let close = CancellationToken::new();

    let broadcast_loop = BroadcastLoop {
        receiver,
        hub,
        close: close.clone(),
        stats: BroadcastStats::default(),
    };
    let task = tokio::spawn(broadcast_loop.run());

    BroadcastHandle {
        publisher: Publisher { sender },
        close,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubSettings;
    use std::time::Duration;

    fn roomy_hub() -> Hub {
        Hub::new(HubSettings {
            subscriber_buffer: 256,
            ..HubSettings::default()
        })
    }

    #[tokio::test]
    async fn test_literal_with_no_subscribers() {
        let handle = spawn_broadcast_loop(Hub::default(), 8);
        handle.publisher().submit(Message::text("hello")).await.unwrap();
        handle.close();

        let stats = handle.drained().await;
        assert_eq!(
            stats,
            BroadcastStats {
                processed: 1,
                delivered: 0,
                rejected: 0
            }
        );
    }

    #[tokio::test]
    async fn test_messages_delivered_in_submission_order() {
        let hub = roomy_hub();
        let mut sub = hub.subscribe().unwrap();
        let handle = spawn_broadcast_loop(hub, 4);
        let publisher = handle.publisher();

        for i in 0..50 {
            publisher.submit(Message::text(format!("m{i}"))).await.unwrap();
        }
        handle.close();
        let stats = handle.drained().await;
        assert_eq!(stats.processed, 50);
        assert_eq!(stats.delivered, 50);

        for i in 0..50 {
            assert_eq!(sub.recv().await.unwrap().as_str(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn test_close_drains_buffered_messages() {
        let hub = roomy_hub();
        let mut sub = hub.subscribe().unwrap();
        let handle = spawn_broadcast_loop(hub, 16);
        let publisher = handle.publisher();

        for i in 0..10 {
            publisher.try_submit(Message::text(format!("{i}"))).unwrap();
        }
        handle.close();

        let stats = handle.drained().await;
        assert_eq!(stats.processed, 10);

        let mut received = Vec::new();
        while received.len() < 10 {
            received.push(sub.recv().await.unwrap().as_str().to_string());
        }
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_submit_after_close_is_refused() {
        let hub = roomy_hub();
        let mut sub = hub.subscribe().unwrap();
        let handle = spawn_broadcast_loop(hub.clone(), 8);
        let publisher = handle.publisher();

        handle.close();
        let stats = handle.drained().await;
        assert_eq!(stats.processed, 0);

        assert!(publisher.is_closed());
        assert_eq!(
            publisher.submit(Message::text("late")).await,
            Err(QueueError::Closed)
        );
        assert_eq!(
            publisher.try_submit(Message::text("late")),
            Err(QueueError::Closed)
        );

        hub.unsubscribe(sub.id());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_stop_loop() {
        let hub = roomy_hub();
        let mut sub = hub.subscribe().unwrap();
        let handle = spawn_broadcast_loop(hub, 8);
        let publisher = handle.publisher();

        publisher.submit(Message::new(vec![0xff, 0xfe])).await.unwrap();
        publisher.submit(Message::text("after")).await.unwrap();
        handle.close();

        let stats = handle.drained().await;
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.processed, 2);
        assert_eq!(sub.recv().await.unwrap().as_str(), "after");
    }

    #[tokio::test]
    async fn test_loop_ends_when_publishers_dropped() {
        let handle = spawn_broadcast_loop(Hub::default(), 8);
        let stats = tokio::time::timeout(Duration::from_secs(1), handle.drained())
            .await
            .expect("loop should stop once no publisher remains");
        assert_eq!(stats, BroadcastStats::default());
    }

    #[tokio::test]
    async fn test_try_submit_reports_full_queue() {
        let handle = spawn_broadcast_loop(Hub::default(), 1);
        let publisher = handle.publisher();

        // The loop may already have taken the first message, so fill until full.
        let mut saw_full = false;
        for i in 0..64 {
            if publisher.try_submit(Message::text(format!("{i}"))) == Err(QueueError::Full) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }
}
