//! Lifecycle coordinator.
//!
//! Owns startup ordering and the two-phase graceful shutdown of the hub.
//!
//! ```text
//! Starting ──▶ Running ──(signal | end of input | exit)──▶ Draining ──▶ Stopped
//! ```
//!
//! Draining runs these steps in order:
//! 1. close the publish queue (no new messages accepted)
//! 2. wait for the broadcast loop to publish everything already queued
//! 3. close subscriber connections, forcing them after a grace period
//! 4. stop the listener, aborting it after a grace period
//!
//! The queue closes before the hub is torn down so no accepted message is
//! lost to a closed connection, and the listener stops before the process
//! exits; subscribers arriving in between are refused by the closed hub.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

use beacon_core::{BeaconConfig, ConfigError};

use crate::broadcast::{spawn_broadcast_loop, BroadcastHandle, BroadcastStats, Publisher};
use crate::hub::{Hub, HubSettings, SubscriberShutdown};
use crate::server::{EventServer, ListenerOutcome, ServerError, ServerHandle};

/// Lifecycle states, in the only order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What ended the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// SIGINT / SIGTERM / Ctrl+C
    Signal,

    /// The operator input stream ended
    EndOfInput,

    /// The operator typed `exit`
    ExitCommand,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Signal => "signal",
            Self::EndOfInput => "end of input",
            Self::ExitCommand => "exit command",
        };
        f.write_str(name)
    }
}

/// Startup faults. The hub never reaches `Running` after one of these.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub broadcast: BroadcastStats,
    pub subscribers: SubscriberShutdown,
    pub listener: ListenerOutcome,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// True if no step had to be forced.
    pub fn is_clean(&self) -> bool {
        self.subscribers.is_graceful() && self.listener == ListenerOutcome::Graceful
    }
}

/// Per-phase shutdown deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadlines {
    subscriber_close: Duration,
    listener: Duration,
}

/// A running hub: listener, broadcast loop and subscriber registry.
pub struct Daemon {
    hub: Hub,
    broadcaster: BroadcastHandle,
    server: ServerHandle,
    deadlines: Deadlines,
    state: watch::Sender<LifecycleState>,
}

impl Daemon {
    /// Starts the hub.
    ///
    /// Binds the listener and spawns the broadcast loop and the server
    /// task. On return the daemon is `Running`.
    ///
    /// # Errors
    ///
    /// - `StartupError::Config` if the configuration is invalid
    /// - `StartupError::Server` if the listener cannot bind
    pub async fn start(config: &BeaconConfig) -> Result<Self, StartupError> {
        let (state, _) = watch::channel(LifecycleState::Starting);
        info!(state = %LifecycleState::Starting, "Hub lifecycle");

        config.validate()?;

        let hub = Hub::new(HubSettings::from(config));
        let server = EventServer::bind(
            config.listen_addr,
            hub.clone(),
            &config.events_path,
            config.keep_alive(),
        )
        .await?;

        let broadcaster = spawn_broadcast_loop(hub.clone(), config.queue_capacity);
        let server = server.spawn();

        state.send_replace(LifecycleState::Running);
        info!(
            state = %LifecycleState::Running,
            addr = %server.local_addr(),
            path = %config.events_path,
            "Hub lifecycle"
        );

        Ok(Self {
            hub,
            broadcaster,
            server,
            deadlines: Deadlines {
                subscriber_close: config.subscriber_close_timeout(),
                listener: config.listener_shutdown_timeout(),
            },
            state,
        })
    }

    /// Returns a producer handle for the publish queue.
    pub fn publisher(&self) -> Publisher {
        self.broadcaster.publisher()
    }

    /// Returns the subscriber registry.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Runs until `trigger` resolves, then shuts down.
    pub async fn run_until<F>(self, trigger: F) -> ShutdownReport
    where
        F: std::future::Future<Output = ShutdownTrigger>,
    {
        let reason = trigger.await;
        info!(trigger = %reason, "Shutdown triggered");
        self.shutdown().await
    }

    /// Drains and stops the hub.
    ///
    /// Completes within the subscriber-close and listener deadlines once
    /// the broadcast loop has drained.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            hub,
            broadcaster,
            server,
            deadlines,
            state,
        } = self;

        let started = Instant::now();
        state.send_replace(LifecycleState::Draining);
        info!(state = %LifecycleState::Draining, "Hub lifecycle");

        broadcaster.close();
        let broadcast = broadcaster.drained().await;
        info!(
            processed = broadcast.processed,
            delivered = broadcast.delivered,
            "Publish queue drained"
        );

        let subscribers = hub.shutdown(deadlines.subscriber_close).await;
        let listener = server.stop(deadlines.listener).await;

        let report = ShutdownReport {
            broadcast,
            subscribers,
            listener,
            elapsed: started.elapsed(),
        };

        state.send_replace(LifecycleState::Stopped);
        info!(
            state = %LifecycleState::Stopped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            clean = report.is_clean(),
            "Hub lifecycle"
        );

        report
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
