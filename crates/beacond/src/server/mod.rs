//! HTTP listener for subscriber connections.
//!
//! The server:
//! - Binds a TCP listener (bind failure is a startup fault)
//! - Routes `GET {events_path}` to a new hub subscription streamed as SSE
//! - Serves `GET /health` with the current subscriber count
//! - Stops accepting on request and waits a bounded time for in-flight
//!   connections, then closes their sockets and aborts
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │    EventServer     │
//! │                    │
//! │ ConnectionListener │
//! └───────┬────────────┘
//!         │ axum::serve
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ events_handler  │────▶│      Hub        │
//! │  (per client)   │     │   subscribe()   │
//! └─────────────────┘     └─────────────────┘
//!         │
//!         │ Sse<Subscription>
//!         ▼
//! ┌─────────────────┐
//! │  SSE clients    │
//! │  (subscribers)  │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Listener errors are logged and reported through [`ListenerOutcome`]

mod connection;
mod events;

pub use connection::{ConnectionInfo, ConnectionListener, ConnectionStream};
pub use events::{HealthResponse, ServerState};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::hub::Hub;

/// Path of the health check
pub const HEALTH_PATH: &str = "/health";

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind listener at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// How the listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// All in-flight connections finished within the grace period
    Graceful,

    /// The grace period ran out; open connections were closed and the
    /// server task was aborted
    Aborted,

    /// The server task had already failed
    Failed,
}

/// Builds the router for the given hub.
///
/// The event stream handler needs [`ConnectionInfo`], so the router must be
/// served over a [`ConnectionListener`] with connect info enabled.
pub fn router(hub: Hub, events_path: &str, keep_alive: Duration) -> Router {
    let state = Arc::new(ServerState { hub, keep_alive });

    Router::new()
        .route(events_path, get(events::events_handler))
        .route(HEALTH_PATH, get(events::health_handler))
        .with_state(state)
}

/// A bound, not yet serving, HTTP listener.
pub struct EventServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
}

impl EventServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// `ServerError::Bind` if the address is unavailable.
    pub async fn bind(
        addr: SocketAddr,
        hub: Hub,
        events_path: &str,
        keep_alive: Duration,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        Ok(Self {
            listener,
            local_addr,
            router: router(hub, events_path, keep_alive),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts serving on a background task.
    pub fn spawn(self) -> ServerHandle {
        let shutdown = CancellationToken::new();
        let connections = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let Self {
            listener,
            local_addr,
            router,
        } = self;

        info!(addr = %local_addr, "Event server listening");

        let listener = ConnectionListener::new(listener, connections.clone());
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<ConnectionInfo>(),
            )
            .with_graceful_shutdown(signal)
            .await
        });

        ServerHandle {
            local_addr,
            shutdown,
            connections,
            task,
        }
    }
}

/// Handle to a serving listener.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    connections: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns true if the server task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops accepting connections and waits up to `grace` for in-flight
    /// ones. After that the remaining sockets are closed and the server
    /// task is aborted.
    pub async fn stop(self, grace: Duration) -> ListenerOutcome {
        let Self {
            local_addr,
            shutdown,
            connections,
            mut task,
        } = self;

        shutdown.cancel();
        let _close_remaining = connections.drop_guard();

        match timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => {
                info!(addr = %local_addr, "Event server stopped");
                ListenerOutcome::Graceful
            }
            Ok(Ok(Err(e))) => {
                error!(error = %e, "Event server failed");
                ListenerOutcome::Failed
            }
            Ok(Err(e)) => {
                error!(error = %e, "Event server task failed");
                ListenerOutcome::Failed
            }
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Listener shutdown deadline exceeded, closing connections"
                );
                task.abort();
                ListenerOutcome::Aborted
            }
        }
    }
}
