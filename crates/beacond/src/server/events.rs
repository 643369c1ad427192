//! HTTP handlers: the event stream and the health check.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::{Hub, SubscriberId, Subscription};

use super::ConnectionInfo;

/// State shared by all handlers.
pub struct ServerState {
    pub hub: Hub,
    pub keep_alive: Duration,
}

/// `GET /events` - registers a subscriber and streams frames to it.
///
/// Refused with 503 once the hub is shutting down or full.
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(connection): ConnectInfo<ConnectionInfo>,
) -> Response {
    match state.hub.subscribe() {
        Ok(subscription) => {
            info!(
                subscriber = %subscription.id(),
                remote = %connection.remote_addr,
                "Subscriber connected"
            );
            tokio::spawn(close_connection_on_force_close(
                subscription.id(),
                subscription.close_token(),
                connection.close_token(),
            ));
            Sse::new(subscription_stream(subscription))
                .keep_alive(KeepAlive::new().interval(state.keep_alive))
                .into_response()
        }
        Err(e) => {
            debug!(error = %e, "Refusing subscriber");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// Closes the socket once the hub force-closes the subscriber.
///
/// Ends on its own when the connection goes away first.
async fn close_connection_on_force_close(
    id: SubscriberId,
    subscriber: CancellationToken,
    connection: CancellationToken,
) {
    tokio::select! {
        _ = subscriber.cancelled() => {
            debug!(subscriber = %id, "Closing connection of force-closed subscriber");
            connection.cancel();
        }
        _ = connection.cancelled() => {}
    }
}

/// Adapts a subscription into the SSE event stream.
///
/// The stream ends when the subscription closes; dropping it (client
/// disconnect) deregisters the subscriber.
fn subscription_stream(
    mut subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(frame) = subscription.recv().await {
            yield Ok(Event::default().data(frame.as_str()));
        }
        debug!(subscriber = %subscription.id(), "Subscriber stream finished");
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub subscribers: usize,
}

/// `GET /health` - liveness and current subscriber count.
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let status = if state.hub.is_closed() {
        "draining"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        subscribers: state.hub.subscriber_count(),
    })
}
