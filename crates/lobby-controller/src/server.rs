//! WebSocket transport and process wiring.
//!
//! Each accepted socket gets a registry handle and two halves: a writer task
//! draining the connection's outbound queue, and the inbound loop parsing
//! frames and dispatching them to the coordinator. Rejections come back to
//! the offending connection as a scoped `error` event; the session state is
//! untouched.
//!
//! On a server-initiated close (patient leave, doctor end) the writer drains
//! everything already queued before sending the close frame, so final
//! confirmations always reach the client.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderValue,
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::coordinator::{metrics, SessionCoordinatorHandle};
use crate::errors::CoordinatorError;
use crate::observability::health::{health_router, HealthState};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub coordinator: SessionCoordinatorHandle,
}

/// Builds the application router: WebSocket endpoint plus health probes.
pub fn app_router(state: AppState, health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .merge(health_router(health_state))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (handle, mut outbound) = state.registry.register();
    let connection_id = handle.id();
    tracing::info!(
        target: "lobby.server",
        connection_id = %connection_id,
        "websocket connected"
    );

    send_connected(&handle);

    let (mut sink, mut stream) = socket.split();
    let close = handle.close_token();
    let writer_close = close.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_close.cancelled() => {
                    // Drain what is already queued, then close.
                    while let Ok(event) = outbound.try_recv() {
                        if write_event(&mut sink, &event).await.is_err() {
                            return;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                event = outbound.recv() => {
                    let Some(event) = event else { return };
                    if write_event(&mut sink, &event).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            () = close.cancelled() => break,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &handle, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    handle.mark_closed();
    state.coordinator.connection_closed(connection_id).await;
    state.registry.remove(connection_id);
    handle.disconnect();
    let _ = writer.await;
    tracing::info!(
        target: "lobby.server",
        connection_id = %connection_id,
        "websocket disconnected"
    );
}

/// First-contact ack, queued before anything else on the connection.
fn send_connected(handle: &ConnectionHandle) {
    handle.send(ServerEvent::Connected {
        message: "Successfully connected to WebSocket server".to_string(),
        socket_id: handle.id(),
        timestamp: Utc::now().to_rfc3339(),
    });
}

async fn handle_frame(state: &AppState, handle: &ConnectionHandle, text: &str) {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(err) => {
            metrics::record_error(match &err {
                CoordinatorError::UnknownEventType(_) => "unknown_event_type",
                _ => "malformed_payload",
            });
            tracing::debug!(
                target: "lobby.server",
                connection_id = %handle.id(),
                error = %err,
                "rejected inbound frame"
            );
            handle.send(ServerEvent::from_error(&err));
            return;
        }
    };

    if let Err(err) = state.coordinator.dispatch(handle.id(), event).await {
        handle.send(ServerEvent::from_error(&err));
    }
}

async fn write_event(
    sink: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    event: &ServerEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

fn cors_layer(allowed_origin: &str) -> anyhow::Result<CorsLayer> {
    if allowed_origin == "*" {
        Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any))
    } else {
        let origin: HeaderValue = allowed_origin
            .parse()
            .with_context(|| format!("invalid CORS origin: {allowed_origin}"))?;
        Ok(CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin))
            .allow_methods(Any)
            .allow_headers(Any))
    }
}

/// Runs the server until `shutdown` is cancelled: installs the Prometheus
/// recorder, spawns the coordinator, binds the listener, and serves the
/// combined WebSocket/health/metrics router.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    let registry = Arc::new(ConnectionRegistry::new());
    let (coordinator, coordinator_task) =
        SessionCoordinatorHandle::spawn(Arc::clone(&registry), shutdown.child_token());
    let health_state = Arc::new(HealthState::new(config.instance_id.clone()));

    let app = app_router(
        AppState {
            registry,
            coordinator,
        },
        Arc::clone(&health_state),
    )
    .route(
        "/metrics",
        get(move || {
            let prometheus = prometheus.clone();
            async move { prometheus.render() }
        }),
    )
    .layer(cors_layer(&config.cors_allowed_origin)?)
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    tracing::info!(
        target: "lobby.server",
        bind_address = %config.bind_address,
        instance_id = %config.instance_id,
        "lobby controller listening"
    );
    health_state.set_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("server error")?;

    health_state.set_not_ready();
    shutdown.cancel();
    let _ = coordinator_task.await;
    tracing::info!(target: "lobby.server", "lobby controller stopped");
    Ok(())
}
