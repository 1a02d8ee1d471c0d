use std::{borrow::Cow, future::Future, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::{net::TcpListener, signal, sync::watch, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::archive::FrameArchive;
use crate::assets;
use crate::config::ServerConfig;
use crate::coordinator::{ContextSnapshot, SessionCoordinator};
use crate::envelope::OutboundEnvelope;
use crate::peer::PeerConnector;
use crate::registry::{ConnectionHandle, ConnectionRegistry, ConnectionSnapshot, OutboundFrame};
use crate::router::{Inbound, MessageRouter};
use crate::rtc::WebRtcConnector;

const CLOSE_GOING_AWAY: u16 = 1001;

pub struct AppState {
    router: MessageRouter,
    error_replies: bool,
    media_type: String,
    metrics: PrometheusHandle,
    started_at: Instant,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    media_type: String,
    recording_enabled: bool,
    uptime_secs: u64,
    active_connections: usize,
    active_negotiations: usize,
    connections: Vec<ConnectionSnapshot>,
    negotiations: Vec<ContextSnapshot>,
}

impl AppState {
    /// Wires registry, coordinator and router. The returned handle is the peer event pump.
    pub fn new(
        config: &ServerConfig,
        connector: Arc<dyn PeerConnector>,
        metrics: PrometheusHandle,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let registry = ConnectionRegistry::new(config.outbound_buffer);
        let (coordinator, pump) =
            SessionCoordinator::new(registry, connector, config.recorder.clone());
        let archive = config
            .archive
            .as_ref()
            .map(|archive| FrameArchive::new(archive.dir.clone(), archive.extension.clone()));
        let state = Arc::new(AppState {
            router: MessageRouter::new(coordinator, archive),
            error_replies: config.error_replies,
            media_type: config.media_type.clone(),
            metrics,
            started_at: Instant::now(),
        });
        (state, pump)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.router.coordinator().registry()
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        self.router.coordinator()
    }

    fn stats(&self) -> StatsResponse {
        let connections = self.registry().snapshot();
        let negotiations = self.coordinator().snapshot();
        StatsResponse {
            media_type: self.media_type.clone(),
            recording_enabled: self.coordinator().records_sessions(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_connections: connections.len(),
            active_negotiations: negotiations.len(),
            connections,
            negotiations,
        }
    }
}

/// Routes of the websocket listener: the upgrade at `/` plus operational endpoints.
pub fn ws_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let connector = WebRtcConnector::new(config.ice_servers.clone())
        .context("failed to initialise peer connection stack")?;
    let (state, pump) = AppState::new(&config, Arc::new(connector), metrics);

    let ws_listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind websocket listener on {}", config.listen_addr))?;
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {}", config.http_addr))?;
    info!("websocket relay listening on ws://{}", config.listen_addr);
    info!(
        assets_dir = %config.assets_dir.display(),
        "asset server listening on http://{}",
        config.http_addr
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let ws_server = serve_ws(ws_listener, state.clone(), wait_for(shutdown_rx.clone()));
    let assets = assets::router(config.assets_dir.clone());
    let http_server = async move {
        axum::serve(http_listener, assets)
            .with_graceful_shutdown(wait_for(shutdown_rx))
            .await
    };
    let (ws_result, http_result) = tokio::join!(ws_server, http_server);
    ws_result.context("websocket server shutdown with error")?;
    http_result.context("http server shutdown with error")?;

    let closing = state.registry().close_all(CLOSE_GOING_AWAY, "server shutting down");
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        closing,
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    pump.abort();
    info!("graceful shutdown complete");
    Ok(())
}

/// Serves the websocket listener until `shutdown` resolves.
pub async fn serve_ws<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, ws_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    // A dropped sender also ends the wait.
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let handle = ConnectionHandle::new();
    let registration = match state.registry().register(handle) {
        Ok(registration) => registration,
        Err(err) => {
            counter!("beach_conch_connections_rejected_total", 1, "reason" => err.metric_label());
            warn!(connection = %handle, error = %err, "rejecting connection");
            return;
        }
    };
    counter!("beach_conch_connections_total", 1);
    gauge!(
        "beach_conch_connections_active",
        registration.active_connections as f64
    );
    info!(
        connection = %handle,
        active = registration.active_connections,
        "client connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut outbound = registration.receiver;
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let last = matches!(frame, OutboundFrame::Close { .. });
            if ws_tx.send(into_message(frame)).await.is_err() || last {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(connection = %handle, "writer task finished");
    });

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = &mut writer => {
                debug!(connection = %handle, "outbound queue released; closing connection");
                break;
            }
        };
        let inbound = match message {
            Some(Ok(Message::Binary(data))) => Inbound::Binary(Bytes::from(data)),
            Some(Ok(Message::Text(text))) => Inbound::Text(text),
            Some(Ok(Message::Close(frame))) => {
                info!(
                    connection = %handle,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(connection = %handle, error = %err, "error receiving message");
                break;
            }
            None => break,
        };

        if let Err(err) = state.router.route(handle, inbound).await {
            if state.error_replies && err.is_reportable() {
                let reply = OutboundEnvelope::Error {
                    reason: err.metric_label().to_string(),
                    message: err.to_string(),
                };
                if let Err(err) = state
                    .registry()
                    .send_to(handle, OutboundFrame::Text(reply.to_json()))
                {
                    debug!(connection = %handle, error = %err, "error reply not delivered");
                }
            }
        }
    }

    let remaining = state.registry().unregister(handle);
    let torn_down = state.coordinator().teardown_connection(handle).await;
    writer.abort();
    gauge!("beach_conch_connections_active", remaining as f64);
    counter!("beach_conch_connections_closed_total", 1);
    info!(
        connection = %handle,
        negotiations_torn_down = torn_down,
        "client disconnected"
    );
}

fn into_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Binary(bytes) => Message::Binary(bytes.to_vec()),
        OutboundFrame::Text(text) => Message::Text(text),
        OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })),
    }
}
