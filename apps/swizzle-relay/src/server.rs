use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{registry::Connection, session::RelaySession};

#[derive(Clone)]
pub struct AppState {
    session: Arc<RelaySession>,
    metrics: Option<PrometheusHandle>,
    writer_buffer: usize,
}

impl AppState {
    pub fn new(
        session: Arc<RelaySession>,
        metrics: Option<PrometheusHandle>,
        writer_buffer: usize,
    ) -> Self {
        Self {
            session,
            metrics,
            writer_buffer: writer_buffer.max(1),
        }
    }

    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/socket", get(ws_handler))
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.session.status())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection, mut rx) = Connection::channel(state.writer_buffer, Some(addr));
    let connection_id = connection.id();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    if let Err(err) = state.session.accept(connection).await {
        warn!(connection_id = %connection_id, remote_addr = %addr, error = %err, "rejecting connection");
        writer.abort();
        return;
    }

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.session.on_frame(connection_id, text.as_bytes());
            }
            Ok(Message::Binary(data)) => {
                state.session.on_frame(connection_id, &data);
            }
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    state.session.disconnect(connection_id);
    writer.abort();
}
