use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{future, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as ProducerMessage};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::connector::{establish, ReadyProducer, RelayOptions};
use crate::error::RelayError;
use crate::http::{ConnectCameraRequest, ProducerApi};
use crate::peek::PeekableStream;
use crate::session::{coordinate, unavailable_message, Session};
use crate::telemetry::RelayStats;

/// Shared by every request handler and relay session.
pub struct RelayState {
    pub relay: RelayOptions,
    pub producer: ProducerApi,
    pub stats: Arc<RelayStats>,
}

impl std::fmt::Debug for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayState")
            .field("relay", &self.relay)
            .field("producer", &self.producer.base())
            .finish()
    }
}

impl RelayState {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            relay: cfg.relay_options(),
            producer: ProducerApi::new(&cfg.producer_http_base(), cfg.connect_camera_timeout())?,
            stats: Arc::new(RelayStats::default()),
        })
    }
}

/// A running relay HTTP/WebSocket server.
#[derive(Debug)]
pub struct RelayServer {
    state: Arc<RelayState>,
    bound_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind `cfg.listen_addr` and start serving in the background.
    ///
    /// The returned server reports the actual bound address, so port 0 works.
    /// When `shutdown` is notified the server stops accepting and drains.
    pub async fn start(cfg: &Config, shutdown: Option<Arc<Notify>>) -> anyhow::Result<Self> {
        let requested_addr: SocketAddr = match cfg.listen_addr.parse() {
            Ok(a) => a,
            Err(e) => {
                crate::logging::error(format!(
                    "relay failed to parse listen address '{}': {}",
                    cfg.listen_addr, e
                ));
                return Err(anyhow::anyhow!(
                    "Invalid listen address '{}': {} (use numeric IP, not hostname like 'localhost')",
                    cfg.listen_addr,
                    e
                ));
            }
        };

        let listener = tokio::net::TcpListener::bind(requested_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind relay on {}: {}", requested_addr, e))?;
        let bound_addr = listener.local_addr()?;

        let state = Arc::new(RelayState::from_config(cfg)?);
        let app = router(state.clone(), &cfg.cors_origins);

        let task = tokio::spawn(async move {
            let result = match shutdown {
                Some(shutdown) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.notified().await;
                        })
                        .await
                }
                None => axum::serve(listener, app).await,
            };
            if let Err(e) = result {
                crate::logging::error(format!("relay server error: {}", e));
            }
            crate::logging::info("relay server stopped");
        });

        crate::logging::info_kv(
            "relay server listening",
            &[
                ("addr", &bound_addr.to_string()),
                ("producer_ws", &state.relay.producer_ws_url),
                ("producer_http", state.producer.base()),
            ],
        );

        Ok(Self {
            state,
            bound_addr,
            task,
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.state.stats.clone()
    }

    /// Wait for the serve loop to exit (after shutdown was notified).
    pub async fn wait(self) {
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// All routes of the relay, with CORS applied.
pub fn router(state: Arc<RelayState>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/ws/:camera_id", get(ws_upgrade))
        .route("/health", get(health))
        .route("/v1/status", get(status))
        .route("/start-camera", post(start_camera))
        .with_state(state)
        .layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(camera_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_client(socket, camera_id, state))
}

/// Drive one relay session from accept to close.
async fn relay_client(mut socket: WebSocket, camera_id: String, state: Arc<RelayState>) {
    let mut session = Session::new(camera_id);
    let session_id = session.id().to_string();
    state.stats.on_session_start();
    crate::logging::info_kv(
        "client connected",
        &[("session", &session_id), ("camera", session.camera_id())],
    );

    match establish(&mut session, &state.relay).await {
        Ok(producer) => run_active(&mut session, socket, producer, &state.stats).await,
        Err(err) => {
            state.stats.on_unavailable();
            state.stats.set_last_error(&err);
            crate::logging::error_kv(
                "producer unavailable",
                &[
                    ("session", &session_id),
                    ("camera", session.camera_id()),
                    ("error", &err.to_string()),
                ],
            );
            if let Err(err) = socket.send(ClientMessage::Text(unavailable_message())).await {
                crate::logging::warn_kv(
                    "unavailable notice not delivered",
                    &[("session", &session_id), ("error", &err.to_string())],
                );
            }
            if let Err(err) = socket.close().await {
                crate::logging::warn_kv(
                    "close failed",
                    &[
                        ("side", "client"),
                        ("session", &session_id),
                        ("error", &err.to_string()),
                    ],
                );
            }
        }
    }

    state.stats.on_session_end();
}

async fn run_active(
    session: &mut Session,
    client: WebSocket,
    producer: ReadyProducer,
    stats: &RelayStats,
) {
    let ReadyProducer {
        socket,
        first_message,
    } = producer;

    let (producer_tx, producer_rx) = socket.split();
    let producer_tx = producer_tx
        .with(|text: String| future::ready(Ok::<_, WsError>(ProducerMessage::Text(text))));
    let producer_rx = PeekableStream::new(producer_rx, first_message);

    let (client_tx, client_rx) = client.split();
    let client_tx = client_tx
        .with(|text: String| future::ready(Ok::<_, axum::Error>(ClientMessage::Text(text))));
    let client_rx = PeekableStream::live(client_rx);

    coordinate(session, client_rx, client_tx, producer_rx, producer_tx, stats).await;
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(rename = "ts")]
    timestamp: String,
    version: String,
    relay: RelayInfo,
}

#[derive(Serialize)]
struct RelayInfo {
    sessions_started: u64,
    sessions_active: i64,
    sessions_unavailable: u64,
    frames_to_producer: u64,
    frames_to_client: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    last_error: String,
}

async fn status(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let snap = state.stats.snapshot();
    Json(StatusResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        relay: RelayInfo {
            sessions_started: snap.sessions_started,
            sessions_active: snap.sessions_active,
            sessions_unavailable: snap.sessions_unavailable,
            frames_to_producer: snap.frames_to_producer,
            frames_to_client: snap.frames_to_client,
            last_error: snap.last_error,
        },
    })
}

async fn start_camera(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<ConnectCameraRequest>,
) -> impl IntoResponse {
    match state.producer.connect_camera(&req).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "started" })),
        )
            .into_response(),
        Err(err) => {
            crate::logging::error_kv(
                "start-camera failed",
                &[
                    ("camera", &req.camera_id.to_string()),
                    ("error", &err.to_string()),
                ],
            );
            state.stats.set_last_error(&err);
            let message = match &err {
                RelayError::ProducerRequest(e) => e.to_string(),
                _ => "Error interno del servidor".to_string(),
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error", "message": message })),
            )
                .into_response()
        }
    }
}
