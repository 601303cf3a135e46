//! HTTP and WebSocket server.
//!
//! This module provides the network surface of the hub:
//! - `GET /ws?role=producer|observer` upgrades to the real-time channel
//! - `POST /ingest` synchronous sample ingestion for devices that cannot
//!   hold a socket open
//! - `POST /predict` stateless classification
//! - `GET /health` liveness and client counts
//!
//! # Architecture
//!
//! ```text
//! sensor ──ws──┐                          ┌──ws──→ dashboards
//!              ├──→ Hub ──→ pipeline ──→ rooms
//! sensor ─POST─┘                          └──ws──→ alert subscribers
//! ```

use crate::config::Config;
use crate::hub::{Hub, HubSettings};
use crate::ingest::IngestError;
use crate::model::{build_model, Prediction};
use crate::protocol::SampleAck;
use crate::session::{ClientCounts, Role, UnrecognizedRole};
use crate::store::open_store;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to
    pub host: String,
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.bind_host.clone(), config.port)
    }
}

/// Open the configured store and model and assemble a hub around them.
pub fn build_hub(config: &Config) -> anyhow::Result<Arc<Hub>> {
    let store = open_store(config)?;
    let model = build_model(&config.model)?;
    tracing::info!("Classifier: {}", model.name());
    Ok(Arc::new(Hub::new(HubSettings::from(config), store, model)))
}

/// Connect parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub role: Option<String>,
    /// Older clients send the role as `type`
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ConnectParams {
    pub fn role(&self) -> Result<Role, UnrecognizedRole> {
        self.role
            .as_deref()
            .or(self.kind.as_deref())
            .map_or(Ok(Role::Unknown), |s| s.parse())
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connected_clients: usize,
    pub clients: ClientCounts,
    pub server_info: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// GET /health
async fn health(State(hub): State<Arc<Hub>>) -> Json<HealthResponse> {
    let clients = hub.client_counts().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_clients: clients.total,
        clients,
        server_info: hub.server_info().to_string(),
    })
}

/// POST /ingest
///
/// Same validation, classification and persistence as a socket
/// `submit_sample`, acknowledged in the response body. The body is read as
/// JSON whatever its content type, and unparsable bodies get a failed
/// acknowledgement too.
async fn ingest(State(hub): State<Arc<Hub>>, body: Bytes) -> Response {
    let ack = match serde_json::from_slice::<Value>(&body) {
        Ok(raw) => hub.ingest_http(&raw).await,
        Err(e) => {
            tracing::debug!("Rejected unparsable ingest body: {}", e);
            SampleAck::failure(&IngestError::NotAnObject)
        }
    };
    (ack_status(&ack), Json::<SampleAck>(ack)).into_response()
}

fn ack_status(ack: &SampleAck) -> StatusCode {
    match ack.code.as_deref() {
        None => StatusCode::OK,
        Some("VALIDATION_ERROR") => StatusCode::BAD_REQUEST,
        Some("UNAUTHORIZED") => StatusCode::FORBIDDEN,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /predict
async fn predict(
    State(hub): State<Arc<Hub>>,
    Json(raw): Json<Value>,
) -> Result<Json<Prediction>, ApiError> {
    hub.predict(&raw)
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.code(), e.to_string()))
}

/// GET /ws
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(hub): State<Arc<Hub>>,
) -> Result<Response, ApiError> {
    let role = params.role().map_err(|e| {
        tracing::warn!("Rejected connection: {}", e);
        api_error(StatusCode::BAD_REQUEST, "INVALID_ROLE", e.to_string())
    })?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, hub, role))
        .into_response())
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, role: Role) {
    let (id, mut outbox) = hub.connect(role).await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if sink.send(Message::Text(message.to_json())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Frames from one connection are handled strictly in arrival order.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.handle_text(id, &text).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => hub.handle_text(id, text).await,
                Err(_) => tracing::debug!("Ignoring non-UTF-8 binary frame from {}", id),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Socket error on {}: {}", id, e);
                break;
            }
        }
    }

    hub.disconnect(id).await;
    writer.abort();
}

/// Routes and layers around a hub.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/ingest", post(ingest))
        .route("/predict", post(predict))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Run the server
pub async fn run(
    config: ServerConfig,
    hub: Arc<Hub>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(hub);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Stress monitor listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
