//! Control-plane HTTP routes sharing the realtime listener.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use proto::{ChannelId, PublishedEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::server::GatewayState;

// ─── Request / response bodies ─────────────────────────────

/// Body of `POST /api/devices/{device_id}/events`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Event name forwarded to subscribers.
    #[serde(default = "default_event_name")]
    pub event: String,
    /// Opaque payload forwarded unchanged.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_event_name() -> String {
    "message".to_string()
}

/// Result of a publish call.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Connections the event was handed to.
    pub delivered: usize,
}

/// Health report.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub datastore: String,
    pub connections: usize,
    pub channels: usize,
}

/// Subscriber count for one device channel.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribersResponse {
    pub device_id: String,
    pub subscribers: usize,
}

// ─── Axum handlers ─────────────────────────────────────────

/// Built-in control-plane routes.
pub fn routes() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/devices/{device_id}/events", post(publish_handler))
        .route("/api/devices/{device_id}/subscribers", get(subscribers_handler))
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    let datastore = match state.datastore() {
        Some(store) => match store.ping().await {
            Ok(()) => "ok",
            Err(e) => {
                warn!(backend = store.backend(), "Datastore ping failed: {e}");
                "unavailable"
            }
        },
        None => "detached",
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        datastore: datastore.to_string(),
        connections: state.registry().connection_count(),
        channels: state.registry().channel_count(),
    })
}

/// Publishes an event to every connection subscribed to `device_id`.
async fn publish_handler(
    State(state): State<Arc<GatewayState>>,
    Path(device_id): Path<String>,
    Json(body): Json<PublishRequest>,
) -> impl IntoResponse {
    let event = PublishedEvent::new(device_id, body.event, body.payload);
    debug!(channel = %event.channel_id, event = %event.event, "Control-plane publish");
    let delivered = state.publisher().publish(event);
    (StatusCode::ACCEPTED, Json(PublishResponse { delivered }))
}

/// Reports how many connections are subscribed to `device_id`.
async fn subscribers_handler(
    State(state): State<Arc<GatewayState>>,
    Path(device_id): Path<String>,
) -> Json<SubscribersResponse> {
    let subscribers = state
        .registry()
        .subscriber_count(&ChannelId::from(device_id.as_str()));
    Json(SubscribersResponse {
        device_id,
        subscribers,
    })
}

/// JSON 404 for unmatched control-plane requests.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
}

// ─── Tests ─────────────────────────────────────────────────
