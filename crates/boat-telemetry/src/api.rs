//! HTTP surface: history endpoints, live WebSocket feeds and a health probe.
//!
//! - `GET /api/{channel}`: raw records, ascending
//! - `GET /api/{channel}/aggregated`: bucketed aggregates
//! - `GET /api/data-time-range`: span of the position channel
//! - `GET /ws/{channel}`: live feed for battery, mission, mode, obstacle, position
//! - `GET /health`

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};

use crate::broker::ConnectionState;
use crate::channel::Channel;
use crate::fanout::{DeliveryError, FanoutRegistry, Registries, Subscriber};
use crate::query::{
    AggregateParams, DataTimeRange, QueryEngine, QueryError, RangeParams,
};
use crate::record::TelemetryRecord;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub queries: QueryEngine,
    pub registries: Arc<Registries>,
    pub broker_state: watch::Receiver<ConnectionState>,
    /// Flips to `true` when the process is shutting down; ends live sessions.
    pub shutdown: watch::Receiver<bool>,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mqtt_connected: bool,
}

enum ApiError {
    Query(QueryError),
    /// Query string that does not deserialize into the endpoint's parameters.
    Params(QueryRejection),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError::Query(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Params(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Query(err) if err.is_client_error() => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            ApiError::Query(err) => {
                log::error!("[API] query failed: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::Params(rejection) => (StatusCode::BAD_REQUEST, rejection.body_text()),
        };
        (status, Json(ApiErrorBody { detail })).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = *state.broker_state.borrow() == ConnectionState::Connected;
    Json(HealthResponse {
        status: "healthy",
        mqtt_connected: connected,
    })
}

async fn raw_records(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    params: Result<Query<RangeParams>, QueryRejection>,
) -> Result<Json<Vec<TelemetryRecord>>, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.queries.raw(&channel, &params).await?))
}

async fn aggregated_records(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    params: Result<Query<AggregateParams>, QueryRejection>,
) -> Result<Json<Vec<TelemetryRecord>>, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.queries.aggregated(&channel, &params).await?))
}

async fn data_time_range(State(state): State<AppState>) -> Result<Json<DataTimeRange>, ApiError> {
    Ok(Json(state.queries.data_time_range().await?))
}

async fn live_feed(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let registry = Channel::from_name(&channel).and_then(|c| state.registries.get(c).cloned());
    let Some(registry) = registry else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiErrorBody {
                detail: format!("No live feed for {}", channel),
            }),
        )
            .into_response();
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| live_session(socket, registry, state.shutdown)),
        Err(rejection) => rejection.into_response(),
    }
}

/// A dashboard WebSocket registered as a live subscriber.
struct WsSubscriber {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    evicted: Notify,
}

#[async_trait]
impl Subscriber for WsSubscriber {
    async fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| DeliveryError::Send(e.to_string()))
    }

    fn evicted(&self) {
        self.evicted.notify_one();
    }
}

async fn live_session(
    socket: WebSocket,
    registry: Arc<FanoutRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (sink, mut stream) = socket.split();
    let subscriber = Arc::new(WsSubscriber {
        sink: Mutex::new(sink),
        evicted: Notify::new(),
    });
    let id = registry.connect(subscriber.clone());

    // Inbound frames carry nothing; only watch for the session ending.
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = subscriber.evicted.notified() => {
                log::debug!("[{}] Closing evicted live socket #{}", registry.channel(), id);
                close_evicted(&subscriber, registry.send_timeout()).await;
                return;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("[{}] Live socket error: {}", registry.channel(), e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    registry.disconnect(id);
}

/// Tell the client to reconnect. The socket is dropped either way.
async fn close_evicted(subscriber: &WsSubscriber, wait: Duration) {
    let close = Message::Close(Some(CloseFrame {
        code: close_code::AGAIN,
        reason: "live feed delivery failed".into(),
    }));
    let send = async { subscriber.sink.lock().await.send(close).await };
    match tokio::time::timeout(wait, send).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Failed to send close frame: {}", e),
        Err(_) => log::debug!("Timed out sending close frame"),
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/data-time-range", get(data_time_range))
        .route("/api/{channel}", get(raw_records))
        .route("/api/{channel}/aggregated", get(aggregated_records))
        .route("/ws/{channel}", any(live_feed))
        .with_state(state)
}
