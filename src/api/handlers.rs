use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::realtime::{
    connection::ConnectionCounters,
    history::HistoryEntry,
    metrics::gather_metrics,
    protocol::{room_channel, validate_channel_name},
    EventPublisher, RealtimeStats, RoomEvent, UserEvent,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
        active_connections: state.manager.connection_count(),
    }))
}

/// Readiness check: fails once the manager stops admitting connections
pub async fn readiness_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    if !state.manager.is_accepting() {
        return Err(AppError::Unavailable("shutting down".to_string()));
    }
    health_check(State(state)).await
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_connections: usize,
}

/// Prometheus scrape endpoint
pub async fn metrics(State(state): State<AppState>) -> Result<(StatusCode, String)> {
    if !state.prometheus_enabled {
        return Err(AppError::NotFound("metrics are disabled".to_string()));
    }
    Ok((StatusCode::OK, gather_metrics()))
}

/// Live connection statistics
pub async fn realtime_stats(State(state): State<AppState>) -> Json<RealtimeStats> {
    Json(state.manager.stats())
}

#[derive(Debug, Deserialize, Validate)]
pub struct HistoryQuery {
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<HistoryEntry>,
    pub capacity: usize,
}

/// Recent broadcasts, newest last
pub async fn realtime_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>> {
    query.validate()?;

    let history = state.manager.history();
    let limit = query.limit.unwrap_or(history.capacity());
    Ok(Json(HistoryResponse {
        entries: history.recent(limit),
        capacity: history.capacity(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub user_id: Option<String>,
    pub room_id: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub counters: ConnectionCounters,
    pub channels: Vec<String>,
}

/// Inspect one connection
pub async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionInfo>> {
    let registry = state.manager.registry();
    let connection = registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Connection {} not found", id)))?;

    let meta = connection.meta();
    let mut channels = registry.channels_of(&id);
    channels.sort();

    Ok(Json(ConnectionInfo {
        id: connection.id().to_string(),
        user_id: connection.user_id().map(str::to_string),
        room_id: connection.room_id().map(str::to_string),
        state: meta.state.to_string(),
        created_at: connection.created_at(),
        last_activity_at: meta.last_activity_at,
        counters: meta.counters,
        channels,
    }))
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub recipients: usize,
    pub batched: bool,
}

/// Publish an event to a room
pub async fn publish_room_event(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(event): Json<RoomEvent>,
) -> Result<(StatusCode, Json<PublishResponse>)> {
    validate_channel_name(&room_channel(&room_id))
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let recipients = state.manager.publish_room_event(&room_id, event).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            recipients,
            batched: true,
        }),
    ))
}

/// Publish an event to every connection of a user
pub async fn publish_user_event(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(event): Json<UserEvent>,
) -> Result<Json<PublishResponse>> {
    if user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id must not be empty".to_string()));
    }

    let recipients = state.manager.publish_user_event(&user_id, event).await;
    Ok(Json(PublishResponse {
        recipients,
        batched: false,
    }))
}
