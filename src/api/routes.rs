use crate::api::{handlers, AppState};
use crate::auth::{bearer_token, AuthError};
use crate::error::AppError;
use crate::realtime::websocket_handler;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Build the main API router
pub fn build_router(state: AppState) -> Router {
    // In-process producers
    let internal = Router::new()
        .route("/rooms/:room_id/events", post(handlers::publish_room_event))
        .route("/users/:user_id/events", post(handlers::publish_user_event))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_key,
        ));

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        // Realtime endpoint
        .route("/ws/room/:room_id", get(websocket_handler))
        // Diagnostics
        .route("/realtime/stats", get(handlers::realtime_stats))
        .route("/realtime/history", get(handlers::realtime_history))
        .route("/realtime/connections/:id", get(handlers::get_connection))
        .nest("/internal", internal)
        // Add state
        .with_state(state)
        // Add middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
}

/// Reject `/internal` requests that lack the configured bearer key
async fn require_internal_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .internal_key
        .as_deref()
        .ok_or_else(|| AppError::Authentication("internal publishing is disabled".to_string()))?;

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if bearer_token(header)? != expected {
        return Err(AuthError::InvalidToken.into());
    }

    Ok(next.run(req).await)
}
