use event_realtime::{
    api::{build_router, AppState},
    error::AppError,
    auth::StaticTokenVerifier,
    config::{Config, StatsSinkBackend},
    realtime::{ConnectionManager, NoopStatsSink, RedisStatsSink, StatsSink},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing
    let default_filter = format!(
        "event_realtime={},tower_http=info",
        config.observability.log_level
    );
    let fmt_layer = if config.observability.json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(fmt_layer)
        .init();

    tracing::info!("Starting event-realtime v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = validator::Validate::validate(&config.realtime) {
        tracing::error!(error = %e, "Invalid realtime configuration");
        return Err(AppError::Configuration(e.to_string()).into());
    }

    // Initialize stats sink
    let stats_sink: Arc<dyn StatsSink> = match config.stats_sink.backend {
        StatsSinkBackend::None => Arc::new(NoopStatsSink),
        StatsSinkBackend::Redis => {
            let redis_url = config
                .stats_sink
                .redis_url
                .clone()
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
            match RedisStatsSink::connect(
                &redis_url,
                &config.stats_sink.key_prefix,
                &config.server.instance_id,
                config.stats_sink.ttl_secs,
            )
            .await
            {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    tracing::warn!(error = %e, "Stats sink unavailable, continuing without it");
                    Arc::new(NoopStatsSink)
                }
            }
        }
    };

    // Initialize connection manager
    let manager = Arc::new(ConnectionManager::with_stats_sink(
        config.realtime.clone(),
        stats_sink,
    ));
    manager.start();
    tracing::info!(
        max_connections = config.realtime.max_connections,
        "Realtime connection manager started"
    );

    let verifier = Arc::new(StaticTokenVerifier::new(config.auth.tokens.clone()));
    if verifier.is_empty() {
        tracing::warn!("No auth tokens configured, every WebSocket connection will be refused");
    }

    if config.auth.internal_key.as_deref().map_or(true, str::is_empty) {
        tracing::warn!("No internal key configured, /internal publish routes will refuse every request");
    }

    let app_state = AppState::new(manager.clone(), verifier)
        .with_prometheus(config.observability.prometheus_enabled)
        .with_internal_key(config.auth.internal_key.clone());
    let app = build_router(app_state);

    // Start HTTP server
    let http_addr = config.bind_addr();
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;

    tracing::info!("HTTP server listening on http://{}", http_addr);
    tracing::info!("   Health check: http://{}/health", http_addr);
    tracing::info!("   Realtime: ws://{}/ws/room/{{room_id}}?token=...", http_addr);
    tracing::info!("   Stats: http://{}/realtime/stats", http_addr);

    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Shutting down gracefully...");
    manager.shutdown().await;
    Ok(())
}
