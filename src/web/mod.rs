pub mod extractors;
pub mod handlers;
pub mod middleware;

use crate::{models::ModelManager, utils::error::ModelError, Config, Result};
use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

pub async fn serve(config: Config) -> Result<()> {
    // Load every configured model before accepting requests
    ModelManager::init(config.clone())?;

    let app = create_app(config.clone());

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| ModelError::Config(format!("Invalid bind address {}: {}", config.bind_addr, e)))?;

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  POST /infer        - JSON base64 upload");
    tracing::info!("  POST /infer/upload - Multipart file upload");
    tracing::info!("  GET  /api/models   - Published model wrappers");
    tracing::info!("  GET  /health       - Health check");
    tracing::info!("  GET  /api/info     - Service information");

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ModelError::Internal(format!("Failed to bind to address {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| ModelError::Internal(format!("Server failed to start: {}", e)))?;

    Ok(())
}

pub fn create_app(config: Config) -> Router {
    Router::new()
        .route("/infer", post(handlers::infer_json_handler))
        .route("/infer/upload", post(handlers::infer_upload_handler))
        .route("/api/models", get(handlers::models_handler))
        .route("/health", get(health_handler))
        .route("/api/info", get(info_handler))
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(RequestBodyLimitLayer::new(config.server_config.max_request_size))
        .layer(TimeoutLayer::new(Duration::from_secs(config.server_config.request_timeout)))
        .layer(CorsLayer::permissive())
        .with_state(config)
}

/// Health check endpoint
async fn health_handler() -> Result<Json<serde_json::Value>> {
    crate::models::health_check()?;
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// Service information endpoint
async fn info_handler() -> Result<Json<serde_json::Value>> {
    let stats = crate::models::get_model_stats()?;
    let registry = crate::models::ExportRegistry::global()?;
    Ok(Json(json!({
        "service": "model-api",
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "published_names": registry.len(),
        "models": stats,
        "features": {
            "json_upload": true,
            "multipart_upload": true,
            "output_formats": ["json", "csv", "text"]
        }
    })))
}
