//! Here we expose prometheus metrics and the health check of the forwarder
use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Response, StatusCode},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};

async fn metrics_handler() -> Response<Body> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let response = match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Body::from(buffer)),
        Err(err) => {
            tracing::error!("failed to encode metrics: {err}");
            Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Body::empty())
        }
    };

    response.unwrap_or_default()
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "health": "good" }))
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler)).route("/health", get(health_handler))
}
