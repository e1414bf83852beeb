//! `POST /alert/:topic` forwarding alertmanager webhooks to sns
//!
//! The body is rendered through the configured template (or forwarded as is)
//! and published to the topic `<arn prefix><topic>`.
use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::BytesRejection, Extension, Path},
    http::StatusCode,
    routing::post,
    Router,
};
use bytes::Bytes;
use prometheus::{IntCounterVec, Registry};
use tokio::sync::mpsc;

use crate::{
    alert::AlertBatch,
    alert_renderer::{AlertRenderer, RenderError},
    arn,
    sns::{ProviderErrorCode, PublishError, Publisher},
    telemetry_endpoint,
};

/// prometheus counters of publish attempts, labeled by topic
#[derive(Debug, Clone)]
pub struct PublishMetrics {
    pub successful: IntCounterVec,
    pub unsuccessful: IntCounterVec,
}

impl PublishMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        use prometheus::opts;

        let successful = IntCounterVec::new(
            opts!("successful_requests_total", "Total number of successful requests to SNS.")
                .namespace("forwarder")
                .subsystem("sns"),
            &["topic"],
        )?;
        let unsuccessful = IntCounterVec::new(
            opts!("unsuccessful_requests_total", "Total number of unsuccessful requests to SNS.")
                .namespace("forwarder")
                .subsystem("sns"),
            &["topic"],
        )?;

        registry.register(Box::new(successful.clone()))?;
        registry.register(Box::new(unsuccessful.clone()))?;

        Ok(Self { successful, unsuccessful })
    }
}

/// Everything a request needs, shared between all requests
pub struct State {
    /// prepended to the topic of the request path
    pub topic_prefix: String,
    /// `None` forwards request bodies unmodified
    pub renderer: Option<AlertRenderer>,
    pub publisher: Arc<dyn Publisher>,
    pub subject: Option<String>,
    pub metrics: PublishMetrics,
    /// template failures are configuration errors and stop the process
    pub faults: mpsc::Sender<RenderError>,
}

/// http status reported to alertmanager for a failed publish
pub fn classify(err: &PublishError) -> StatusCode {
    use ProviderErrorCode::*;

    match err.provider_code() {
        Some(InvalidParameter | InvalidParameterValue | EndpointDisabled) => StatusCode::BAD_REQUEST,
        Some(KmsDisabled | KmsInvalidState | KmsNotFound | KmsOptInRequired) => {
            StatusCode::BAD_REQUEST
        }
        Some(AuthorizationError | KmsAccessDenied | InvalidSecurity) => StatusCode::FORBIDDEN,
        Some(KmsThrottling) => StatusCode::GATEWAY_TIMEOUT,
        Some(InternalError) | None => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn alert_receiver(
    Extension(state): Extension<Arc<State>>,
    Path(topic): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> StatusCode {
    let State { topic_prefix, renderer, publisher, subject, metrics, faults } = &*state;

    let body = match body {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(%topic, "failed to read request body: {err}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let message = match renderer {
        Some(renderer) => match renderer.render(&AlertBatch::decode(&body)) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(%topic, "failed to render alert: {err}");
                if faults.try_send(err).is_err() {
                    tracing::debug!("configuration fault already reported");
                }
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        },
        None => String::from_utf8_lossy(&body).into_owned(),
    };

    let topic_arn = format!("{topic_prefix}{topic}");
    if !arn::validate(&topic_arn) {
        tracing::warn!(%topic_arn, "the sns topic arn is not correct");
        return StatusCode::BAD_REQUEST;
    }

    tracing::debug!(%topic_arn, %message, "publishing alert");

    match publisher.publish(&topic_arn, &message, subject.as_deref()).await {
        Ok(message_id) => {
            metrics.successful.with_label_values(&[topic.as_str()]).inc();
            tracing::info!(%topic_arn, %message_id, "published alert");
            StatusCode::OK
        }
        Err(err) => {
            metrics.unsuccessful.with_label_values(&[topic.as_str()]).inc();
            let status = classify(&err);
            tracing::warn!(%topic_arn, %status, "failed to publish alert: {err:#}");
            status
        }
    }
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/alert/:topic", post(alert_receiver))
        .merge(telemetry_endpoint::router())
        .layer(Extension(state))
}

pub async fn run_alert_receiver(addr: SocketAddr, state: Arc<State>) -> Result<()> {
    tracing::info!("listening on {addr}");

    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await
        .context("alert receiver endpoint crashed")?;

    Ok(())
}
