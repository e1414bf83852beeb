//! prometheus alertmanager receiver that forwards alerts to aws sns topics
//!
//! Features:
//! - forwards webhook url paths `/alert/<topic>` to the sns topic `<arn prefix><topic>`
//! - detects the arn prefix from the ec2 instance metadata if not configured
//! - optionally renders alerts through a tera template before publishing

use std::sync::Arc;

use anyhow::{Context, Result};
use settings::Settings;
use tokio::sync::mpsc;

use crate::{
	alert_renderer::AlertRenderer,
	alertmanager_webhook_receiver::{PublishMetrics, State},
	instance_metadata::MetadataClient,
	sns::{credentials::CredentialsProvider, SnsClient},
};

mod alert;
mod alert_renderer;
mod alertmanager_webhook_receiver;
mod arn;
mod formatting;
mod instance_metadata;
mod log;
mod settings;
mod sns;
mod telemetry_endpoint;

/// exit the complete program if one thread panics
fn setup_panic_handler() {
	let default_panic = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		default_panic(info);
		std::process::exit(1);
	}));
}

/// Configured arn prefix if it's valid, detected one otherwise. An empty
/// prefix means every request has to carry the full topic arn.
async fn resolve_topic_prefix(configured: Option<&str>, metadata: &MetadataClient) -> String {
	match configured {
		Some(prefix) if arn::validate(prefix) => return prefix.to_owned(),
		_ => tracing::warn!("arn prefix not supplied or wrong, will try to detect"),
	}

	match arn::detect_prefix(metadata, |var| std::env::var(var).ok()).await {
		Ok(prefix) => {
			tracing::info!("detected arn prefix {prefix}");
			prefix
		}
		Err(err) => {
			tracing::warn!(
				"arn prefix could not be detected, underlying problem is: {err}. You will need to use the full topic arn in the POST url."
			);
			String::new()
		}
	}
}

/// the entry point of the program
#[tokio::main]
pub async fn main() -> Result<()> {
	setup_panic_handler();

	log::setup_logging().context("could not setup logging")?;

	let settings = Settings::global();

	let renderer =
		AlertRenderer::load(&settings.template, settings.debug).context("failed to load template")?;

	let metadata =
		MetadataClient::new(&settings.metadata).context("failed to construct metadata client")?;

	let topic_prefix = resolve_topic_prefix(settings.arn_prefix.as_deref(), &metadata).await;

	let publisher = SnsClient::new(
		settings.sns.endpoint.clone(),
		CredentialsProvider::from_env_or_instance(metadata),
	);

	let metrics = PublishMetrics::new(prometheus::default_registry())
		.context("failed to register metrics")?;

	let (tx_faults, mut rx_faults) = mpsc::channel(1);

	let state = Arc::new(State {
		topic_prefix,
		renderer,
		publisher: Arc::new(publisher),
		subject: settings.sns.subject.clone(),
		metrics,
		faults: tx_faults,
	});

	tokio::select! {
		result = alertmanager_webhook_receiver::run_alert_receiver(settings.listen_address, state) => result,
		Some(fault) = rx_faults.recv() => {
			Err(anyhow::Error::new(fault).context("alert template is broken, shutting down"))
		}
	}
}
