//! data structures for deserializing incoming alerts
//!
//! Decoding is lenient: missing fields take their default and opaque numeric
//! fields that don't parse are zeroed instead of rejecting the whole batch.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DefaultOnError, DisplayFromStr, PickFirst};

/// label and annotation values keep their json type
pub type ValueMap = BTreeMap<String, Value>;

/// one webhook delivery from alertmanager
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(clippy::missing_docs_in_private_items)]
pub struct AlertBatch {
	/// in order of delivery
	pub alerts: Vec<Alert>,
	pub common_annotations: ValueMap,
	pub common_labels: ValueMap,
	#[serde(rename = "externalURL")]
	pub external_url: String,
	#[serde_as(as = "DefaultOnError<PickFirst<(_, DisplayFromStr)>>")]
	pub group_key: i64,
	pub group_labels: ValueMap,
	pub receiver: String,
	pub status: String,
	#[serde_as(as = "DefaultOnError<PickFirst<(_, DisplayFromStr)>>")]
	pub version: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(clippy::missing_docs_in_private_items)]
pub struct Alert {
	pub status: String,
	pub annotations: ValueMap,
	pub labels: ValueMap,
	/// rfc3339, only parsed by the `str_FormatDate` template helper
	pub starts_at: String,
	pub ends_at: String,
	#[serde(rename = "generatorURL")]
	pub generator_url: String,
	pub fingerprint: String,
}

impl AlertBatch {
	/// Decode a webhook body. Bodies that aren't an alert batch at all yield
	/// an empty batch.
	pub fn decode(body: &[u8]) -> Self {
		serde_json::from_slice(body).unwrap_or_else(|err| {
			tracing::warn!("failed to decode alert batch, rendering empty batch: {err}");
			Self::default()
		})
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn decodes_alertmanager_payload() {
		let body = json!({
			"receiver": "sns",
			"status": "firing",
			"alerts": [
				{
					"status": "firing",
					"labels": { "alertname": "DiskFull", "severity": "critical", "shard": 3 },
					"annotations": { "summary": "disk almost full" },
					"startsAt": "2026-10-19T08:30:00.123456789Z",
					"endsAt": "0001-01-01T00:00:00Z",
					"generatorURL": "http://prometheus/graph"
				},
				{ "labels": { "alertname": "Second" } }
			],
			"groupLabels": { "alertname": "DiskFull" },
			"commonLabels": { "severity": "critical" },
			"commonAnnotations": {},
			"externalURL": "http://alertmanager",
			"version": "4",
			"groupKey": 7
		});

		let batch = AlertBatch::decode(body.to_string().as_bytes());

		assert_eq!(batch.receiver, "sns");
		assert_eq!(batch.version, 4);
		assert_eq!(batch.group_key, 7);
		assert_eq!(batch.alerts.len(), 2);
		assert_eq!(batch.alerts[0].labels["shard"], json!(3));
		assert_eq!(batch.alerts[1].labels["alertname"], json!("Second"));
		assert!(batch.alerts[1].annotations.is_empty());
	}

	#[test]
	fn opaque_group_key_does_not_reject_batch() {
		let body = json!({
			"receiver": "sns",
			"groupKey": "{}:{alertname=\"DiskFull\"}",
		});

		let batch = AlertBatch::decode(body.to_string().as_bytes());

		assert_eq!(batch.receiver, "sns");
		assert_eq!(batch.group_key, 0);
	}

	#[test]
	fn garbage_decodes_to_empty_batch() {
		assert_eq!(AlertBatch::decode(b"test-payload"), AlertBatch::default());
	}

	#[test]
	fn serializes_with_webhook_field_names() {
		let value = serde_json::to_value(AlertBatch::default()).unwrap();

		assert!(value.get("externalURL").is_some());
		assert!(value.get("commonLabels").is_some());
	}
}
