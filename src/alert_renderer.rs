//! Renders alert batches via tera templates before they're published.
//!
//! The template file is compiled once at startup. In debug mode it's
//! recompiled from disk before every render so templates can be edited
//! while the forwarder is running.
//!
//! Labels and annotations are free-form, so a template may look up a key an
//! alert doesn't carry. Such lookups render as empty values; any other
//! template error is a configuration fault.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tera::{Context, Tera};
use thiserror::Error;

use crate::{alert::AlertBatch, formatting};

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSettings {
    /// template file, rendering is skipped if not set
    pub path: Option<PathBuf>,
    /// default time zone of `str_FormatDate`
    pub time_zone: String,
    /// default strftime layout of `str_FormatDate`
    pub time_out_format: String,
    /// default split token of `str_Format_MeasureUnit`
    pub split_token: String,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("problem reading template file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("problem parsing template file {path:?}")]
    Load {
        path: PathBuf,
        #[source]
        source: tera::Error,
    },
    #[error("problem with template execution")]
    Execute(#[source] tera::Error),
}

/// The formatting helpers bound into every template
#[derive(Debug, Clone)]
struct Helpers {
    time_zone: String,
    time_out_format: String,
    split_token: String,
}

type Args = HashMap<String, Value>;

impl Helpers {
    fn register(&self, tera: &mut Tera) {
        let Self { time_zone, time_out_format, split_token } = self.clone();

        tera.register_filter(
            "str_FormatDate",
            move |value: &Value, args: &Args| -> tera::Result<Value> {
                let tz = string_arg(args, "tz").unwrap_or_else(|| time_zone.clone());
                let layout = string_arg(args, "layout").unwrap_or_else(|| time_out_format.clone());

                formatting::format_date(&value_string(value), &tz, &layout)
                    .map(Value::from)
                    .map_err(tera::Error::msg)
            },
        );
        tera.register_filter("str_UpperCase", upper_case);
        tera.register_filter("str_LowerCase", lower_case);
        tera.register_filter("str_Title", title);
        tera.register_filter("str_FormatFloat", format_float);
        tera.register_filter("str_FormatInt", format_int);
        tera.register_filter("str_Format_Byte", format_byte);
        tera.register_filter("str_Format_Scale", format_scale);
        tera.register_filter(
            "str_Format_MeasureUnit",
            move |value: &Value, args: &Args| -> tera::Result<Value> {
                let unit = string_arg(args, "unit").unwrap_or_default();
                let split = string_arg(args, "split").unwrap_or_else(|| split_token.clone());

                formatting::format_measure_unit(&unit, &value_string(value), &split)
                    .map(Value::from)
                    .map_err(tera::Error::msg)
            },
        );
        tera.register_function("HasKey", has_key);
    }
}

fn upper_case(value: &Value, _: &Args) -> tera::Result<Value> {
    Ok(Value::from(value_string(value).to_uppercase()))
}

fn lower_case(value: &Value, _: &Args) -> tera::Result<Value> {
    Ok(Value::from(value_string(value).to_lowercase()))
}

fn title(value: &Value, _: &Args) -> tera::Result<Value> {
    Ok(Value::from(formatting::title_case(&value_string(value))))
}

fn format_float(value: &Value, _: &Args) -> tera::Result<Value> {
    Ok(Value::from(formatting::format_float(&value_string(value))))
}

fn format_int(value: &Value, _: &Args) -> tera::Result<Value> {
    Ok(Value::from(formatting::format_integer(&value_string(value))))
}

fn format_byte(value: &Value, args: &Args) -> tera::Result<Value> {
    formatting::format_byte_scale(&value_string(value), start_arg(args))
        .map(Value::from)
        .map_err(tera::Error::msg)
}

fn format_scale(value: &Value, args: &Args) -> tera::Result<Value> {
    formatting::format_decimal_scale(&value_string(value), start_arg(args))
        .map(Value::from)
        .map_err(tera::Error::msg)
}

/// `HasKey(map=alert.labels, key="severity")`
fn has_key(args: &Args) -> tera::Result<Value> {
    let map = args.get("map").unwrap_or(&Value::Null);
    let key = string_arg(args, "key").unwrap_or_default();

    Ok(Value::from(formatting::has_key(map, &key)))
}

/// label values may be strings, numbers or booleans
fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_arg(args: &Args, name: &str) -> Option<String> {
    args.get(name).map(value_string)
}

fn start_arg(args: &Args) -> usize {
    args.get("start").and_then(Value::as_u64).unwrap_or_default() as usize
}

/// `labels.severity` or `labels["severity"]` on one of the label maps of a batch
static LABEL_LOOKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\b(labels|annotations|commonLabels|commonAnnotations|groupLabels)(?:\.([A-Za-z_][A-Za-z0-9_]*)|\[\s*["']([^"'\]]+)["']\s*\])"#,
    )
    .expect("valid regex")
});

/// label keys a template looks up, by label map
type LabelKeys = HashMap<String, BTreeSet<String>>;

fn label_keys(source: &str) -> LabelKeys {
    let mut keys = LabelKeys::new();

    for captures in LABEL_LOOKUP.captures_iter(source) {
        if let Some(key) = captures.get(2).or_else(|| captures.get(3)) {
            keys.entry(captures[1].to_owned()).or_default().insert(key.as_str().to_owned());
        }
    }

    keys
}

/// Insert `null` for every looked up key an alert doesn't carry. Tera fails
/// on missing keys but renders `null` as nothing.
fn fill_missing_labels(batch: &mut Value, keys: &LabelKeys) {
    let object = match batch {
        Value::Object(object) => object,
        _ => return,
    };

    for (map, keys) in keys {
        if let Some(Value::Object(labels)) = object.get_mut(map) {
            for key in keys {
                labels.entry(key.clone()).or_insert(Value::Null);
            }
        }
    }

    if let Some(Value::Array(alerts)) = object.get_mut("alerts") {
        for alert in alerts {
            fill_missing_labels(alert, keys);
        }
    }
}

/// A compiled template
struct Compiled {
    tera: Tera,
    label_keys: LabelKeys,
}

/// Alert renderer
pub struct AlertRenderer {
    path: PathBuf,
    name: String,
    helpers: Helpers,
    reload: bool,
    compiled: ArcSwap<Compiled>,
}

impl AlertRenderer {
    /// Compile the template at `settings.path`. Returns `Ok(None)` if no
    /// template is configured.
    ///
    /// # Arguments
    ///
    /// * `settings` - template file and defaults of the formatting helpers
    ///
    /// * `reload` - recompile the template before every render
    pub fn load(settings: &TemplateSettings, reload: bool) -> Result<Option<Self>, RenderError> {
        let path = match &settings.path {
            Some(path) => path.clone(),
            None => return Ok(None),
        };

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        let helpers = Helpers {
            time_zone: settings.time_zone.clone(),
            time_out_format: settings.time_out_format.clone(),
            split_token: settings.split_token.clone(),
        };

        let compiled = compile(&path, &name, &helpers)?;
        tracing::info!("loaded template file {}", path.display());

        Ok(Some(Self { path, name, helpers, reload, compiled: ArcSwap::from_pointee(compiled) }))
    }

    /// render `alerts` with the current template
    pub fn render(&self, alerts: &AlertBatch) -> Result<String, RenderError> {
        if self.reload {
            tracing::debug!("reloading template {}", self.path.display());
            let compiled = compile(&self.path, &self.name, &self.helpers)?;
            self.compiled.store(Arc::new(compiled));
        }

        let compiled = self.compiled.load();

        let mut batch = serde_json::to_value(alerts)
            .map_err(|err| RenderError::Execute(tera::Error::json(err)))?;
        fill_missing_labels(&mut batch, &compiled.label_keys);
        let context = Context::from_value(batch).map_err(RenderError::Execute)?;

        compiled.tera.render(&self.name, &context).map_err(RenderError::Execute)
    }
}

fn compile(path: &Path, name: &str, helpers: &Helpers) -> Result<Compiled, RenderError> {
    let source = std::fs::read_to_string(path)
        .map_err(|source| RenderError::Read { path: path.to_owned(), source })?;

    let mut tera = Tera::default();
    helpers.register(&mut tera);

    tera.add_raw_template(name, &source)
        .map_err(|source| RenderError::Load { path: path.to_owned(), source })?;

    Ok(Compiled { tera, label_keys: label_keys(&source) })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;
    use tempfile::NamedTempFile;

    use super::*;

    fn template_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".tmpl").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn settings(path: &Path) -> TemplateSettings {
        TemplateSettings {
            path: Some(path.to_owned()),
            time_zone: "Europe/Berlin".to_owned(),
            time_out_format: "%d.%m.%Y %H:%M".to_owned(),
            split_token: "|".to_owned(),
        }
    }

    fn batch() -> AlertBatch {
        serde_json::from_value(json!({
            "status": "firing",
            "alerts": [
                {
                    "labels": { "alertname": "DiskFull", "bytes": "2048" },
                    "annotations": { "summary": "disk almost full" },
                    "startsAt": "2026-10-19T08:30:00.000Z"
                },
                {
                    "labels": { "alertname": "LoadHigh", "load": 3.14159 },
                    "startsAt": "2026-10-19T09:00:00Z"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn no_template_configured() {
        let settings = TemplateSettings {
            path: None,
            time_zone: String::new(),
            time_out_format: String::new(),
            split_token: "|".to_owned(),
        };

        assert!(AlertRenderer::load(&settings, false).unwrap().is_none());
    }

    #[test]
    fn missing_template_fails_to_load() {
        let err = AlertRenderer::load(&settings(Path::new("/nonexistent/default.tmpl")), false)
            .err()
            .unwrap();

        assert!(matches!(err, RenderError::Read { .. }));
    }

    #[test]
    fn broken_template_fails_to_load() {
        let file = template_file("{% for alert in alerts %}");

        let err = AlertRenderer::load(&settings(file.path()), false).err().unwrap();
        assert!(matches!(err, RenderError::Load { .. }));
    }

    #[test]
    fn renders_alerts_in_delivery_order() {
        let file = template_file(
            "{{ status | str_UpperCase }}\n\
            {% for alert in alerts %}{{ alert.labels.alertname }} at {{ alert.startsAt | str_FormatDate }}\n{% endfor %}",
        );

        let renderer = AlertRenderer::load(&settings(file.path()), false).unwrap().unwrap();
        let rendered = renderer.render(&batch()).unwrap();

        assert_eq!(
            rendered,
            "FIRING\nDiskFull at 19.10.2026 10:30\nLoadHigh at 19.10.2026 11:00\n"
        );
    }

    #[test]
    fn exposes_formatting_helpers() {
        let file = template_file(
            "{% set first = alerts.0 %}{% set second = alerts.1 %}\
            {{ first.labels.bytes | str_Format_Byte }};\
            {{ first.labels.bytes | str_Format_MeasureUnit(unit=\"s|Hz\") }};\
            {{ second.labels.load | str_FormatFloat }};\
            {{ second.labels.load | str_FormatInt }};\
            {{ first.annotations.summary | str_Title }};\
            {{ HasKey(map=first.annotations, key=\"summary\") }};\
            {{ HasKey(map=second.annotations, key=\"summary\") }};\
            {{ first.startsAt | str_FormatDate(tz=\"UTC\", layout=\"%H:%M\") }}",
        );

        let renderer = AlertRenderer::load(&settings(file.path()), false).unwrap().unwrap();
        let rendered = renderer.render(&batch()).unwrap();

        assert_eq!(rendered, "2.00 Mb;2.05 KHz;3.14;3;Disk Almost Full;true;false;08:30");
    }

    #[test]
    fn renders_shipped_default_template() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates/default.tmpl");

        let renderer = AlertRenderer::load(&settings(&path), false).unwrap().unwrap();
        let rendered = renderer.render(&batch()).unwrap();

        assert!(rendered.contains("[FIRING] DiskFull"));
        assert!(rendered.contains("Summary: disk almost full"));
        assert!(rendered.contains("Started: 19.10.2026 10:30"));
    }

    #[test]
    fn date_helper_requires_configuration() {
        let file = template_file("{{ alerts.0.startsAt | str_FormatDate }}");
        let mut settings = settings(file.path());
        settings.time_zone = String::new();

        let renderer = AlertRenderer::load(&settings, false).unwrap().unwrap();
        let err = renderer.render(&batch()).unwrap_err();

        assert!(matches!(err, RenderError::Execute(_)));
    }

    #[test]
    fn missing_labels_render_empty() {
        let file = template_file(
            "{% for alert in alerts %}[{{ alert.labels.severity }}]\
            [{{ alert.annotations[\"runbook\"] | str_UpperCase }}]\
            [{{ HasKey(map=alert.labels, key=\"severity\") }}]\
            {% if alert.labels.severity %}never{% endif %}{% endfor %}\
            [{{ commonLabels.team }}][{{ groupLabels.job }}]",
        );

        let renderer = AlertRenderer::load(&settings(file.path()), false).unwrap().unwrap();

        assert_eq!(renderer.render(&batch()).unwrap(), "[][][false][][][false][][]");
    }

    #[test]
    fn unknown_batch_field_fails_execution() {
        let file = template_file("{{ alerts.0.nonexistent }}");

        let renderer = AlertRenderer::load(&settings(file.path()), false).unwrap().unwrap();
        assert!(matches!(renderer.render(&batch()), Err(RenderError::Execute(_))));
    }

    #[test]
    fn unknown_helper_fails_execution() {
        let file = template_file("{{ status | str_Shout }}");

        let renderer = AlertRenderer::load(&settings(file.path()), false).unwrap().unwrap();
        assert!(matches!(renderer.render(&batch()), Err(RenderError::Execute(_))));
    }

    #[test]
    fn collects_looked_up_label_keys() {
        let keys = label_keys(
            "{{ alert.labels.severity }}{{ alert.labels['team'] }}\
            {{ commonAnnotations.summary }}{% for k, v in alert.labels %}{% endfor %}",
        );

        assert_eq!(
            keys.get("labels").unwrap().iter().collect::<Vec<_>>(),
            ["severity", "team"]
        );
        assert_eq!(keys.get("commonAnnotations").unwrap().len(), 1);
        assert!(!keys.contains_key("annotations"));
    }

    #[test]
    fn reloads_template_in_debug_mode() {
        let file = template_file("first");

        let renderer = AlertRenderer::load(&settings(file.path()), true).unwrap().unwrap();
        assert_eq!(renderer.render(&batch()).unwrap(), "first");

        std::fs::write(file.path(), "second").unwrap();
        assert_eq!(renderer.render(&batch()).unwrap(), "second");
    }

    #[test]
    fn keeps_compiled_template_outside_debug_mode() {
        let file = template_file("first");

        let renderer = AlertRenderer::load(&settings(file.path()), false).unwrap().unwrap();
        std::fs::write(file.path(), "second").unwrap();

        assert_eq!(renderer.render(&batch()).unwrap(), "first");
    }
}
