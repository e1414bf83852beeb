use std::net::{AddrParseError, SocketAddr};

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer};

use crate::{
    alert_renderer::TemplateSettings, instance_metadata::MetadataSettings, log::LogSettings,
    sns::SnsSettings,
};

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// `host:port`, or `:port` to listen on all interfaces
    #[serde(deserialize_with = "deserialize_listen_address")]
    pub listen_address: SocketAddr,
    /// verbose logging and template reloading on every request
    pub debug: bool,
    /// detected from the instance metadata if missing or invalid
    pub arn_prefix: Option<String>,
    pub template: TemplateSettings,
    #[serde(default)]
    pub sns: SnsSettings,
    pub metadata: MetadataSettings,
    pub log: LogSettings,
}

fn parse_listen_address(address: &str) -> Result<SocketAddr, AddrParseError> {
    match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}").parse(),
        None => address.parse(),
    }
}

fn deserialize_listen_address<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<SocketAddr, D::Error> {
    let address = String::deserialize(deserializer)?;

    parse_listen_address(&address).map_err(serde::de::Error::custom)
}

/// command line flags taking a value: (flag, environment variable, settings key, help)
const VALUE_FLAGS: [(&str, &str, &str, &str); 7] = [
    ("addr", "SNS_FORWARDER_ADDRESS", "listen_address", "Address on which to listen"),
    ("arn-prefix", "SNS_FORWARDER_ARN_PREFIX", "arn_prefix", "Prefix to use for ARNs"),
    ("template-path", "SNS_FORWARDER_TEMPLATE_PATH", "template.path", "Template path"),
    (
        "template-time-zone",
        "SNS_FORWARDER_TEMPLATE_TIME_ZONE",
        "template.time_zone",
        "Template time zone",
    ),
    (
        "template-time-out-format",
        "SNS_FORWARDER_TEMPLATE_TIME_OUT_FORMAT",
        "template.time_out_format",
        "Template time out format (strftime)",
    ),
    (
        "template-split-token",
        "SNS_FORWARDER_TEMPLATE_SPLIT_TOKEN",
        "template.split_token",
        "Template split token",
    ),
    ("subject", "SNS_FORWARDER_SUBJECT", "sns.subject", "Subject of published messages"),
];

impl Settings {
    pub fn global() -> &'static Self {
        SETTINGS.get_or_init(|| {
            match Self::load().context("failed to load config and command line arguments") {
                Ok(settings) => settings,
                Err(err) => {
                    // tracing wasn't setup yet
                    panic!("{:#?}", err);
                }
            }
        })
    }

    fn command() -> Command<'static> {
        let mut command = Command::new(clap::crate_name!())
            .version(clap::crate_version!())
            .about(clap::crate_description!())
            .args(&[
                Arg::new("config")
                    .help("path of config file")
                    .takes_value(true)
                    .short('c')
                    .long("config")
                    .default_value("./config.yaml"),
                Arg::new("level")
                    .help("log level")
                    .possible_values(["Error", "Warn", "Info", "Debug", "Trace"])
                    .ignore_case(true)
                    .takes_value(true)
                    .long("log"),
                Arg::new("debug").help("Debug mode").long("debug").env("SNS_FORWARDER_DEBUG"),
            ]);

        for (flag, env, _, help) in VALUE_FLAGS {
            command = command.arg(Arg::new(flag).help(help).long(flag).env(env).takes_value(true));
        }

        command
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            .set_default("listen_address", ":9087")?
            .set_default("debug", false)?
            .set_default("template.time_zone", "")?
            .set_default("template.time_out_format", "")?
            .set_default("template.split_token", "|")?
            .set_default("metadata.endpoint", "http://169.254.169.254/")?
            .set_default("metadata.timeout", 2.0)?
            .set_default("log.level", "info")?)
    }

    /// defaults < config file < `SNS_FORWARDER__*` environment < command line
    fn from_matches(opts: &ArgMatches) -> Result<Self> {
        let config_path = opts.value_of("config").unwrap_or("./config.yaml");

        let mut builder = Self::defaults()?
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix("SNS_FORWARDER").prefix_separator("__").separator("__"),
            );

        for (flag, _, key, _) in VALUE_FLAGS {
            if let Some(value) = opts.value_of(flag) {
                builder = builder.set_override(key, value)?;
            }
        }

        if opts.is_present("debug") {
            builder = builder.set_override("debug", true)?;
        }

        let mut settings: Settings = builder
            .build()
            .context("can't load config")?
            .try_deserialize()
            .context("can't load config")?;

        if settings.debug {
            settings.log.level = "debug".to_string();
        }

        if let Some(level) = opts.value_of("level") {
            settings.log.level = level.to_string();
        }

        Ok(settings)
    }

    fn load() -> Result<Self> {
        Self::from_matches(&Self::command().get_matches())
    }
}
