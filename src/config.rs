use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use pulse_core::event::Channel;
use pulse_dispatch::DispatchConfig;
use pulse_source::SourceConfig;

const DEFAULT_CHANNELS: [&str; 3] = [
    "/data/LeadChangeEvent",
    "/data/TaskChangeEvent",
    "/data/EmailMessageChangeEvent",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Process configuration, assembled from the environment with CLI
/// overrides applied on top.
pub struct AppConfig {
    pub gateway_url: String,
    pub gateway_token: SecretString,
    pub sink_url: String,
    pub sink_token: SecretString,
    pub db_path: PathBuf,
    pub channels: Vec<Channel>,
    pub source: SourceConfig,
    pub dispatch: DispatchConfig,
    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let gateway_url = require("PULSE_GATEWAY_URL")?;
        let gateway_token = SecretString::from(require("PULSE_GATEWAY_TOKEN")?);
        let sink_url = optional("PULSE_SINK_URL").unwrap_or_else(|| gateway_url.clone());
        // The sink usually shares the gateway's credential.
        let sink_token = optional("PULSE_SINK_TOKEN")
            .map(SecretString::from)
            .unwrap_or_else(|| gateway_token.clone());

        let db_path = optional("PULSE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("pulse.db"));

        let channels = match optional("PULSE_CHANNELS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Channel::new)
                .collect(),
            None => DEFAULT_CHANNELS.iter().copied().map(Channel::new).collect(),
        };

        let mut source = SourceConfig::default();
        if let Some(secs) = parse_secs("PULSE_POLL_INTERVAL_SECS")? {
            source.poll_interval = secs;
        }
        if let Some(secs) = parse_secs("PULSE_REPROBE_INTERVAL_SECS")? {
            source.reprobe_interval = secs;
        }
        source.poll_only = flag("PULSE_POLL_ONLY");

        Ok(Self {
            gateway_url,
            gateway_token,
            sink_url,
            sink_token,
            db_path,
            channels,
            source,
            dispatch: DispatchConfig::default(),
            log_json: !flag("PULSE_PLAIN_LOGS"),
        })
    }
}

pub fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".pulse")
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn flag(name: &str) -> bool {
    matches!(
        optional(name).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn parse_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match optional(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ConfigError::Invalid(name, e.to_string())),
        None => Ok(None),
    }
}
