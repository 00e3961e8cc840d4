use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::runtime::{
    cli::Cli,
    conf::conf_serde::{duration, level},
};
use remora_protocols::http::UrlClusterMethod;

/// Fully resolved application configuration.
///
/// Priority order: Defaults < Configuration file < Environment variables
/// (`REMORA_` prefix) < CLI arguments.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppProps {
    /// The logging level for the application.
    #[serde(with = "level")]
    pub log_level: Level,

    /// Analyzer pipeline settings.
    pub analyzer: AnalyzerConf,

    #[serde(skip)]
    #[allow(dead_code)]
    config_path: Option<PathBuf>,
}

impl AppProps {
    pub fn new(cli: Cli) -> Result<(Self, Cli), ConfError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment
            .merge(Env::prefixed("REMORA_").split("__"))
            .merge(Serialized::defaults(&cli));

        let raw: Conf = figment.extract()?;

        let conf = Self {
            log_level: raw.log_level,
            analyzer: raw.analyzer,
            config_path: config_path_to_store,
        };
        Ok((conf, cli))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Conf {
    #[serde(with = "level")]
    log_level: Level,
    analyzer: AnalyzerConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            analyzer: AnalyzerConf::default(),
        }
    }
}

/// Settings of the transaction analyzer.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyzerConf {
    /// Capacity of the bounded event channel between producers and the
    /// analyzer loop. Producers block when it is full.
    pub event_channel_size: usize,

    /// Resolve DNAT endpoints through conntrack before emitting records.
    pub enable_conntrack: bool,

    /// Conntrack backend options, used when `enable_conntrack` is set.
    pub conntrack: ConntrackConf,

    /// Run the periodic sweep that ages out stale flow state.
    pub enable_timeout_check: bool,

    /// How long connect retries on one fd keep merging into the same
    /// pending state before the old attempt is flushed as failed.
    #[serde(with = "duration")]
    pub connect_timeout: Duration,

    /// Dwell time after the last response before a kept-alive fd is
    /// considered done and its transaction emitted.
    #[serde(with = "duration")]
    pub fd_reuse_timeout: Duration,

    /// Dwell time after the last request before the response is declared
    /// missing.
    #[serde(with = "duration")]
    pub no_response_threshold: Duration,

    /// Global latency threshold marking a transaction slow. Per-protocol
    /// thresholds in `protocol_configs` take precedence when set.
    #[serde(with = "duration")]
    pub response_slow_threshold: Duration,

    /// Protocols enabled for discovery, probed in order.
    pub protocol_parser: Vec<String>,

    /// Per-protocol overrides: static ports, slow threshold, payload length.
    pub protocol_configs: Vec<ProtocolConf>,

    /// How HTTP URL paths collapse into endpoint labels.
    pub url_clustering_method: UrlClusterMethod,
}

impl Default for AnalyzerConf {
    fn default() -> Self {
        Self {
            event_channel_size: defaults::event_channel_size(),
            enable_conntrack: false,
            conntrack: ConntrackConf::default(),
            enable_timeout_check: true,
            connect_timeout: defaults::connect_timeout(),
            fd_reuse_timeout: defaults::fd_reuse_timeout(),
            no_response_threshold: defaults::no_response_threshold(),
            response_slow_threshold: defaults::response_slow_threshold(),
            protocol_parser: defaults::protocol_parser(),
            protocol_configs: Vec::new(),
            url_clustering_method: UrlClusterMethod::default(),
        }
    }
}

/// Per-protocol operator overrides.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConf {
    /// Protocol name the override applies to.
    pub key: String,
    /// Ports statically mapped to this protocol, bypassing discovery.
    pub ports: Vec<u16>,
    /// Slow threshold for this protocol; zero falls back to the global one.
    #[serde(with = "duration")]
    pub threshold: Duration,
    /// Payload bytes rendered into record labels; zero keeps the default.
    pub payload_length: usize,
    /// Exclude this protocol from the discovery probe list.
    pub disable_discern: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConntrackConf {
    pub proc_root: String,
    pub rate_limit: u32,
    pub max_state_size: usize,
}

impl Default for ConntrackConf {
    fn default() -> Self {
        Self {
            proc_root: "/proc".to_string(),
            rate_limit: 500,
            max_state_size: 130_000,
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn event_channel_size() -> usize {
        10_000
    }
    pub fn connect_timeout() -> Duration {
        Duration::from_secs(100)
    }
    pub fn fd_reuse_timeout() -> Duration {
        Duration::from_secs(15)
    }
    pub fn no_response_threshold() -> Duration {
        Duration::from_secs(120)
    }
    pub fn response_slow_threshold() -> Duration {
        Duration::from_millis(500)
    }
    pub fn protocol_parser() -> Vec<String> {
        vec!["http".to_string(), "dns".to_string()]
    }
}

fn validate_config_path(path: &Path) -> Result<(), ConfError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        }
        return Err(ConfError::NoConfigFile);
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfError::InvalidExtension(ext.to_string())),
        None => Err(ConfError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug, Error)]
pub enum ConfError {
    /// The specified configuration file does not exist.
    #[error("no config file provided")]
    NoConfigFile,

    /// The path exists but is not a file.
    #[error("path '{0}' is not a valid file")]
    InvalidConfigPath(String),

    /// The file has an unsupported extension.
    #[error("invalid file extension '.{0}' - expected 'yaml' or 'yml'")]
    InvalidExtension(String),

    /// Deserialization or merge failure.
    #[error("configuration error: {0}")]
    Extraction(#[source] Box<figment::Error>),
}

impl From<figment::Error> for ConfError {
    fn from(e: figment::Error) -> Self {
        ConfError::Extraction(Box::new(e))
    }
}

pub mod conf_serde {
    pub mod level {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use tracing::Level;

        pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(level.as_str())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse::<Level>().map_err(serde::de::Error::custom)
        }

        pub mod option {
            use super::*;

            pub fn serialize<S>(level: &Option<Level>, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                match level {
                    Some(l) => serializer.serialize_str(l.as_str()),
                    None => serializer.serialize_none(),
                }
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Level>, D::Error>
            where
                D: Deserializer<'de>,
            {
                let opt = Option::<String>::deserialize(deserializer)?;
                match opt {
                    Some(s) => s
                        .parse::<Level>()
                        .map(Some)
                        .map_err(serde::de::Error::custom),
                    None => Ok(None),
                }
            }
        }
    }

    pub mod duration {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }
    }
}
