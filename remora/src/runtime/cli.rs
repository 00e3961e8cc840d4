use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::conf::conf_serde::level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "remora.yaml").
    #[arg(short, long, value_name = "FILE", env = "REMORA_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(short, long, value_name = "LEVEL", env = "REMORA_LOG_LEVEL")]
    #[serde(with = "level::option", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<Level>,
}
