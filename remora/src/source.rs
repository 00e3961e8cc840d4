//! Line-delimited JSON event source.
//!
//! The capture layer (or a replay of one) writes one serialized
//! [`SockEvent`] per line on the agent's stdin. Malformed lines are logged
//! and skipped so a single bad capture cannot stall the stream.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use remora_common::SockEvent;

use crate::{analyzer::NetworkAnalyzer, error::Result};

pub async fn run(analyzer: Arc<NetworkAnalyzer>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SockEvent>(&line) {
            Ok(evt) => analyzer.consume_event(evt).await?,
            Err(e) => warn!("skipping malformed event: {e}"),
        }
    }
    Ok(())
}
