//! Record consumer seam and the built-in stdout consumer.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::analyzer::record::TransactionRecord;

/// Downstream sink for emitted transaction records. Implementations must
/// not assume ownership: records go back to the pool after fan-out.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, record: &TransactionRecord);

    /// Flush buffered output on agent shutdown.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints each record to stdout, mainly for demos and pipeline debugging.
pub struct StdoutConsumer {
    pub format: String,
}

#[async_trait]
impl Consumer for StdoutConsumer {
    async fn consume(&self, record: &TransactionRecord) {
        match self.format.as_str() {
            "json" | "full" => {
                debug!("using json pretty format");
                match serde_json::to_string_pretty(record) {
                    Ok(json) => println!("{json}"),
                    Err(e) => error!("error serializing record to json: {e}"),
                }
            }
            "json-compact" | "compact" => match serde_json::to_string(record) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("error serializing record to json: {e}"),
            },
            "pretty" => {
                println!("{record:#?}");
            }
            _ => {
                debug!("using default debug format for format: '{}'", self.format);
                println!("{record:?}");
            }
        }
    }
}
