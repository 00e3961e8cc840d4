mod analyzer;
mod conntrack;
mod consumers;
mod error;
mod metrics;
mod runtime;
mod source;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use crate::{
    analyzer::NetworkAnalyzer,
    conntrack::{Conntracker, DisabledConntracker},
    consumers::{Consumer, StdoutConsumer},
    error::Result,
    runtime::{cli::Cli, conf::AppProps},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (conf, _cli) = AppProps::new(cli)?;

    tracing_subscriber::fmt()
        .with_max_level(conf.log_level)
        .init();
    metrics::registry::init_registry();

    if conf.analyzer.enable_conntrack {
        // the netlink conntrack backend ships separately; without it DNAT
        // labels stay empty
        info!(
            "conntrack enabled, proc root: {}, rate limit: {}/s, max state: {}",
            conf.analyzer.conntrack.proc_root,
            conf.analyzer.conntrack.rate_limit,
            conf.analyzer.conntrack.max_state_size,
        );
    }
    let conntracker: Arc<dyn Conntracker> = Arc::new(DisabledConntracker);

    let consumers: Vec<Arc<dyn Consumer>> = vec![Arc::new(StdoutConsumer {
        format: "json-compact".to_string(),
    })];

    let analyzer = Arc::new(NetworkAnalyzer::new(
        conf.analyzer.clone(),
        conntracker,
        consumers.clone(),
    ));
    analyzer.start();
    info!(
        "analyzer started, consuming {} syscall kinds",
        NetworkAnalyzer::consumable_events().len()
    );

    tokio::select! {
        result = source::run(analyzer.clone()) => {
            result?;
            info!("event source drained");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl+c, shutting down");
        }
    }

    analyzer.shutdown();
    for consumer in &consumers {
        if let Err(e) = consumer.shutdown().await {
            error!("consumer shutdown failed: {e}");
        }
    }
    Ok(())
}
