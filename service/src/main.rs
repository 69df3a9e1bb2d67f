//! Mint/redeem service.
//!
//! Reads one JSON command per line on stdin and answers each with a JSON
//! line on stdout:
//!
//! ```text
//! {"operation": "mint", "amount": 10.50, "recipient": "0xnotdeadbeef"}
//! {"operation": "status", "id": "6f0c…"}
//! ```
//!
//! Logs go to stderr.

use mint_redeem::api;
use mint_redeem::bootstrap::Dependencies;
use mint_redeem::config::Config;
use settlement_runtime::metrics::MetricsServer;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mint_redeem=info,settlement_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting mint/redeem service");

    let config = Config::from_env();
    info!(
        provider = %config.settlement.provider,
        task_queue = %config.engine.task_queue,
        workers = config.engine.workers,
        persistent = config.database.url.is_some(),
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr).start()?;
    }

    let deps = Dependencies::build(config).await?;
    let recovered = deps.engine.start().await?;
    info!(recovered, "Ready for commands on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response =
                    api::dispatch(&deps.intake, deps.store.as_ref(), line.as_bytes()).await;
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
                stdout.flush().await?;
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Runs still queued stay open and are recovered on the next start.
    deps.engine
        .shutdown(Duration::from_secs(deps.config.engine.shutdown_timeout_secs))
        .await?;

    info!("Service stopped");
    Ok(())
}
