use clap::Parser;
use std::path::PathBuf;
use tcpflood::{logging, metrics, Listener};
use tcpflood_common::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "listener", about = "Accepts TCP connections and reports them per epoch")]
struct Args {
    /// Listen address (host:port)
    #[arg(long)]
    addr: Option<String>,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.listener.addr = addr;
    }
    logging::init(config.logging.format);

    let master_token = CancellationToken::new();

    if config.metrics.enabled {
        let port = config.metrics.port;
        let metrics_token = master_token.clone();
        tokio::spawn(async move {
            metrics::serve(port, metrics_token).await;
        });
    }

    let listener = match Listener::bind(config.listener.clone()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Listener failed to start");
            return Err(e.into());
        }
    };
    info!(
        listen_addr = %listener.local_addr()?,
        grace_period_ms = config.listener.grace_period_ms,
        greeting_replies_per_epoch = config.listener.greeting_replies_per_epoch,
        "Listener started"
    );

    let run = tokio::spawn(listener.run(master_token.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    master_token.cancel();
    run.await?;

    Ok(())
}
