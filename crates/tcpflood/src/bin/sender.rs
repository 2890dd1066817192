use clap::Parser;
use std::path::PathBuf;
use tcpflood::sender::{self, LoadRequest, Sender};
use tcpflood::{logging, metrics};
use tcpflood_common::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sender", about = "Drives TCP connection load against a listener")]
struct Args {
    /// Target address (host:port)
    #[arg(long)]
    addr: Option<String>,

    /// Open N greeting connections at once
    #[arg(long, default_value_t = 0)]
    burst: u64,

    /// Bytes to read in stream mode (0 = until the peer closes)
    #[arg(long, default_value_t = 0)]
    cap: u64,

    /// Load-mode connections per second (0 = as fast as possible)
    #[arg(long, default_value_t = 128)]
    hertz: u64,

    /// Issue connections continuously until interrupted
    #[arg(long)]
    load: bool,

    /// Open one connection and read a byte stream
    #[arg(long)]
    stream: bool,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.sender.addr = addr;
    }
    logging::init(config.logging.format);

    let request = LoadRequest {
        burst: args.burst,
        cap: args.cap,
        hertz: args.hertz,
        load: args.load,
        stream: args.stream,
    };
    if request.is_empty() {
        warn!("No mode enabled; pass --burst <N>, --stream or --load");
        return Ok(());
    }

    let target = match sender::resolve(&config.sender.addr).await {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "Target resolution failed");
            return Err(e.into());
        }
    };

    let master_token = CancellationToken::new();

    if config.metrics.enabled {
        let port = config.metrics.port;
        let metrics_token = master_token.clone();
        tokio::spawn(async move {
            metrics::serve(port, metrics_token).await;
        });
    }

    let signal_token = master_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    let sender = Sender::new(target, request, config.sender.clone());
    let report = sender.run(master_token.clone()).await;
    master_token.cancel();

    println!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}
