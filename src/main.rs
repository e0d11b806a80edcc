use market_sync::{run, SyncConfigArgs};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_SYMBOLS: [&str; 3] = ["AAPL", "MSFT", "TSLA"];

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,market_sync=debug")),
        )
        .init();

    let config = match SyncConfigArgs::from_env().and_then(SyncConfigArgs::normalize) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            std::process::exit(2);
        }
    };

    let mut symbols: Vec<String> = std::env::args().skip(1).collect();
    if symbols.is_empty() {
        symbols = DEFAULT_SYMBOLS.iter().map(|symbol| symbol.to_string()).collect();
    }
    info!(?symbols, "starting market-sync");

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for ctrl-c");
        }
    };

    if let Err(error) = run(config, symbols, shutdown).await {
        error!(%error, "market-sync stopped with an error");
        std::process::exit(1);
    }
    info!("market-sync stopped");
}
