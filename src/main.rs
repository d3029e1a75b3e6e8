use fcache::config::Config;
use fcache::server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line args
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_args(&args);

    let default_level = config
        .loglevel
        .parse()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .init();

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            on_signal.cancel();
        }
    });

    if let Err(e) = server::run_server(config, shutdown).await {
        error!("Fatal startup error: {e}");
        std::process::exit(1);
    }
}
