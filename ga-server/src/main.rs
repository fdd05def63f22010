//! ga-server entry point.
//!
//! ```text
//! ga-server                  Run with ./ga-server.toml (or defaults)
//! ga-server --config <path>  Load a custom config TOML
//! ga-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ga_server::config::ServerConfig;
use ga_server::service::GaServerService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ga-server", about = "Streaming server with adaptive bitrate control")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ga-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", ServerConfig::default_toml()?);
        return Ok(());
    }

    let config = ServerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("ga-server v{}", env!("CARGO_PKG_VERSION"));
    info!("media UDP port: {}", config.network.transport_port);
    if config.control.enabled {
        info!("control TCP port: {}", config.control.port);
    }
    info!(
        "video: {}x{} @ {} fps, {} kbps",
        config.video.width, config.video.height, config.video.fps, config.encoder.bitrate_kbps
    );

    let service = GaServerService::new(config);
    let stop = service.shutdown_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    if let Err(e) = service.run().await {
        error!("{e}");
        std::process::exit(1);
    }

    Ok(())
}
