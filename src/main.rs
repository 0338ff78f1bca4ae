//! amqp-bridge entry point

use amqp_bridge::api;
use amqp_bridge::bridge::Bridge;
use amqp_bridge::config::BridgeConfig;
use amqp_bridge::observability::logging::{init_default_logging, init_logging, parse_level, LogFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::{error, info, warn, Level};

const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP to AMQP bridge with publisher confirms and explicit acknowledgment
#[derive(Parser)]
#[command(name = "amqp-bridge")]
#[command(about = "HTTP to AMQP bridge with publisher confirms")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge and its HTTP server
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_default_logging();
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let level = match cli.verbose {
        0 => parse_level(&config.logging.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    init_logging(
        level,
        LogFormat::parse(&config.logging.format),
        config.logging.spans,
    );

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.masked_broker_url(),
        "Starting amqp-bridge"
    );

    let addr = config.listen_addr()?;
    let bridge = Bridge::connect(config).await;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(api::serve(bridge.clone(), addr, async move {
        let _ = stop_rx.await;
    }));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        joined = &mut server => {
            bridge.shutdown().await;
            return match joined {
                Ok(Ok(())) => Err("HTTP server stopped unexpectedly".into()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    let _ = stop_tx.send(());
    let report = bridge.shutdown().await;
    if !report.is_clean() {
        warn!(
            errors = report.errors.len(),
            forced = report.forced,
            in_flight_abandoned = report.in_flight_abandoned,
            "Shutdown finished with problems"
        );
    }

    match tokio::time::timeout(SERVER_STOP_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
        Ok(Err(e)) => error!("HTTP server task failed: {}", e),
        Err(_) => warn!("HTTP server did not stop within {:?}", SERVER_STOP_TIMEOUT),
    }

    info!("amqp-bridge stopped");
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");
    if show {
        println!("{}", config.to_display_toml()?);
    }
    Ok(())
}
