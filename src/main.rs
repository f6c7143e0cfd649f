//! Sockspan - SOCKS5 Proxy Relay
//!
//! Entry point: parse arguments, load configuration, start every configured
//! listener, and run until a shutdown signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use sockspan::config::load_config;
use sockspan::socks::SocksServer;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Sockspan - SOCKS5 proxy relay with direct or chained upstreams
#[derive(Parser, Debug)]
#[command(name = "sockspan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;

    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    setup_logging(level, args.json_log)?;

    info!("Sockspan v{}", sockspan::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    // Bind everything up front so startup failures exit non-zero
    let mut servers = Vec::new();
    for server_config in &config.servers {
        let server = SocksServer::from_config(server_config).with_context(|| {
            format!(
                "failed to set up server at {}:{}",
                server_config.address, server_config.port
            )
        })?;
        let acceptor = server.bind().await?;
        servers.push((server, acceptor));
    }

    let mut tasks = JoinSet::new();
    for (server, acceptor) in servers {
        tasks.spawn(async move { server.serve(acceptor).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
        result = tasks.join_next() => {
            // Listeners run forever; one returning means it broke
            match result {
                Some(Ok(Err(e))) => {
                    error!("server failed: {:#}", e);
                    Err(e)
                }
                Some(Err(e)) => Err(e).with_context(|| "server task panicked"),
                _ => Ok(()),
            }
        }
    }
}

/// Wait for Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}

/// Install the global tracing subscriber.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
