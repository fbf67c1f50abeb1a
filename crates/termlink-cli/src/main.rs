//! termlink CLI entry point.

mod args;
mod client;
mod config;
mod daemon;

use clap::Parser;
use tracing::{error, info};

use crate::args::{Cli, Commands};
use crate::config::{ClientConfig, ServerConfig};
use crate::daemon::Server;

/// Exit code when the process is terminated by an interrupt signal
/// (shell convention: 128 + SIGINT).
const EXIT_INTERRUPT: i32 = 130;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve(args) => run_server(ServerConfig::resolve(
            args.host, args.port, args.token, args.shell,
        )),
        Commands::Connect(args) => run_client(ClientConfig::resolve(
            args.host, args.port, args.token, args.cmd,
        )),
    };
    std::process::exit(code);
}

/// Run the daemon until an interrupt or termination signal arrives, then
/// drain in-flight connections.
fn run_server(config: ServerConfig) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to create tokio runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async {
        let server = match Server::bind(config).await {
            Ok(server) => server,
            Err(e) => {
                error!("failed to start daemon: {:#}", e);
                return 1;
            }
        };

        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("interrupt received, shutting down");
            shutdown.notify_waiters();
        });

        match server.run().await {
            // The accept loop only ends when a signal asked it to.
            Ok(()) => EXIT_INTERRUPT,
            Err(e) => {
                error!("daemon error: {:#}", e);
                1
            }
        }
    })
}

/// Run the client bridge; an external interrupt cancels the bridge, which
/// restores the terminal on its way down.
fn run_client(config: ClientConfig) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to create tokio runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async {
        tokio::select! {
            result = client::bridge::run(config) => match result {
                Ok(code) => code,
                Err(e) => {
                    error!("{:#}", e);
                    1
                }
            },
            _ = tokio::signal::ctrl_c() => EXIT_INTERRUPT,
        }
    })
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm() => {}
    }
}

/// Wait for SIGTERM (Unix only).
///
/// If registration fails, logs a warning and waits forever; the daemon
/// then only responds to SIGINT.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM does not exist off Unix; never resolves.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
