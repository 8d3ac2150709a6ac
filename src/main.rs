// SPDX-License-Identifier: Apache-2.0

//! FinchDB server binary: loads configuration, assembles the network
//! front-end, and runs until interrupted.

mod server;
mod thread_task;

use clap::Parser;
use finchdb_config::{ExecutorMode, ServerConfig};
use server::Server;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "finchdb", about = "FinchDB network front-end server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the ingress bind address.
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Override the executor mode.
    #[arg(long, value_parser = ["synchronous", "adaptive"])]
    executor_mode: Option<String>,
}

fn load_config(cli: &Cli) -> Result<ServerConfig, finchdb_config::Error> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.net.bind_address = bind.clone();
    }
    if let Some(mode) = &cli.executor_mode {
        config.executor.mode = match mode.as_str() {
            "synchronous" => ExecutorMode::Synchronous,
            _ => ExecutorMode::Adaptive,
        };
    }
    config.validate()?;
    Ok(config)
}

/// Blocks until SIGINT/SIGTERM-style interruption (ctrl-c).
fn wait_for_interrupt() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    match runtime {
        Ok(runtime) => {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::error!("failed to listen for interrupt; parking forever");
                    std::future::pending::<()>().await;
                }
            });
        }
        Err(error) => {
            tracing::error!(%error, "failed to build signal runtime; parking forever");
            loop {
                std::thread::park();
            }
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    let server = match Server::start(&config) {
        Ok(server) => server,
        Err(error) => {
            tracing::error!(%error, "failed to start server");
            return ExitCode::from(1);
        }
    };

    wait_for_interrupt();

    match server.shutdown() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "shutdown did not complete cleanly");
            ExitCode::from(3)
        }
    }
}
