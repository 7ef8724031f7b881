//! `imgforged`: the build orchestrator daemon and CLI entry point,
//! grounded in `mvm-runtime`'s `mvm-hostd` binary — a `clap::Parser` over
//! a `Serve` subcommand, `tracing_subscriber` JSON logging gated by
//! `RUST_LOG`, and a manually built `tokio` runtime.

use std::sync::Arc;

use clap::Parser;
use imgforge_cli::{Cli, Command};
use imgforge_orchestrator::BuildOrchestrator;
use imgforged::stub::{UnimplementedImages, UnimplementedInstances, UnimplementedSecrets, UnimplementedVolumes};
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { config } => serve(config).await,
        other => imgforge_cli::run_client_command(cli.socket, other).await,
    }
}

async fn serve(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => imgforge_orchestrator::BuildDaemonConfig::load(&path)?,
        None => imgforge_orchestrator::BuildDaemonConfig::default(),
    };
    let socket_path = config.socket_path.clone();

    let orch = BuildOrchestrator::new(
        config,
        UnimplementedInstances,
        UnimplementedVolumes,
        UnimplementedSecrets,
        UnimplementedImages,
    )?;

    imgforge_cli::server::serve(Arc::clone(&orch), &socket_path).await
}
