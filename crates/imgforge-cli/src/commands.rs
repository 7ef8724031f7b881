//! CLI surface, grounded in `mvm-cli`'s `clap::Parser`/`Subcommand`
//! structure (`mvm-cli/src/commands.rs`). Every subcommand but `Serve`
//! talks to a running `imgforged` over the control socket; `Serve` is
//! handled by the caller (the `imgforged` binary), since it needs concrete
//! collaborator implementations this crate has no business constructing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use imgforge_core::{BuildRequest, NetworkMode};
use sha2::{Digest, Sha256};

use crate::client::client_for;
use crate::display;
use crate::protocol::{DaemonRequest, DaemonResponse};

#[derive(Debug, Parser)]
#[command(name = "imgforged", version, about = "Multi-tenant source-to-image build orchestrator")]
pub struct Cli {
    /// Control socket path. Defaults to the daemon's own default.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a new build from a local source archive.
    Submit {
        /// Path to a tarball of the source directory.
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        container_definition: Option<String>,
        #[arg(long)]
        base_image_digest: Option<String>,
        #[arg(long = "build-arg", value_parser = parse_key_val)]
        build_args: Vec<(String, String)>,
        #[arg(long = "secret")]
        secret_refs: Vec<String>,
        #[arg(long)]
        cache_scope: Option<String>,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        #[arg(long)]
        memory_bytes: Option<u64>,
        #[arg(long)]
        vcpus: Option<u32>,
        #[arg(long, value_enum)]
        network_mode: Option<NetworkModeArg>,
    },
    /// Look up a single build.
    Get { id: String },
    /// List every known build.
    List,
    /// Cancel a queued or running build.
    Cancel { id: String },
    /// Print a build's accumulated log.
    Logs { id: String },
    /// Stream a build's merged log/status feed.
    Events {
        id: String,
        /// Keep streaming until a terminal status instead of stopping once
        /// existing log lines have been replayed.
        #[arg(long)]
        follow: bool,
    },
    /// Run the daemon in the foreground (handled by the caller binary, not
    /// this crate — it needs concrete hypervisor/volume/secret/image-store
    /// implementations that are out of scope here).
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum NetworkModeArg {
    Isolated,
    Egress,
}

impl From<NetworkModeArg> for NetworkMode {
    fn from(value: NetworkModeArg) -> Self {
        match value {
            NetworkModeArg::Isolated => NetworkMode::Isolated,
            NetworkModeArg::Egress => NetworkMode::Egress,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    Ok((k.to_string(), v.to_string()))
}

/// Run every subcommand except [`Command::Serve`], which the caller must
/// handle itself.
pub async fn run_client_command(socket: Option<PathBuf>, command: Command) -> anyhow::Result<()> {
    let client = client_for(socket.as_deref());

    match command {
        Command::Submit {
            source,
            container_definition,
            base_image_digest,
            build_args,
            secret_refs,
            cache_scope,
            timeout_seconds,
            memory_bytes,
            vcpus,
            network_mode,
        } => {
            let source_bytes = std::fs::read(&source)
                .with_context(|| format!("reading source archive {}", source.display()))?;
            let source_hash = format!("{:x}", Sha256::digest(&source_bytes));
            let request = BuildRequest {
                source_hash,
                container_definition,
                base_image_digest,
                build_args: build_args.into_iter().collect::<BTreeMap<_, _>>(),
                secret_refs,
                cache_scope,
                policy: imgforge_core::policy::PolicyInput {
                    timeout_seconds,
                    memory_bytes,
                    vcpus,
                    network_mode: network_mode.map(Into::into),
                    egress_allowlist: None,
                },
            };
            let response = client
                .send(&DaemonRequest::Submit {
                    request,
                    source_b64: STANDARD.encode(&source_bytes),
                })
                .await?;
            handle_build_response(response)
        }
        Command::Get { id } => {
            let response = client.send(&DaemonRequest::Get { id }).await?;
            handle_build_response(response)
        }
        Command::List => {
            let response = client.send(&DaemonRequest::List).await?;
            match response {
                DaemonResponse::Builds { builds } => {
                    display::print_build_table(&builds);
                    Ok(())
                }
                DaemonResponse::Error { message } => anyhow::bail!(message),
                other => anyhow::bail!("unexpected daemon response: {other:?}"),
            }
        }
        Command::Cancel { id } => {
            let response = client.send(&DaemonRequest::Cancel { id }).await?;
            match response {
                DaemonResponse::Ok => {
                    println!("cancelled");
                    Ok(())
                }
                DaemonResponse::Error { message } => anyhow::bail!(message),
                other => anyhow::bail!("unexpected daemon response: {other:?}"),
            }
        }
        Command::Logs { id } => {
            let response = client.send(&DaemonRequest::Logs { id }).await?;
            match response {
                DaemonResponse::Logs { content_b64 } => {
                    let bytes = STANDARD.decode(content_b64).context("decoding log content")?;
                    std::io::Write::write_all(&mut std::io::stdout(), &bytes)?;
                    Ok(())
                }
                DaemonResponse::Error { message } => anyhow::bail!(message),
                other => anyhow::bail!("unexpected daemon response: {other:?}"),
            }
        }
        Command::Events { id, follow } => {
            client
                .stream(id, follow, |event| match event {
                    imgforge_events::Event::Log { line, .. } => println!("{line}"),
                    imgforge_events::Event::Status { new_state, ts } => {
                        println!("[{ts}] status: {new_state}")
                    }
                    imgforge_events::Event::Heartbeat { .. } => {}
                })
                .await
        }
        Command::Serve { .. } => {
            anyhow::bail!("Serve must be handled by the caller, not run_client_command")
        }
    }
}

fn handle_build_response(response: DaemonResponse) -> anyhow::Result<()> {
    match response {
        DaemonResponse::Build { build } => {
            display::print_build(&build);
            Ok(())
        }
        DaemonResponse::Error { message } => anyhow::bail!(message),
        other => anyhow::bail!("unexpected daemon response: {other:?}"),
    }
}
