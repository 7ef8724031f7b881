//! Daemon-side control socket, grounded in `mvm`'s `src/hostd/server.rs`:
//! remove a stale socket, bind, tighten permissions, accept in a loop, and
//! hand each connection to its own task. Every connection reads exactly one
//! [`DaemonRequest`]; a [`DaemonRequest::Stream`] then switches that
//! connection to a one-way event feed instead of a single response.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use imgforge_orchestrator::{BuildOrchestrator, ImageStore, InstanceManager, SecretProvider, VolumeManager};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, instrument, warn};

use crate::protocol::{self, DaemonRequest, DaemonResponse};

/// Bind `socket_path` and serve control connections until an accept error
/// aborts the loop. Runs startup recovery (spec §4.F-7) before accepting
/// any connection.
pub async fn serve<I, V, Sec, Img>(
    orch: Arc<BuildOrchestrator<I, V, Sec, Img>>,
    socket_path: &Path,
) -> anyhow::Result<()>
where
    I: InstanceManager + 'static,
    V: VolumeManager + 'static,
    Sec: SecretProvider + 'static,
    Img: ImageStore + 'static,
{
    let _ = std::fs::remove_file(socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating control socket directory {}", parent.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding control socket at {}", socket_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("setting permissions on {}", socket_path.display()))?;
    }
    info!(socket = %socket_path.display(), "imgforged control socket listening");

    orch.recover().await.context("startup recovery")?;

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let orch = Arc::clone(&orch);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, orch).await {
                        warn!(error = %e, "control connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept control connection");
                return Err(e).context("accept loop aborted");
            }
        }
    }
}

#[instrument(skip_all)]
async fn handle_connection<I, V, Sec, Img>(
    stream: UnixStream,
    orch: Arc<BuildOrchestrator<I, V, Sec, Img>>,
) -> anyhow::Result<()>
where
    I: InstanceManager + 'static,
    V: VolumeManager + 'static,
    Sec: SecretProvider + 'static,
    Img: ImageStore + 'static,
{
    let (read_half, write_half) = stream.into_split();
    let mut writer = write_half;
    let mut reader = BufReader::new(read_half);

    let request = protocol::recv_request(&mut reader).await?;
    if let DaemonRequest::Stream { id, follow } = request {
        let mut rx = orch.stream(id, follow, imgforge_core::BuildContext::detached());
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        return Ok(());
    }

    let response = dispatch(&orch, request).await;
    protocol::send_response(&mut writer, &response).await?;
    Ok(())
}

async fn dispatch<I, V, Sec, Img>(
    orch: &Arc<BuildOrchestrator<I, V, Sec, Img>>,
    request: DaemonRequest,
) -> DaemonResponse
where
    I: InstanceManager + 'static,
    V: VolumeManager + 'static,
    Sec: SecretProvider + 'static,
    Img: ImageStore + 'static,
{
    use base64::{engine::general_purpose::STANDARD, Engine};

    match request {
        DaemonRequest::Submit { request, source_b64 } => match STANDARD.decode(source_b64) {
            Ok(source) => match orch.create_build(request, source).await {
                Ok(build) => DaemonResponse::Build { build },
                Err(e) => DaemonResponse::Error { message: e.to_string() },
            },
            Err(e) => DaemonResponse::Error { message: format!("invalid base64 source: {e}") },
        },
        DaemonRequest::Get { id } => match orch.get(&id).await {
            Ok(build) => DaemonResponse::Build { build },
            Err(e) => DaemonResponse::Error { message: e.to_string() },
        },
        DaemonRequest::List => match orch.list().await {
            Ok(builds) => DaemonResponse::Builds { builds },
            Err(e) => DaemonResponse::Error { message: e.to_string() },
        },
        DaemonRequest::Cancel { id } => match orch.cancel(&id).await {
            Ok(()) => DaemonResponse::Ok,
            Err(e) => DaemonResponse::Error { message: e.to_string() },
        },
        DaemonRequest::Logs { id } => match orch.logs(&id).await {
            Ok(bytes) => DaemonResponse::Logs { content_b64: STANDARD.encode(bytes) },
            Err(e) => DaemonResponse::Error { message: e.to_string() },
        },
        DaemonRequest::Stream { .. } => {
            unreachable!("Stream requests are handled in handle_connection before dispatch")
        }
    }
}
