use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use imgforge_core::{BuildContext, BuildResult};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::warn;

use crate::handshake::{self, HandshakeError, BUILD_AGENT_PORT};
use crate::protocol::{self, GuestMessage, HostMessage, ProtocolError};

/// Connect retry budget (spec §4.E "Connect loop").
pub const CONNECT_MAX_ATTEMPTS: u32 = 30;
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Observed state of the builder VM, as reported by the external
/// hypervisor collaborator (spec §6 "Instance manager: get(id) -> state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRunState {
    Running,
    Stopped,
    Shutdown,
    Other,
}

/// The slice of the external instance-manager contract the connect loop
/// needs: "is the VM still alive?"
#[allow(async_fn_in_trait)]
pub trait InstanceStateProbe {
    async fn state(&self, instance_id: &str) -> anyhow::Result<InstanceRunState>;
}

/// The slice of the external secret-provider contract the host loop needs
/// to satisfy `get_secrets` (spec §4.E, §6). Missing ids are simply
/// absent from the returned map — never an error.
#[allow(async_fn_in_trait)]
pub trait SecretProvider {
    async fn get_secrets(&self, ids: &[String]) -> anyhow::Result<BTreeMap<String, String>>;
}

#[derive(Debug, Error)]
pub enum VsockError {
    #[error("builder stopped unexpectedly before the handshake completed")]
    BuilderStopped,
    #[error("build cancelled")]
    Cancelled,
    #[error("build deadline exceeded")]
    Expired,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("vsock connection closed before a build_result was received")]
    UnexpectedEof,
}

impl VsockError {
    pub fn kind(&self) -> imgforge_core::ErrorKind {
        match self {
            Self::Cancelled => imgforge_core::ErrorKind::BuildCancelled,
            Self::Expired => imgforge_core::ErrorKind::BuildTimeout,
            _ => imgforge_core::ErrorKind::BuilderUnreachable,
        }
    }
}

/// Retry the handshake against `socket_path` up to [`CONNECT_MAX_ATTEMPTS`]
/// times, [`CONNECT_RETRY_INTERVAL`] apart. Between attempts, probes the
/// VM's state; a `Stopped`/`Shutdown` VM ends the loop immediately with
/// [`VsockError::BuilderStopped`] rather than exhausting the retry budget.
/// `ctx` cancellation ends the loop immediately with
/// [`VsockError::Cancelled`]; `ctx` expiring ends it with
/// [`VsockError::Expired`] (spec §5: the build deadline propagates to the
/// connect loop).
pub async fn connect_loop<P: InstanceStateProbe>(
    socket_path: &Path,
    instance_id: &str,
    probe: &P,
    ctx: &BuildContext,
) -> Result<BufReader<UnixStream>, VsockError> {
    for attempt in 1..=CONNECT_MAX_ATTEMPTS {
        if ctx.is_cancelled() {
            return Err(VsockError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = ctx.expired() => return Err(VsockError::Expired),
            result = UnixStream::connect(socket_path) => match result {
                Ok(stream) => match handshake::handshake(stream, BUILD_AGENT_PORT).await {
                    Ok(reader) => return Ok(reader),
                    Err(e) => warn!(attempt, error = %e, "vsock handshake attempt failed"),
                },
                Err(e) => warn!(attempt, error = %e, "vsock connect attempt failed"),
            },
        }

        match probe.state(instance_id).await {
            Ok(InstanceRunState::Stopped) | Ok(InstanceRunState::Shutdown) => {
                return Err(VsockError::BuilderStopped);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "instance state probe failed, will retry"),
        }

        if attempt == CONNECT_MAX_ATTEMPTS {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(CONNECT_RETRY_INTERVAL) => {}
            _ = ctx.cancelled() => return Err(VsockError::Cancelled),
            _ = ctx.expired() => return Err(VsockError::Expired),
        }
    }

    Err(VsockError::BuilderStopped)
}

/// Drive the host side of the protocol to completion: send `host_ready`,
/// then dispatch every guest message until `build_result` arrives.
/// `on_log` is called for every streamed `log` message. Cancellation of
/// `ctx` aborts the wait for the next message immediately — the pending
/// read is dropped (cancellation-safe for `read_line`) and the connection
/// closes when `reader` is dropped by the caller. `ctx` expiring does the
/// same but returns [`VsockError::Expired`] instead, so a guest that
/// completes the handshake and then never reports a result doesn't pin a
/// worker forever past its build deadline (spec §5, §7 `BuildTimeout`).
pub async fn run_host_loop<S: SecretProvider>(
    mut reader: BufReader<UnixStream>,
    secrets: &S,
    ctx: &BuildContext,
    mut on_log: impl FnMut(&str),
) -> Result<BuildResult, VsockError> {
    send(&mut reader, &HostMessage::HostReady).await?;

    loop {
        let mut line = String::new();
        tokio::select! {
            read_result = reader.read_line(&mut line) => {
                let n = read_result?;
                if n == 0 {
                    return Err(VsockError::UnexpectedEof);
                }
                match protocol::decode_guest_message(&line)? {
                    GuestMessage::GetSecrets { secret_ids } => {
                        let values = secrets.get_secrets(&secret_ids).await.unwrap_or_default();
                        send(&mut reader, &HostMessage::SecretsResponse { secrets: values }).await?;
                    }
                    GuestMessage::Log { log } => on_log(&log),
                    GuestMessage::BuildResult { result } => return Ok(*result),
                    GuestMessage::Unknown(ty) => {
                        warn!(message_type = %ty, "ignoring unrecognised vsock message type");
                    }
                }
            }
            _ = ctx.cancelled() => return Err(VsockError::Cancelled),
            _ = ctx.expired() => return Err(VsockError::Expired),
        }
    }
}

async fn send(reader: &mut BufReader<UnixStream>, message: &HostMessage) -> Result<(), VsockError> {
    let line = protocol::encode(message)?;
    reader.get_mut().write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedProbe(InstanceRunState);
    impl InstanceStateProbe for FixedProbe {
        async fn state(&self, _instance_id: &str) -> anyhow::Result<InstanceRunState> {
            Ok(self.0)
        }
    }

    struct FixedSecrets(BTreeMap<String, String>);
    impl SecretProvider for FixedSecrets {
        async fn get_secrets(&self, ids: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
            Ok(ids
                .iter()
                .filter_map(|id| self.0.get(id).map(|v| (id.clone(), v.clone())))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_host_loop_full_secrets_exchange() {
        let (host_side, guest_side) = UnixStream::pair().unwrap();
        let reader = BufReader::new(host_side);
        let ctx = BuildContext::detached();

        let mut store = BTreeMap::new();
        store.insert("a".to_string(), "1".to_string());
        store.insert("b".to_string(), "2".to_string());
        let secrets = FixedSecrets(store);

        let guest_task = tokio::spawn(async move {
            let mut guest = BufReader::new(guest_side);
            let mut line = String::new();
            guest.read_line(&mut line).await.unwrap();
            assert!(line.contains("host_ready"));

            guest
                .get_mut()
                .write_all(br#"{"type":"get_secrets","secret_ids":["a","b","missing"]}"#)
                .await
                .unwrap();
            guest.get_mut().write_all(b"\n").await.unwrap();

            let mut resp = String::new();
            guest.read_line(&mut resp).await.unwrap();
            assert!(resp.contains("\"a\":\"1\""));
            assert!(resp.contains("\"b\":\"2\""));
            assert!(!resp.contains("missing"));

            guest.get_mut().write_all(br#"{"type":"build_result","result":{"success":true,"image_digest":"sha256:deadbeef","logs":"","provenance":{},"duration_ms":5}}"#).await.unwrap();
            guest.get_mut().write_all(b"\n").await.unwrap();
        });

        let result = run_host_loop(reader, &secrets, &ctx, |_| {}).await.unwrap();
        guest_task.await.unwrap();

        assert!(result.success);
        assert_eq!(result.image_digest.as_deref(), Some("sha256:deadbeef"));
    }

    #[tokio::test]
    async fn test_host_loop_ignores_unknown_type_then_completes() {
        let (host_side, guest_side) = UnixStream::pair().unwrap();
        let reader = BufReader::new(host_side);
        let ctx = BuildContext::detached();
        let secrets = FixedSecrets(BTreeMap::new());

        let guest_task = tokio::spawn(async move {
            let mut guest = BufReader::new(guest_side);
            let mut line = String::new();
            guest.read_line(&mut line).await.unwrap();

            guest
                .get_mut()
                .write_all(b"{\"type\":\"future_feature\"}\n")
                .await
                .unwrap();
            guest.get_mut().write_all(br#"{"type":"build_result","result":{"success":false,"error":"boom","logs":"log line\n","provenance":{},"duration_ms":1}}"#).await.unwrap();
            guest.get_mut().write_all(b"\n").await.unwrap();
        });

        let result = run_host_loop(reader, &secrets, &ctx, |_| {}).await.unwrap();
        guest_task.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_host_loop_streams_logs() {
        let (host_side, guest_side) = UnixStream::pair().unwrap();
        let reader = BufReader::new(host_side);
        let ctx = BuildContext::detached();
        let secrets = FixedSecrets(BTreeMap::new());
        let log_count = Arc::new(AtomicU32::new(0));
        let log_count_clone = log_count.clone();

        let guest_task = tokio::spawn(async move {
            let mut guest = BufReader::new(guest_side);
            let mut line = String::new();
            guest.read_line(&mut line).await.unwrap();

            guest.get_mut().write_all(b"{\"type\":\"log\",\"log\":\"building...\"}\n").await.unwrap();
            guest.get_mut().write_all(br#"{"type":"build_result","result":{"success":true,"logs":"","provenance":{},"duration_ms":1}}"#).await.unwrap();
            guest.get_mut().write_all(b"\n").await.unwrap();
        });

        let result = run_host_loop(reader, &secrets, &ctx, |_| {
            log_count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        guest_task.await.unwrap();

        assert!(result.success);
        assert_eq!(log_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_host_loop_cancellation_aborts_wait() {
        let (host_side, _guest_side) = UnixStream::pair().unwrap();
        let reader = BufReader::new(host_side);
        let (ctx, handle) = BuildContext::with_timeout(Duration::from_secs(60));
        let secrets = FixedSecrets(BTreeMap::new());

        let wait = tokio::spawn(async move { run_host_loop(reader, &secrets, &ctx, |_| {}).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let result = wait.await.unwrap();
        assert!(matches!(result, Err(VsockError::Cancelled)));
    }

    #[tokio::test]
    async fn test_host_loop_expiry_aborts_wait() {
        let (host_side, _guest_side) = UnixStream::pair().unwrap();
        let reader = BufReader::new(host_side);
        let (ctx, _handle) = BuildContext::with_timeout(Duration::from_millis(20));
        let secrets = FixedSecrets(BTreeMap::new());

        let result = run_host_loop(reader, &secrets, &ctx, |_| {}).await;
        assert!(matches!(result, Err(VsockError::Expired)));
    }

    #[tokio::test]
    async fn test_connect_loop_stops_fast_on_vm_stopped() {
        let ctx = BuildContext::detached();
        let probe = FixedProbe(InstanceRunState::Stopped);
        let missing_socket = std::path::Path::new("/nonexistent/vsock.sock");

        let err = connect_loop(missing_socket, "i-1", &probe, &ctx).await.unwrap_err();
        assert!(matches!(err, VsockError::BuilderStopped));
    }

    #[tokio::test]
    async fn test_connect_loop_cancelled_before_first_attempt() {
        let (ctx, handle) = BuildContext::with_timeout(Duration::from_secs(60));
        handle.cancel();
        let probe = FixedProbe(InstanceRunState::Running);
        let missing_socket = std::path::Path::new("/nonexistent/vsock.sock");

        let err = connect_loop(missing_socket, "i-1", &probe, &ctx).await.unwrap_err();
        assert!(matches!(err, VsockError::Cancelled));
    }

    #[tokio::test]
    async fn test_connect_loop_expires_without_exhausting_retry_budget() {
        let (ctx, _handle) = BuildContext::with_timeout(Duration::from_millis(20));
        let probe = FixedProbe(InstanceRunState::Running);
        let missing_socket = std::path::Path::new("/nonexistent/vsock.sock");

        let err = connect_loop(missing_socket, "i-1", &probe, &ctx).await.unwrap_err();
        assert!(matches!(err, VsockError::Expired));
    }
}
