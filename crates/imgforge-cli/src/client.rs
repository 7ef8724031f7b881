//! CLI-side half of the control socket, grounded in `mvm-agent`'s
//! `HostdClient`: connect, send one request, read one response, and for
//! [`DaemonRequest::Stream`] keep reading until the daemon closes the
//! connection.

use std::path::Path;

use anyhow::Context;
use imgforge_events::Event;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{self, DaemonRequest, DaemonResponse};

pub struct DaemonClient {
    socket_path: std::path::PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<std::path::PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    async fn connect(&self) -> anyhow::Result<UnixStream> {
        UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "connecting to imgforged at {} (is the daemon running?)",
                    self.socket_path.display()
                )
            })
    }

    /// Send a request/response-shaped call and return the daemon's single
    /// reply. Not used for [`DaemonRequest::Stream`] — see [`Self::stream`].
    pub async fn send(&self, request: &DaemonRequest) -> anyhow::Result<DaemonResponse> {
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = write_half;
        let mut reader = BufReader::new(read_half);

        protocol::send_request(&mut writer, request).await?;
        writer.shutdown().await.context("shutting down write half")?;
        Ok(protocol::recv_response(&mut reader).await?)
    }

    /// Open a [`DaemonRequest::Stream`] connection and invoke `on_event` for
    /// each event the daemon forwards, until it closes the connection.
    pub async fn stream(
        &self,
        id: String,
        follow: bool,
        mut on_event: impl FnMut(Event),
    ) -> anyhow::Result<()> {
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = write_half;
        let mut reader = BufReader::new(read_half);

        protocol::send_request(&mut writer, &DaemonRequest::Stream { id, follow }).await?;
        writer.shutdown().await.context("shutting down write half")?;

        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .context("reading event from daemon")?;
            if n == 0 {
                break;
            }
            let event: Event =
                serde_json::from_str(line.trim_end()).context("decoding event from daemon")?;
            on_event(event);
        }
        Ok(())
    }
}

pub fn default_client() -> DaemonClient {
    DaemonClient::new(imgforge_orchestrator::BuildDaemonConfig::default().socket_path)
}

pub fn client_for(socket: Option<&Path>) -> DaemonClient {
    match socket {
        Some(path) => DaemonClient::new(path),
        None => default_client(),
    }
}
