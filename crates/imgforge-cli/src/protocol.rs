//! Newline-delimited JSON framing between the `imgforge` CLI and the
//! `imgforged` control socket, in the same spirit as `imgforge-vsock`'s
//! host/guest framing — one JSON value per line, every request getting
//! exactly one response, except [`DaemonRequest::Stream`] which switches
//! the connection to a one-way feed of [`imgforge_events::Event`] lines
//! until the peer closes it.

use imgforge_core::{Build, BuildRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    Submit { request: BuildRequest, source_b64: String },
    Get { id: String },
    List,
    Cancel { id: String },
    Logs { id: String },
    Stream { id: String, follow: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    Build { build: Build },
    Builds { builds: Vec<Build> },
    Logs { content_b64: String },
    Ok,
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("connection closed before a complete message was received")]
    UnexpectedEof,
}

pub async fn send_request(
    writer: &mut (impl AsyncWrite + Unpin),
    request: &DaemonRequest,
) -> Result<(), ProtocolError> {
    write_line(writer, request).await
}

pub async fn recv_request(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> Result<DaemonRequest, ProtocolError> {
    read_line(reader).await
}

pub async fn send_response(
    writer: &mut (impl AsyncWrite + Unpin),
    response: &DaemonResponse,
) -> Result<(), ProtocolError> {
    write_line(writer, response).await
}

pub async fn recv_response(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> Result<DaemonResponse, ProtocolError> {
    read_line(reader).await
}

async fn write_line(
    writer: &mut (impl AsyncWrite + Unpin),
    value: &impl Serialize,
) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_line<T: for<'de> Deserialize<'de>>(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> Result<T, ProtocolError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
