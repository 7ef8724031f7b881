use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Port the in-guest build agent listens on.
pub const BUILD_AGENT_PORT: u32 = 5001;
/// Reserved for the guest-initiated secret-request inverse (spec §4.E);
/// not dialled by the host today.
pub const SECRET_REQUEST_PORT: u32 = 5002;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("vsock handshake failed: expected \"OK \", got {0:?}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Perform the host side of the vsock handshake: send `CONNECT <port>\n`,
/// read one line, and fail unless it starts with `"OK "`.
///
/// Returns a [`BufReader`] wrapping the same stream used for the
/// handshake read. Any bytes the guest sent past the handshake's newline
/// are already sitting in the `BufReader`'s internal buffer and are
/// delivered to the caller's first subsequent read — nothing is dropped
/// (spec §4.E, tested by S4).
pub async fn handshake(
    mut stream: UnixStream,
    port: u32,
) -> Result<BufReader<UnixStream>, HandshakeError> {
    stream.write_all(format!("CONNECT {port}\n").as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    if !line.starts_with("OK ") {
        return Err(HandshakeError::UnexpectedResponse(line.trim_end().to_string()));
    }

    Ok(reader)
}
