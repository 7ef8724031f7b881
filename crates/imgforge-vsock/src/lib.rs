//! imgforge-vsock: typed, framed host↔guest message exchange over a
//! Unix-domain handshake transport (spec §4.E).
//!
//! The transport is a Unix-domain socket (the hypervisor's vsock proxy),
//! reliable and ordered. After a one-line text handshake the channel
//! carries newline-delimited JSON frames, dispatched by an explicit,
//! exhaustive match in [`client::run_host_loop`] — an unrecognised `type`
//! is logged and skipped rather than treated as a protocol error.

pub mod client;
pub mod handshake;
pub mod protocol;

pub use client::{
    connect_loop, run_host_loop, InstanceRunState, InstanceStateProbe, SecretProvider, VsockError,
    CONNECT_MAX_ATTEMPTS, CONNECT_RETRY_INTERVAL,
};
pub use handshake::{handshake, HandshakeError, BUILD_AGENT_PORT, SECRET_REQUEST_PORT};
pub use protocol::{decode_guest_message, encode, GuestMessage, HostMessage, ProtocolError};
