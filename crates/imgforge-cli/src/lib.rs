//! imgforge-cli: CLI surface, control-socket wire protocol, and the
//! client/server halves of it, grounded in `mvm-cli`'s module layout
//! (`pub mod commands; ... pub use commands::run;`) and `mvm`'s
//! hostd client/server split.
//!
//! `Command::Serve` is parsed here but dispatched by the `imgforged`
//! binary itself: running the daemon needs concrete hypervisor/volume/
//! secret/image-store implementations, which are out of scope for this
//! crate (and for the whole workspace — spec §1's Non-goals).

pub mod client;
pub mod commands;
pub mod display;
pub mod protocol;
pub mod server;

pub use client::DaemonClient;
pub use commands::{run_client_command, Cli, Command};
