//! imgforged: the `imgforge-*` workspace's facade crate. Re-exports the
//! library crates and, via [`stub`], supplies placeholder collaborator
//! implementations so the `imgforged serve` binary links and runs
//! end-to-end even though the real hypervisor control surface, volume
//! manager, and OCI image store are out of scope (spec §1 Non-goals).

pub mod stub;

pub use imgforge_cache as cache;
pub use imgforge_cli as cli;
pub use imgforge_core as core;
pub use imgforge_events as events;
pub use imgforge_orchestrator as orchestrator;
pub use imgforge_queue as queue;
pub use imgforge_store as store;
pub use imgforge_token as token;
pub use imgforge_vsock as vsock;
