//! The external collaborator contracts consumed by the orchestrator (spec
//! §6). Their implementations — the real hypervisor control surface, the
//! OCI image store, the volume manager — are explicitly out of scope
//! (spec §1); only the interfaces they must satisfy live here.

use std::path::Path;

pub use imgforge_vsock::{InstanceRunState, SecretProvider};

/// A mounted volume attachment for a builder VM: the volume to attach,
/// where to mount it inside the guest, and whether it's read-only.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub volume_id: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// Parameters for provisioning a builder microVM (spec §6 "Instance
/// manager: create(...)").
#[derive(Debug, Clone)]
pub struct InstanceCreateRequest {
    pub name: String,
    pub image: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub network_enabled: bool,
    pub volumes: Vec<VolumeMount>,
}

/// What `create` hands back: the VM's id and the path to its vsock-facing
/// Unix-domain socket.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub id: String,
    pub vsock_socket: std::path::PathBuf,
}

/// The hypervisor control surface the orchestrator drives a build through
/// (spec §6). Generic rather than `dyn` so the connect loop's
/// [`imgforge_vsock::InstanceStateProbe`] bound can be satisfied without
/// object-safety gymnastics (spec §9's "coroutine-style decode" note
/// applies the same preference for concrete, generic plumbing over
/// dynamic dispatch).
#[allow(async_fn_in_trait)]
pub trait InstanceManager: Send + Sync {
    async fn create(&self, req: InstanceCreateRequest) -> anyhow::Result<InstanceHandle>;
    async fn state(&self, instance_id: &str) -> anyhow::Result<InstanceRunState>;
    async fn delete(&self, instance_id: &str) -> anyhow::Result<()>;
}

/// Parameters for provisioning a volume (spec §6 "Volume manager").
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
}

/// Empty and archive-initialised block volumes (spec §1 Non-goals: the
/// volume manager's own internals — layer unpacking, disk-image
/// conversion — are out of scope; only this surface is).
#[allow(async_fn_in_trait)]
pub trait VolumeManager: Send + Sync {
    async fn create_from_archive(&self, req: VolumeRequest, archive: &[u8]) -> anyhow::Result<Volume>;
    async fn create_empty(&self, req: VolumeRequest) -> anyhow::Result<Volume>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
}

/// Materialises a config volume from a directory of files (spec §6
/// "Image store: export_rootfs(dir, out_path, format=ext4)"). Format is
/// always ext4 — the spec fixes it, so it isn't a parameter here.
#[allow(async_fn_in_trait)]
pub trait ImageStore: Send + Sync {
    async fn export_rootfs(&self, dir: &Path, out_path: &Path) -> anyhow::Result<u64>;
}

/// Adapts any [`InstanceManager`] to [`imgforge_vsock::InstanceStateProbe`]
/// without requiring a blanket impl across crates (which the orphan rules
/// forbid for a foreign trait over a generic type).
pub struct InstanceProbe<'a, I>(pub &'a I);

impl<I: InstanceManager> imgforge_vsock::InstanceStateProbe for InstanceProbe<'_, I> {
    async fn state(&self, instance_id: &str) -> anyhow::Result<InstanceRunState> {
        self.0.state(instance_id).await
    }
}
