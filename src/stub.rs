//! Placeholder collaborator implementations for the four external
//! contracts the orchestrator depends on (spec §6): the hypervisor
//! control surface, the volume manager, the secret provider, and the OCI
//! image store. All four are explicitly out of scope (spec §1 Non-goals),
//! so every method here returns an error naming the gap rather than doing
//! anything real — this is what lets `imgforged serve` link, start, and
//! exercise submission/queueing/store/token logic end-to-end without a
//! real microVM backend. An integrator wiring imgforge against an actual
//! hypervisor replaces this module, not the orchestrator.

use std::collections::BTreeMap;
use std::path::Path;

use imgforge_orchestrator::{
    ImageStore, InstanceCreateRequest, InstanceHandle, InstanceManager, InstanceRunState, SecretProvider,
    Volume, VolumeManager, VolumeRequest,
};

fn out_of_scope(surface: &str) -> anyhow::Error {
    anyhow::anyhow!("{surface} is out of scope for this build — no hypervisor backend is wired in")
}

/// Always-errors [`InstanceManager`].
pub struct UnimplementedInstances;

impl InstanceManager for UnimplementedInstances {
    async fn create(&self, _req: InstanceCreateRequest) -> anyhow::Result<InstanceHandle> {
        Err(out_of_scope("the hypervisor control surface"))
    }

    async fn state(&self, _instance_id: &str) -> anyhow::Result<InstanceRunState> {
        Err(out_of_scope("the hypervisor control surface"))
    }

    async fn delete(&self, _instance_id: &str) -> anyhow::Result<()> {
        Err(out_of_scope("the hypervisor control surface"))
    }
}

/// Always-errors [`VolumeManager`].
pub struct UnimplementedVolumes;

impl VolumeManager for UnimplementedVolumes {
    async fn create_from_archive(&self, _req: VolumeRequest, _archive: &[u8]) -> anyhow::Result<Volume> {
        Err(out_of_scope("the volume manager"))
    }

    async fn create_empty(&self, _req: VolumeRequest) -> anyhow::Result<Volume> {
        Err(out_of_scope("the volume manager"))
    }

    async fn delete(&self, _id: &str) -> anyhow::Result<()> {
        Err(out_of_scope("the volume manager"))
    }
}

/// Always-errors [`SecretProvider`].
pub struct UnimplementedSecrets;

impl SecretProvider for UnimplementedSecrets {
    async fn get_secrets(&self, _ids: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
        Err(out_of_scope("the secret provider"))
    }
}

/// Always-errors [`ImageStore`].
pub struct UnimplementedImages;

impl ImageStore for UnimplementedImages {
    async fn export_rootfs(&self, _dir: &Path, _out_path: &Path) -> anyhow::Result<u64> {
        Err(out_of_scope("the OCI image store"))
    }
}
