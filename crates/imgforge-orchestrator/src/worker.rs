//! Build execution (spec §4.F-3): the body the queue runs once a build is
//! promoted to active. Provisions a source volume, a config volume, and a
//! builder microVM, drives the vsock protocol to completion, and
//! classifies the outcome into a terminal status.
//!
//! Every collaborator resource provisioned here is torn down on every exit
//! path, including cancellation — cleanup never routes through the build's
//! own [`imgforge_core::BuildContext`], so a cancelled or expired context
//! never prevents it from running to completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use imgforge_core::time::utc_now;
use imgforge_core::{Build, BuildConfig, BuildContext, BuildResult, BuildStatus, NetworkMode, Provenance};
use tracing::{error, info, instrument, warn};

use crate::collaborators::{
    ImageStore, InstanceCreateRequest, InstanceManager, InstanceProbe, SecretProvider, VolumeManager,
    VolumeMount, VolumeRequest,
};
use crate::orchestrator::BuildOrchestrator;

/// Spec §4.F-3 step 6: wait before the first vsock connect attempt, giving
/// the guest agent time to come up.
const PRE_CONNECT_DELAY: Duration = Duration::from_secs(3);

enum Outcome {
    Success { image_digest: Option<String>, provenance: Provenance, logs: String },
    Failed { error: String, provenance: Provenance, logs: String },
}

#[instrument(skip_all, fields(build_id = %id))]
pub(crate) async fn run_build<I, V, Sec, Img>(orch: Arc<BuildOrchestrator<I, V, Sec, Img>>, id: String)
where
    I: InstanceManager,
    V: VolumeManager,
    Sec: SecretProvider,
    Img: ImageStore,
{
    let start = Instant::now();

    if let Err(e) = orch
        .write_status(&id, |b| {
            b.status = BuildStatus::Building;
            b.started_at = Some(utc_now());
        })
        .await
    {
        error!(error = %e, "failed to mark build building, abandoning worker");
        return;
    }

    let (build, config) = match (orch.store.read_metadata(&id), orch.store.read_config(&id)) {
        (Ok(b), Ok(c)) => (b, c),
        (Err(e), _) => {
            error!(error = %e, "failed to read build metadata, abandoning worker");
            finish_failed(&orch, &id, format!("internal error reading build state: {e}"), start).await;
            return;
        }
        (_, Err(e)) => {
            error!(error = %e, "failed to read build config, abandoning worker");
            finish_failed(&orch, &id, format!("internal error reading build state: {e}"), start).await;
            return;
        }
    };

    let (ctx, handle) = BuildContext::with_timeout(Duration::from_secs(build.policy.timeout_seconds));
    orch.cancel_handles.lock().await.insert(id.clone(), handle);

    let outcome = execute(&orch, &id, &build, &config, &ctx).await;

    orch.cancel_handles.lock().await.remove(&id);

    match outcome {
        Outcome::Success { image_digest, provenance, logs } => {
            if !logs.is_empty() {
                let _ = orch.store.append_log(&id, logs.as_bytes());
            }
            let image_ref = format!("{}/builds/{}", config.registry_url, id);
            let duration_ms = start.elapsed().as_millis() as u64;
            let _ = orch
                .write_status(&id, |b| {
                    b.status = BuildStatus::Ready;
                    b.image_digest = image_digest;
                    b.image_ref = Some(image_ref);
                    b.provenance = provenance;
                    b.completed_at = Some(utc_now());
                    b.duration_ms = Some(duration_ms);
                })
                .await;
            info!("build completed successfully");
        }
        Outcome::Failed { error: message, provenance, logs } => {
            if !logs.is_empty() {
                let _ = orch.store.append_log(&id, logs.as_bytes());
            }
            warn!(error = %message, "build failed");
            let duration_ms = start.elapsed().as_millis() as u64;
            let _ = orch
                .write_status(&id, |b| {
                    b.status = BuildStatus::Failed;
                    b.error = Some(message);
                    b.provenance = provenance;
                    b.completed_at = Some(utc_now());
                    b.duration_ms = Some(duration_ms);
                })
                .await;
        }
    }
}

async fn finish_failed<I, V, Sec, Img>(
    orch: &Arc<BuildOrchestrator<I, V, Sec, Img>>,
    id: &str,
    message: String,
    start: Instant,
) where
    I: InstanceManager,
    V: VolumeManager,
    Sec: SecretProvider,
    Img: ImageStore,
{
    let duration_ms = start.elapsed().as_millis() as u64;
    let _ = orch
        .write_status(id, |b| {
            b.status = BuildStatus::Failed;
            b.error = Some(message);
            b.completed_at = Some(utc_now());
            b.duration_ms = Some(duration_ms);
        })
        .await;
}

/// Provisions volumes and a builder VM, runs the build, and tears every
/// provisioned resource down unconditionally before returning.
async fn execute<I, V, Sec, Img>(
    orch: &Arc<BuildOrchestrator<I, V, Sec, Img>>,
    id: &str,
    build: &Build,
    config: &BuildConfig,
    ctx: &BuildContext,
) -> Outcome
where
    I: InstanceManager,
    V: VolumeManager,
    Sec: SecretProvider,
    Img: ImageStore,
{
    let mut source_volume = None;
    let mut config_volume = None;
    let mut instance_id = None;

    let result = run(
        orch,
        id,
        build,
        config,
        ctx,
        &mut source_volume,
        &mut config_volume,
        &mut instance_id,
    )
    .await;

    if let Some(vol) = source_volume {
        let _ = orch.volumes.delete(&vol).await;
    }
    if let Some(vol) = config_volume {
        let _ = orch.volumes.delete(&vol).await;
    }
    if let Some(instance_id) = instance_id {
        let _ = orch.instances.delete(&instance_id).await;
    }

    match result {
        Ok(outcome) => outcome,
        Err(message) => Outcome::Failed {
            error: message,
            provenance: Provenance::default(),
            logs: String::new(),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<I, V, Sec, Img>(
    orch: &Arc<BuildOrchestrator<I, V, Sec, Img>>,
    id: &str,
    build: &Build,
    config: &BuildConfig,
    ctx: &BuildContext,
    source_volume: &mut Option<String>,
    config_volume: &mut Option<String>,
    instance_id: &mut Option<String>,
) -> Result<Outcome, String>
where
    I: InstanceManager,
    V: VolumeManager,
    Sec: SecretProvider,
    Img: ImageStore,
{
    // 1. Provision the source volume from the persisted upload.
    let source_bytes = orch
        .store
        .read_source(id)
        .map_err(|e| format!("reading source archive: {e}"))?;
    let source_vol = orch
        .volumes
        .create_from_archive(VolumeRequest { id: format!("{id}-src") }, &source_bytes)
        .await
        .map_err(|e| format!("provisioning source volume: {e}"))?;
    *source_volume = Some(source_vol.id.clone());

    // 2. Materialise config.json into a filesystem volume via the image
    // store's rootfs exporter, then hand the resulting ext4 image to the
    // volume manager the same way the source archive was.
    let config_json =
        serde_json::to_vec_pretty(config).map_err(|e| format!("serialising build config: {e}"))?;
    let staging = tempfile::tempdir().map_err(|e| format!("creating config staging dir: {e}"))?;
    std::fs::write(staging.path().join("config.json"), &config_json)
        .map_err(|e| format!("writing config.json: {e}"))?;
    let rootfs_path = staging.path().join("config.ext4");
    orch.images
        .export_rootfs(staging.path(), &rootfs_path)
        .await
        .map_err(|e| format!("exporting config volume rootfs: {e}"))?;
    let rootfs_bytes =
        std::fs::read(&rootfs_path).map_err(|e| format!("reading exported config volume: {e}"))?;
    let config_vol = orch
        .volumes
        .create_from_archive(VolumeRequest { id: format!("{id}-config") }, &rootfs_bytes)
        .await
        .map_err(|e| format!("provisioning config volume: {e}"))?;
    *config_volume = Some(config_vol.id.clone());

    // 3. Provision the builder VM with the source volume read-write at
    // /src and the config volume read-only at /config.
    let memory_mb = build.policy.memory_bytes / (1024 * 1024);
    let handle = orch
        .instances
        .create(InstanceCreateRequest {
            name: format!("imgforge-build-{id}"),
            image: orch.config.builder_image.clone(),
            memory_mb,
            cpus: build.policy.vcpus,
            network_enabled: matches!(build.policy.network_mode, NetworkMode::Egress),
            volumes: vec![
                VolumeMount {
                    volume_id: source_vol.id.clone(),
                    mount_path: "/src".to_string(),
                    read_only: false,
                },
                VolumeMount {
                    volume_id: config_vol.id.clone(),
                    mount_path: "/config".to_string(),
                    read_only: true,
                },
            ],
        })
        .await
        .map_err(|e| format!("provisioning builder VM: {e}"))?;
    *instance_id = Some(handle.id.clone());
    let _ = orch
        .write_status(id, |b| b.builder_instance_id = Some(handle.id.clone()))
        .await;

    // 4. Wait before the first connect attempt, honouring cancellation and
    // the build deadline (spec §5: expiry propagates to every suspension
    // point, not just the vsock read loop).
    tokio::select! {
        _ = tokio::time::sleep(PRE_CONNECT_DELAY) => {}
        _ = ctx.cancelled() => return Err("build cancelled before connecting to builder".to_string()),
        _ = ctx.expired() => return Err("build deadline exceeded before connecting to builder".to_string()),
    }

    // 5. Connect, then drive the protocol to a build_result.
    let probe = InstanceProbe(orch.instances.as_ref());
    let reader = imgforge_vsock::connect_loop(&handle.vsock_socket, &handle.id, &probe, ctx)
        .await
        .map_err(|e| format!("builder unreachable: {e}"))?;

    let build_id = id.to_string();
    let orch_for_logs = Arc::clone(orch);
    let on_log = move |line: &str| {
        let _ = orch_for_logs.store.append_log(&build_id, format!("{line}\n").as_bytes());
    };

    match imgforge_vsock::run_host_loop(reader, orch.secrets.as_ref(), ctx, on_log).await {
        Ok(result) => Ok(classify(result)),
        Err(e) => Err(format!("vsock protocol error: {e}")),
    }
}

fn classify(result: BuildResult) -> Outcome {
    if result.success {
        Outcome::Success {
            image_digest: result.image_digest,
            provenance: result.provenance,
            logs: result.logs,
        }
    } else {
        Outcome::Failed {
            error: result.error.unwrap_or_else(|| "build failed with no error message".to_string()),
            provenance: result.provenance,
            logs: result.logs,
        }
    }
}
