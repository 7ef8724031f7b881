//! The lifecycle state machine (spec §4.F): submission, status updates,
//! cancellation, lookup, and startup recovery, tying together the Build
//! Store, Cache Key Deriver's sibling Token Issuer, and Build Queue.
//!
//! Build *execution* itself — the part that talks to the external
//! collaborators and the guest over vsock — lives in [`crate::worker`];
//! this module only ever hands the queue a closure that calls into it.

use std::collections::HashMap;
use std::sync::Arc;

use imgforge_core::{time::utc_now, Build, BuildContextHandle, BuildRequest, BuildStatus};
use imgforge_events::{Event, SubscriberRegistry};
use imgforge_queue::{BuildQueue, StartFn};
use imgforge_store::BuildStore;
use imgforge_token::TokenIssuer;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::collaborators::{ImageStore, InstanceManager, SecretProvider, VolumeManager};
use crate::config::BuildDaemonConfig;
use crate::error::OrchestratorError;
use crate::worker;

/// Ties the build lifecycle state machine to its collaborators. Generic
/// over the four external contracts (spec §6) so tests can swap in fakes
/// without a trait-object layer.
pub struct BuildOrchestrator<I, V, Sec, Img> {
    pub(crate) store: Arc<BuildStore>,
    pub(crate) queue: Arc<BuildQueue>,
    pub(crate) tokens: Arc<TokenIssuer>,
    pub(crate) registry: Arc<SubscriberRegistry>,
    /// Held for the entire duration of a creation or recovery pass so the
    /// two never interleave and double-allocate an id or double-issue a
    /// token for the same build (spec's "Recovery idempotency guard").
    creation_lock: Arc<Mutex<()>>,
    /// One entry per in-flight build, inserted by the worker when it starts
    /// executing and removed when it finishes. Lets [`Self::cancel`] reach
    /// a running build's [`imgforge_core::BuildContext`] without the queue
    /// having to know anything about cancellation.
    pub(crate) cancel_handles: Arc<Mutex<HashMap<String, BuildContextHandle>>>,
    pub(crate) config: BuildDaemonConfig,
    pub(crate) instances: Arc<I>,
    pub(crate) volumes: Arc<V>,
    pub(crate) secrets: Arc<Sec>,
    pub(crate) images: Arc<Img>,
}

impl<I, V, Sec, Img> BuildOrchestrator<I, V, Sec, Img>
where
    I: InstanceManager + 'static,
    V: VolumeManager + 'static,
    Sec: SecretProvider + 'static,
    Img: ImageStore + 'static,
{
    pub fn new(
        config: BuildDaemonConfig,
        instances: I,
        volumes: V,
        secrets: Sec,
        images: Img,
    ) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(BuildStore::new(&config.store_root));
        let queue = BuildQueue::new(config.max_concurrent.max(1));
        let secret = config.load_hmac_secret()?;
        let tokens = Arc::new(TokenIssuer::new(secret, "imgforge"));
        Ok(Arc::new(Self {
            store,
            queue,
            tokens,
            registry: Arc::new(SubscriberRegistry::new()),
            creation_lock: Arc::new(Mutex::new(())),
            cancel_handles: Arc::new(Mutex::new(HashMap::new())),
            config,
            instances: Arc::new(instances),
            volumes: Arc::new(volumes),
            secrets: Arc::new(secrets),
            images: Arc::new(images),
        }))
    }

    /// Submit a new build (spec §4.F-1). Allocates an id, persists initial
    /// metadata, the source archive, and a host-to-guest config snapshot
    /// with a freshly issued push credential, then enqueues it. Any failure
    /// partway through rolls back the build directory entirely.
    #[instrument(skip_all, fields(source_hash = %request.source_hash))]
    pub async fn create_build(
        self: &Arc<Self>,
        mut request: BuildRequest,
        source: Vec<u8>,
    ) -> Result<Build, OrchestratorError> {
        if request.source_hash.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "source_hash must not be empty".to_string(),
            ));
        }

        // Normalise and validate the cache scope at the submission boundary
        // (spec §3 invariant, §7 `InvalidScope`) so the stored request, the
        // issued token's `cache/{scope}` repository, and whatever the cache
        // deriver would later produce for this tenant all agree on the same
        // normalised value.
        if let Some(raw_scope) = request.cache_scope.take() {
            request.cache_scope = imgforge_cache::normalise_and_validate_scope(&raw_scope)?;
        }

        let _guard = self.creation_lock.lock().await;

        let id = imgforge_core::naming::generate_build_id();
        let mut build = Build::new(id.clone(), request.clone());

        if let Err(e) = self.submit_inner(&id, &build, &source).await {
            let _ = self.store.delete(&id);
            return Err(e);
        }

        let position = self.dispatch(id.clone(), request).await;
        if position > 0 {
            build.queue_position = Some(position);
        }
        info!(build_id = %id, queue_position = position, "build submitted");
        Ok(build)
    }

    async fn submit_inner(
        &self,
        id: &str,
        build: &Build,
        source: &[u8],
    ) -> Result<(), OrchestratorError> {
        self.store.write_metadata(build)?;
        self.store.write_source(id, source)?;

        let repositories = repositories_for(id, &build.request.cache_scope);
        let ttl = build.policy.token_ttl_secs();
        let token = self.tokens.issue(id, repositories, ttl)?;

        let config = imgforge_core::BuildConfig {
            build_id: id.to_string(),
            container_definition: build.request.container_definition.clone(),
            base_image_digest: build.request.base_image_digest.clone(),
            registry_url: self.config.registry_url.clone(),
            registry_token: token,
            cache_scope: build.request.cache_scope.clone(),
            source_mount_path: "/src".to_string(),
            build_args: build.request.build_args.clone(),
            secret_ids: build.request.secret_refs.clone(),
            timeout_seconds: build.policy.timeout_seconds,
            network_mode: build.policy.network_mode,
        };
        self.store.write_config(id, &config)?;
        Ok(())
    }

    /// Hand the queue a closure that runs this build through
    /// [`worker::run_build`] once promoted to active.
    async fn dispatch(self: &Arc<Self>, id: String, request: BuildRequest) -> usize {
        let orch = Arc::clone(self);
        let worker_id = id.clone();
        let start_fn: StartFn = Box::new(move || Box::pin(worker::run_build(orch, worker_id)));
        self.queue.enqueue(id, request, start_fn).await
    }

    /// Read-modify-write a build's metadata, applying `mutate` only if the
    /// build is not already terminal, and broadcasting the resulting status
    /// to any live subscribers (spec §4.F-2). A write against an already
    /// terminal build is silently dropped rather than erroring — the last
    /// terminal write always wins and no later writer is notified it lost.
    pub(crate) async fn write_status(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Build),
    ) -> Result<(), OrchestratorError> {
        let mut build = self.store.read_metadata(id)?;
        if build.status.is_terminal() {
            return Ok(());
        }
        let previous_status = build.status;
        mutate(&mut build);
        self.store.write_metadata(&build)?;
        if build.status != previous_status {
            self.registry
                .broadcast(
                    id,
                    Event::Status {
                        new_state: build.status,
                        ts: utc_now(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Cancel a build (spec §4.F-4). Queued builds are dequeued without
    /// ever starting; running builds have their context cancelled and their
    /// builder VM torn down best-effort. A terminal build is rejected.
    pub async fn cancel(self: &Arc<Self>, id: &str) -> Result<(), OrchestratorError> {
        let build = self.store.read_metadata(id)?;
        if build.status.is_terminal() {
            return Err(OrchestratorError::AlreadyCompleted(id.to_string()));
        }

        let was_pending = self.queue.cancel(id).await;
        if !was_pending {
            let handle = self.cancel_handles.lock().await.get(id).cloned();
            if let Some(handle) = handle {
                handle.cancel();
            }
            if let Some(instance_id) = &build.builder_instance_id {
                let _ = self.instances.delete(instance_id).await;
            }
        }

        self.write_status(id, |b| b.status = BuildStatus::Cancelled).await
    }

    /// Look up a single build (spec §4.F-6), decorating its live queue
    /// position when still queued.
    pub async fn get(&self, id: &str) -> Result<Build, OrchestratorError> {
        let mut build = self.store.read_metadata(id)?;
        if build.status == BuildStatus::Queued {
            build.queue_position = self.queue.position(id).await;
        }
        Ok(build)
    }

    /// List every known build (spec §4.F-6), newest first, each decorated
    /// the same way as [`Self::get`].
    pub async fn list(&self) -> Result<Vec<Build>, OrchestratorError> {
        let mut builds = self.store.list_all()?;
        for build in builds.iter_mut() {
            if build.status == BuildStatus::Queued {
                build.queue_position = self.queue.position(&build.id).await;
            }
        }
        Ok(builds)
    }

    /// Full accumulated build log, or `NotFound` if the build doesn't exist
    /// (an existing build with no log yet simply returns empty bytes).
    pub async fn logs(&self, id: &str) -> Result<Vec<u8>, OrchestratorError> {
        if !self.store.exists(id) {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        Ok(std::fs::read(self.store.log_path(id)).unwrap_or_default())
    }

    /// Subscribe to one build's merged log/status feed (spec §4.G); a thin
    /// pass-through to [`imgforge_events::stream_events`].
    pub fn stream(
        &self,
        id: String,
        follow: bool,
        ctx: imgforge_core::BuildContext,
    ) -> tokio::sync::mpsc::Receiver<Event> {
        imgforge_events::stream_events(Arc::clone(&self.store), Arc::clone(&self.registry), id, follow, ctx)
    }

    /// Startup recovery (spec §4.F-7): every non-terminal build on disk is
    /// re-enqueued, re-issuing its push credential first if the persisted
    /// one has expired. A build whose credential can't be re-issued is
    /// marked failed rather than silently dropped.
    #[instrument(skip_all)]
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<usize> {
        let _guard = self.creation_lock.lock().await;
        let pending = self.store.list_pending()?;
        let mut recovered = 0;
        for build in pending {
            if let Err(e) = self.reissue_token_if_expired(&build).await {
                tracing::error!(build_id = %build.id, error = %e, "recovery: re-issuing push credential failed, marking build failed");
                let _ = self
                    .write_status(&build.id, |b| {
                        b.status = BuildStatus::Failed;
                        b.error = Some(format!("recovery: failed to re-issue push credential: {e}"));
                        b.completed_at = Some(utc_now());
                    })
                    .await;
                continue;
            }
            self.dispatch(build.id.clone(), build.request.clone()).await;
            recovered += 1;
        }
        info!(recovered, "startup recovery complete");
        Ok(recovered)
    }

    async fn reissue_token_if_expired(&self, build: &Build) -> Result<(), OrchestratorError> {
        let mut config = self.store.read_config(&build.id)?;
        if self.tokens.validate(&config.registry_token).is_ok() {
            return Ok(());
        }
        let repositories = repositories_for(&build.id, &build.request.cache_scope);
        let ttl = build.policy.token_ttl_secs();
        config.registry_token = self.tokens.issue(&build.id, repositories, ttl)?;
        self.store.write_config(&build.id, &config)?;
        Ok(())
    }
}

fn repositories_for(id: &str, cache_scope: &Option<String>) -> Vec<String> {
    let mut repositories = vec![format!("builds/{id}")];
    if let Some(scope) = cache_scope {
        if !scope.is_empty() {
            repositories.push(format!("cache/{scope}"));
        }
    }
    repositories
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        InstanceCreateRequest, InstanceHandle, InstanceRunState, Volume, VolumeRequest,
    };
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeInstances {
        deletes: std::sync::Mutex<Vec<String>>,
    }
    impl InstanceManager for FakeInstances {
        async fn create(&self, req: InstanceCreateRequest) -> anyhow::Result<InstanceHandle> {
            Ok(InstanceHandle {
                id: format!("i-{}", req.name),
                vsock_socket: std::path::PathBuf::from("/nonexistent/vsock.sock"),
            })
        }
        async fn state(&self, _id: &str) -> anyhow::Result<InstanceRunState> {
            Ok(InstanceRunState::Stopped)
        }
        async fn delete(&self, id: &str) -> anyhow::Result<()> {
            self.deletes.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    struct FakeVolumes;
    impl VolumeManager for FakeVolumes {
        async fn create_from_archive(&self, req: VolumeRequest, _archive: &[u8]) -> anyhow::Result<Volume> {
            Ok(Volume { id: req.id })
        }
        async fn create_empty(&self, req: VolumeRequest) -> anyhow::Result<Volume> {
            Ok(Volume { id: req.id })
        }
        async fn delete(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FakeSecrets;
    impl SecretProvider for FakeSecrets {
        async fn get_secrets(&self, _ids: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
    }

    struct FakeImages;
    impl ImageStore for FakeImages {
        async fn export_rootfs(&self, _dir: &Path, out_path: &Path) -> anyhow::Result<u64> {
            std::fs::write(out_path, b"rootfs")?;
            Ok(6)
        }
    }

    fn test_orchestrator(
        store_root: &Path,
    ) -> Arc<BuildOrchestrator<FakeInstances, FakeVolumes, FakeSecrets, FakeImages>> {
        unsafe { std::env::set_var("IMGFORGE_TEST_ORCH_SECRET", "orchestrator-test-secret") };
        let config = BuildDaemonConfig {
            store_root: store_root.to_path_buf(),
            max_concurrent: 1,
            hmac_secret_source: crate::config::HmacSecretSource::Env {
                var: "IMGFORGE_TEST_ORCH_SECRET".to_string(),
            },
            ..Default::default()
        };
        BuildOrchestrator::new(
            config,
            FakeInstances { deletes: std::sync::Mutex::new(Vec::new()) },
            FakeVolumes,
            FakeSecrets,
            FakeImages,
        )
        .unwrap()
    }

    fn sample_request() -> BuildRequest {
        BuildRequest {
            source_hash: "deadbeef".to_string(),
            container_definition: Some("FROM alpine".to_string()),
            base_image_digest: None,
            build_args: BTreeMap::new(),
            secret_refs: Vec::new(),
            cache_scope: Some("tenant-abc".to_string()),
            policy: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_create_build_writes_store_and_issues_scoped_token() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path());
        let build = orch.create_build(sample_request(), b"tarball".to_vec()).await.unwrap();

        let config = orch.store.read_config(&build.id).unwrap();
        assert_eq!(config.registry_url, "localhost:5000");
        let claims = orch.tokens.validate(&config.registry_token).unwrap();
        assert!(claims.is_repo_allowed(&format!("builds/{}", build.id)));
        assert!(claims.is_repo_allowed("cache/tenant-abc"));
    }

    #[tokio::test]
    async fn test_create_build_normalises_cache_scope_in_token_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path());
        let mut request = sample_request();
        request.cache_scope = Some("My Team!@#$%".to_string());
        let build = orch.create_build(request, b"tarball".to_vec()).await.unwrap();

        assert_eq!(build.request.cache_scope.as_deref(), Some("my-team"));
        let config = orch.store.read_config(&build.id).unwrap();
        assert_eq!(config.cache_scope.as_deref(), Some("my-team"));
        let claims = orch.tokens.validate(&config.registry_token).unwrap();
        assert!(claims.is_repo_allowed("cache/my-team"));
        assert!(!claims.is_repo_allowed("cache/My Team!@#$%"));
    }

    #[tokio::test]
    async fn test_create_build_rejects_cache_scope_that_normalises_too_short() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path());
        let mut request = sample_request();
        request.cache_scope = Some("a!".to_string());

        let err = orch.create_build(request, b"tarball".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), imgforge_core::ErrorKind::InvalidScope);
    }

    #[tokio::test]
    async fn test_create_build_rejects_empty_source_hash() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path());
        let mut request = sample_request();
        request.source_hash = String::new();
        let err = orch.create_build(request, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_write_status_drops_write_after_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path());
        let build = orch.create_build(sample_request(), b"tarball".to_vec()).await.unwrap();

        orch.write_status(&build.id, |b| b.status = BuildStatus::Ready).await.unwrap();
        orch.write_status(&build.id, |b| b.status = BuildStatus::Failed).await.unwrap();

        let read_back = orch.store.read_metadata(&build.id).unwrap();
        assert_eq!(read_back.status, BuildStatus::Ready);
    }

    #[tokio::test]
    async fn test_cancel_terminal_build_errors() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path());
        let build = orch.create_build(sample_request(), b"tarball".to_vec()).await.unwrap();
        orch.write_status(&build.id, |b| b.status = BuildStatus::Ready).await.unwrap();

        let err = orch.cancel(&build.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyCompleted(_)));
    }

    #[tokio::test]
    async fn test_list_decorates_queue_position() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path());

        // keep the single concurrency slot busy so the next submission queues
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_clone = gate.clone();
        let held = Arc::new(AtomicUsize::new(0));
        let held_clone = held.clone();
        let start_fn: StartFn = Box::new(move || {
            Box::pin(async move {
                held_clone.fetch_add(1, Ordering::SeqCst);
                gate_clone.notified().await;
            })
        });
        orch.queue
            .enqueue("b-busy".to_string(), sample_request(), start_fn)
            .await;

        let build = orch.create_build(sample_request(), b"tarball".to_vec()).await.unwrap();
        assert_eq!(build.queue_position, Some(1));

        let listed = orch.list().await.unwrap();
        let found = listed.iter().find(|b| b.id == build.id).unwrap();
        assert_eq!(found.queue_position, Some(1));

        gate.notify_one();
    }
}
