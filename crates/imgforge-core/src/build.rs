use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::{NetworkMode, Policy, PolicyInput};
use crate::time::utc_now;

/// Build lifecycle status. `Ready`, `Failed`, and `Cancelled` are terminal:
/// no transition ever leaves them (§3 invariants, §8 property 2).
///
/// `Pushing` is a reserved non-terminal state (§9 open question): the state
/// machine in [`crate::build`] and the orchestrator never *writes* it today,
/// but recovery and cancellation treat it as a valid non-terminal status in
/// case a future split between "built locally" and "pushed to registry"
/// lands. Do not wire new transitions into it without a clearer requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Building,
    Pushing,
    Ready,
    Failed,
    Cancelled,
}

impl BuildStatus {
    /// True for the three terminal states: no further writes are accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }

    /// True for the states recovery and cancellation treat as "in flight".
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Building | Self::Pushing)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Pushing => "pushing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Creation-time snapshot of what the user submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub source_hash: String,
    #[serde(default)]
    pub container_definition: Option<String>,
    #[serde(default)]
    pub base_image_digest: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub secret_refs: Vec<String>,
    #[serde(default)]
    pub cache_scope: Option<String>,
    #[serde(default)]
    pub policy: PolicyInput,
}

/// Immutable record of inputs and tool versions, written on every completed
/// build whether it succeeded or failed. Fields are populated incrementally
/// as information becomes available, so most are optional until the guest
/// reports back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub base_image_digest: Option<String>,
    #[serde(default)]
    pub source_hash: Option<String>,
    #[serde(default)]
    pub lockfile_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A single source-to-image build, identified by a stable opaque id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub status: BuildStatus,
    pub request: BuildRequest,
    pub policy: Policy,
    #[serde(default)]
    pub builder_instance_id: Option<String>,
    #[serde(default)]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provenance: Provenance,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Live queue position at the time this Build was read back. Never
    /// persisted — it's decorated onto the struct by whichever caller holds
    /// the queue (§4.F-6), so it always reflects the current state rather
    /// than a stale snapshot.
    #[serde(skip)]
    pub queue_position: Option<usize>,
}

impl Build {
    pub fn new(id: String, request: BuildRequest) -> Self {
        let policy = Policy::resolve(&request.policy);
        Self {
            id,
            status: BuildStatus::Queued,
            request,
            policy,
            builder_instance_id: None,
            image_digest: None,
            image_ref: None,
            error: None,
            provenance: Provenance::default(),
            created_at: utc_now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            queue_position: None,
        }
    }
}

/// Host-to-guest snapshot of everything the in-guest build agent needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub build_id: String,
    #[serde(default)]
    pub container_definition: Option<String>,
    #[serde(default)]
    pub base_image_digest: Option<String>,
    pub registry_url: String,
    pub registry_token: String,
    #[serde(default)]
    pub cache_scope: Option<String>,
    pub source_mount_path: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub secret_ids: Vec<String>,
    pub timeout_seconds: u64,
    pub network_mode: NetworkMode,
}

/// Guest-to-host terminal result of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    #[serde(default)]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub provenance: Provenance,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> BuildRequest {
        BuildRequest {
            source_hash: "deadbeef".to_string(),
            container_definition: Some("FROM alpine".to_string()),
            base_image_digest: None,
            build_args: BTreeMap::new(),
            secret_refs: Vec::new(),
            cache_scope: Some("tenant-abc".to_string()),
            policy: PolicyInput::default(),
        }
    }

    #[test]
    fn test_new_build_is_queued() {
        let build = Build::new("b-1".to_string(), sample_request());
        assert_eq!(build.status, BuildStatus::Queued);
        assert!(build.queue_position.is_none());
        assert_eq!(build.policy.timeout_seconds, crate::policy::DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(BuildStatus::Ready.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(!BuildStatus::Queued.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
        assert!(!BuildStatus::Pushing.is_terminal());
    }

    #[test]
    fn test_pending_statuses_for_recovery() {
        assert!(BuildStatus::Queued.is_pending());
        assert!(BuildStatus::Building.is_pending());
        assert!(BuildStatus::Pushing.is_pending());
        assert!(!BuildStatus::Ready.is_pending());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&BuildStatus::Building).unwrap();
        assert_eq!(json, "\"building\"");
    }

    #[test]
    fn test_queue_position_not_persisted() {
        let mut build = Build::new("b-2".to_string(), sample_request());
        build.queue_position = Some(3);
        let json = serde_json::to_string(&build).unwrap();
        assert!(!json.contains("queue_position"));

        let parsed: Build = serde_json::from_str(&json).unwrap();
        assert!(parsed.queue_position.is_none());
    }
}
