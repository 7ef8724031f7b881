use serde::{Deserialize, Serialize};

/// Default timeout, in seconds, applied when a build request omits one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Default memory budget: 2 GiB.
pub const DEFAULT_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Default vCPU count.
pub const DEFAULT_VCPUS: u32 = 2;

/// Networking posture for a builder microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Isolated,
    #[default]
    Egress,
}

/// Partial policy as supplied on a build request. Any field left `None` is
/// filled from the defaults in [`Policy::resolve`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyInput {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub vcpus: Option<u32>,
    #[serde(default)]
    pub network_mode: Option<NetworkMode>,
    #[serde(default)]
    pub egress_allowlist: Option<Vec<String>>,
}

/// Fully resolved build policy — every field has a concrete value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub timeout_seconds: u64,
    pub memory_bytes: u64,
    pub vcpus: u32,
    pub network_mode: NetworkMode,
    pub egress_allowlist: Option<Vec<String>>,
}

impl Policy {
    /// Apply defaults to any field the caller left unset. A submitted
    /// `timeout_seconds` of 0 is treated as unset (spec requires >= 1).
    pub fn resolve(input: &PolicyInput) -> Self {
        let timeout_seconds = match input.timeout_seconds {
            Some(t) if t >= 1 => t,
            _ => DEFAULT_TIMEOUT_SECS,
        };
        Self {
            timeout_seconds,
            memory_bytes: input.memory_bytes.unwrap_or(DEFAULT_MEMORY_BYTES),
            vcpus: input.vcpus.unwrap_or(DEFAULT_VCPUS),
            network_mode: input.network_mode.unwrap_or_default(),
            egress_allowlist: input.egress_allowlist.clone(),
        }
    }

    /// Push-credential TTL per §4.F-1/§9: at least 30 minutes regardless of
    /// how short the build timeout is, to bound token-issuance churn.
    pub fn token_ttl_secs(&self) -> u64 {
        const MIN_TOKEN_TTL_SECS: u64 = 30 * 60;
        self.timeout_seconds.max(MIN_TOKEN_TTL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_all_defaults() {
        let policy = Policy::resolve(&PolicyInput::default());
        assert_eq!(policy.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert_eq!(policy.memory_bytes, DEFAULT_MEMORY_BYTES);
        assert_eq!(policy.vcpus, DEFAULT_VCPUS);
        assert_eq!(policy.network_mode, NetworkMode::Egress);
        assert_eq!(policy.egress_allowlist, None);
    }

    #[test]
    fn test_resolve_zero_timeout_falls_back_to_default() {
        let input = PolicyInput {
            timeout_seconds: Some(0),
            ..Default::default()
        };
        assert_eq!(Policy::resolve(&input).timeout_seconds, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_resolve_partial_override() {
        let input = PolicyInput {
            vcpus: Some(4),
            ..Default::default()
        };
        let policy = Policy::resolve(&input);
        assert_eq!(policy.vcpus, 4);
        assert_eq!(policy.timeout_seconds, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_token_ttl_floor_at_thirty_minutes() {
        let policy = Policy::resolve(&PolicyInput {
            timeout_seconds: Some(60),
            ..Default::default()
        });
        assert_eq!(policy.token_ttl_secs(), 1800);
    }

    #[test]
    fn test_token_ttl_matches_long_timeout() {
        let policy = Policy::resolve(&PolicyInput {
            timeout_seconds: Some(7200),
            ..Default::default()
        });
        assert_eq!(policy.token_ttl_secs(), 7200);
    }
}
