//! Daemon configuration: constants with compile-time defaults overridable
//! by environment variables, plus a TOML-loaded [`BuildDaemonConfig`] —
//! the same two-layer shape `mvm-core::config`/`mvm-runtime::config` use
//! for their compile-time constants and tenant/pool TOML files.

use std::path::{Path, PathBuf};

use imgforge_core::policy::{NetworkMode, DEFAULT_MEMORY_BYTES, DEFAULT_TIMEOUT_SECS, DEFAULT_VCPUS};
use serde::{Deserialize, Serialize};

/// Default bind path for the daemon's control socket (spec's ambient
/// stack: CLI talks to the daemon the way `mvm`'s CLI talks to
/// `mvm-hostd`, over a Unix-domain socket rather than HTTP — the HTTP
/// surface itself is out of scope per spec §1).
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(option_env!("IMGFORGE_SOCKET_PATH").unwrap_or("/run/imgforge/imgforged.sock"))
}

/// Default per-build store root.
pub fn default_store_root() -> PathBuf {
    PathBuf::from(option_env!("IMGFORGE_STORE_ROOT").unwrap_or("/var/lib/imgforge/builds"))
}

/// Resolved default policy, serialisable for the TOML config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPolicyConfig {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_memory")]
    pub memory_bytes: u64,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default)]
    pub network_mode: NetworkMode,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_memory() -> u64 {
    DEFAULT_MEMORY_BYTES
}
fn default_vcpus() -> u32 {
    DEFAULT_VCPUS
}

impl Default for DefaultPolicyConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            memory_bytes: default_memory(),
            vcpus: default_vcpus(),
            network_mode: NetworkMode::default(),
        }
    }
}

/// Where the process-wide HMAC signing secret (spec §9) comes from.
/// Never itself serialised with its value — only the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HmacSecretSource {
    /// Read from an environment variable at startup.
    Env { var: String },
    /// Read the raw bytes of a file at startup.
    File { path: PathBuf },
}

impl Default for HmacSecretSource {
    fn default() -> Self {
        Self::Env {
            var: "IMGFORGE_HMAC_SECRET".to_string(),
        }
    }
}

/// Full daemon configuration, loaded from a TOML file with every field
/// defaulted (spec's ambient stack: mirrors `mvm-runtime::config`'s
/// pattern of compile-time constants plus a TOML-loaded struct).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDaemonConfig {
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub hmac_secret_source: HmacSecretSource,
    #[serde(default)]
    pub default_policy: DefaultPolicyConfig,
    #[serde(default = "default_builder_image")]
    pub builder_image: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn default_registry_url() -> String {
    option_env!("IMGFORGE_REGISTRY_URL")
        .unwrap_or("localhost:5000")
        .to_string()
}

fn default_max_concurrent() -> usize {
    option_env!("IMGFORGE_MAX_CONCURRENT")
        .and_then(|s| s.parse().ok())
        .unwrap_or(4)
}

fn default_builder_image() -> String {
    option_env!("IMGFORGE_BUILDER_IMAGE")
        .unwrap_or("imgforge/builder-agent:latest")
        .to_string()
}

impl Default for BuildDaemonConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            registry_url: default_registry_url(),
            max_concurrent: default_max_concurrent(),
            hmac_secret_source: HmacSecretSource::default(),
            default_policy: DefaultPolicyConfig::default(),
            builder_image: default_builder_image(),
            socket_path: default_socket_path(),
        }
    }
}

impl BuildDaemonConfig {
    /// Load from a TOML file, falling back to built-in defaults for any
    /// field the file omits.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Resolve the HMAC signing secret from [`Self::hmac_secret_source`].
    pub fn load_hmac_secret(&self) -> anyhow::Result<imgforge_token::HmacSecret> {
        let bytes = match &self.hmac_secret_source {
            HmacSecretSource::Env { var } => std::env::var(var)
                .map_err(|_| anyhow::anyhow!("environment variable {var:?} not set"))?
                .into_bytes(),
            HmacSecretSource::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("reading HMAC secret file {}: {e}", path.display()))?,
        };
        if bytes.is_empty() {
            anyhow::bail!("HMAC secret is empty");
        }
        Ok(imgforge_token::HmacSecret::new(bytes))
    }
}
