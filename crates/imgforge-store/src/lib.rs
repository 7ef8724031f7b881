//! imgforge-store: durable per-build filesystem layout (spec §4.A).
//!
//! Durable state is exactly what's on disk — recovery is a directory scan,
//! not a query against some other source of truth. Every mutation that
//! needs to be crash-consistent (`metadata.json`, `config.json`) is written
//! to a temp file first and renamed over the target; a rename is atomic on
//! the same filesystem, so readers never observe a half-written file.

mod error;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use imgforge_core::{Build, BuildConfig, BuildStatus};

pub use error::StoreError;

/// Root-relative per-build directory layout.
pub struct BuildStore {
    root: PathBuf,
}

impl BuildStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn build_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.build_dir(id).join("metadata.json")
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.build_dir(id).join("config.json")
    }

    fn source_path(&self, id: &str) -> PathBuf {
        self.build_dir(id).join("source").join("source.tar.gz")
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.build_dir(id).join("logs").join("build.log")
    }

    /// Write `meta` for `meta.id`, creating the build directory if needed.
    /// Writes to a temp file and renames over the target; the temp file is
    /// removed on any failure before the rename.
    pub fn write_metadata(&self, meta: &Build) -> Result<(), StoreError> {
        let dir = self.build_dir(&meta.id);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(meta)?;
        atomic_write(&self.metadata_path(&meta.id), &json)
    }

    pub fn read_metadata(&self, id: &str) -> Result<Build, StoreError> {
        let path = self.metadata_path(id);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
            _ => StoreError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every build whose directory contains `metadata.json`, newest first
    /// by `created_at`.
    pub fn list_all(&self) -> Result<Vec<Build>, StoreError> {
        let mut builds = Vec::new();
        if !self.root.exists() {
            return Ok(builds);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.read_metadata(&id) {
                Ok(build) => builds.push(build),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(builds)
    }

    /// Builds whose status is non-terminal, oldest first (the order
    /// recovery (§F-7) re-enqueues them in).
    pub fn list_pending(&self) -> Result<Vec<Build>, StoreError> {
        let mut builds = self.list_all()?;
        builds.retain(|b| b.status.is_pending());
        builds.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(builds)
    }

    /// Persist the raw source upload.
    pub fn write_source(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.source_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn read_source(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        fs::read(self.source_path(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
            _ => StoreError::Io(e),
        })
    }

    /// Persist the host-to-guest config snapshot (atomic rename, same as
    /// metadata — recovery rewrites this in place when a credential is
    /// re-issued).
    pub fn write_config(&self, id: &str, config: &BuildConfig) -> Result<(), StoreError> {
        let dir = self.build_dir(id);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(config)?;
        atomic_write(&self.config_path(id), &json)
    }

    pub fn read_config(&self, id: &str) -> Result<BuildConfig, StoreError> {
        let bytes = fs::read(self.config_path(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
            _ => StoreError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Append raw bytes to the build log, creating `logs/` if missing.
    pub fn append_log(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.log_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Remove the build directory entirely. Idempotent: a missing
    /// directory is `NotFound`, not an I/O error.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let dir = self.build_dir(id);
        if !dir.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.metadata_path(id).exists()
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");
    let write_result = (|| -> Result<(), StoreError> {
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if write_result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    write_result
}

/// Alias kept for readability at call sites that only care about terminal
/// vs. non-terminal and never need the concrete variant.
pub type Status = BuildStatus;
