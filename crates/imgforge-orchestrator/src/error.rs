use imgforge_core::ErrorKind;
use thiserror::Error;

/// Errors raised by calls the submission/cancel/lookup caller is still
/// around to observe (spec §7 "Propagation policy"). Errors that occur
/// during build *execution* are never surfaced this way — they are
/// converted to `failed` status in the store instead (§4.F-8).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("build {0:?} not found")]
    NotFound(String),
    #[error("build {0:?} already exists")]
    AlreadyExists(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("build {0:?} has already completed")]
    AlreadyCompleted(String),
    #[error(transparent)]
    Store(#[from] imgforge_store::StoreError),
    #[error(transparent)]
    Cache(#[from] imgforge_cache::CacheError),
    #[error(transparent)]
    Token(#[from] imgforge_token::TokenError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::AlreadyCompleted(_) => ErrorKind::InvalidRequest,
            Self::Store(e) => e.kind(),
            Self::Cache(e) => e.kind(),
            Self::Token(e) => e.kind(),
            Self::Other(_) => ErrorKind::Internal,
        }
    }
}
