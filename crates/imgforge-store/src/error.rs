use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("build {0:?} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> imgforge_core::ErrorKind {
        match self {
            Self::NotFound(_) => imgforge_core::ErrorKind::NotFound,
            Self::Io(_) | Self::Serde(_) => imgforge_core::ErrorKind::Internal,
        }
    }
}
