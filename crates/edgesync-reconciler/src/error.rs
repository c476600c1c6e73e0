use edgesync_commons::utils::error::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("container runtime failure: {0}")]
    Runtime(String),
    #[error("protocol adapter failure: {0}")]
    Adapter(String),
    #[error("storage failure: {0}")]
    Storage(#[from] DbError),
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("reconcile task panicked")]
    Panicked,
}
