//! Error types for the runtime store

use thiserror::Error;

/// Errors surfaced by the store and its collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    /// The platform has no declared-state record for this service
    #[error("service {0} not found in declared state")]
    ServiceNotFound(String),

    /// A persistence lookup found nothing
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("store is not ready: {0}")]
    NotReady(String),
}

impl StoreError {
    /// Whether the error means the object or record does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Kube(e) => is_kube_not_found(e),
            _ => false,
        }
    }
}

/// Returns true when the API server answered 404
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
