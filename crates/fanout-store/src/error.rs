//! Object store errors

use thiserror::Error;

/// Errors that can occur when talking to the object store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object (or namespace) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed (object changed since it was read)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object is missing fields the store needs (name, namespace)
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true for the benign "object is gone" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true when an update lost an optimistic concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Classifies a raw `kube::Error`, lifting 404 and 409 responses into
    /// `NotFound` and `Conflict`.
    pub fn from_kube(err: kube::Error, key: &str) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => StoreError::NotFound(key.to_string()),
            kube::Error::Api(response) if response.code == 409 => {
                StoreError::Conflict(format!("{}: {}", key, response.message))
            }
            _ => StoreError::Kube(err),
        }
    }
}
