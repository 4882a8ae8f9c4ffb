//! Controller-specific error types.
//!
//! This module defines error types specific to the Role Cloner Controller
//! that are not covered by upstream library errors.

use fanout_store::StoreError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Role Cloner Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Object store error while loading a template
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Namespace enumeration failed
    #[error("Failed to list namespaces: {0}")]
    Namespaces(#[source] StoreError),

    /// Adding or removing the cleanup finalizer failed
    #[error("Failed to {action} finalizer on {key}: {source}")]
    Finalizer {
        action: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    /// Fetching, creating or updating a replica failed
    #[error("Failed to {action} replica {namespace}/{name}: {source}")]
    ReplicaSync {
        action: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },

    /// Deleting a replica during teardown failed
    #[error("Failed to delete replica {namespace}/{name}: {source}")]
    ReplicaDelete {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },

    /// Reconciliation exceeded its deadline
    #[error("Reconciliation of {0} timed out")]
    Timeout(String),

    /// Object is missing required metadata
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Probe server failed
    #[error("Probe server error: {0}")]
    ProbeServer(#[from] std::io::Error),
}
