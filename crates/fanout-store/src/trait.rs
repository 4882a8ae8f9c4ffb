//! ObjectStore trait for mocking
//!
//! This trait abstracts the Kubernetes API to enable mocking in unit tests.
//! `KubeStore` implements it against a live cluster, tests use `MockObjectStore`.

use crate::error::StoreError;
use crate::object::{Labels, Replicable};
use k8s_openapi::api::core::v1::Namespace;

/// Severity of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    /// Informational
    Normal,
    /// Something the owner of the object should look at
    Warning,
}

/// Trait for object store operations on one namespaced resource type
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ObjectStore<K: Replicable>: Send + Sync {
    /// Fetches one object. Missing objects yield `StoreError::NotFound`.
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;

    /// Lists objects in `namespace` carrying all of `labels`.
    async fn list(&self, namespace: &str, labels: &Labels) -> Result<Vec<K>, StoreError>;

    /// Creates an object and returns it as stored.
    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces an object. Fails with `StoreError::Conflict` if it changed since it was read.
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Deletes an object. Missing objects yield `StoreError::NotFound`.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Lists every namespace in the cluster.
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError>;

    /// Records an event against `target`. Failures are logged and swallowed.
    async fn record_event(&self, target: &K, severity: EventSeverity, reason: &str, message: &str);
}
