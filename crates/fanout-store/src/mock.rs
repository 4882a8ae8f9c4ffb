//! Mock ObjectStore for unit testing
//!
//! In-memory implementation of `ObjectStore` that behaves like the API server
//! where it matters to a fan-out controller:
//! - every write bumps `metadata.resourceVersion`, and `update` rejects stale versions
//! - deleting an object that still has finalizers only stamps `deletionTimestamp`
//! - removing the last finalizer from a deleting object removes it for good
//!
//! Failures can be injected per operation (and optionally per namespace),
//! successful writes and recorded events are kept for assertions.

use crate::error::StoreError;
use crate::object::{Labels, Replicable, object_key};
use crate::store_trait::{EventSeverity, ObjectStore};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Store operations, used for failure injection and write tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `get`
    Get,
    /// `list`
    List,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `list_namespaces`
    ListNamespaces,
}

/// An event captured by `record_event`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// `namespace/name` of the target object
    pub key: String,
    /// Event severity
    pub severity: EventSeverity,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

#[derive(Debug, Clone)]
struct Failure {
    operation: Operation,
    namespace: Option<String>,
    // None fails forever
    remaining: Option<usize>,
}

/// Current time as a Kubernetes timestamp.
pub fn deletion_timestamp() -> Option<Time> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(now)).ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock ObjectStore for testing
#[derive(Clone)]
pub struct MockObjectStore<K> {
    objects: Arc<Mutex<BTreeMap<(String, String), K>>>,
    namespaces: Arc<Mutex<BTreeMap<String, Namespace>>>,
    failures: Arc<Mutex<Vec<Failure>>>,
    writes: Arc<Mutex<Vec<(Operation, String)>>>,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    latency: Arc<Mutex<Option<Duration>>>,
    operation_latency: Arc<Mutex<Vec<(Operation, Duration)>>>,
    next_version: Arc<Mutex<u64>>,
}

impl<K: Replicable> Default for MockObjectStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Replicable> MockObjectStore<K> {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            namespaces: Arc::new(Mutex::new(BTreeMap::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            latency: Arc::new(Mutex::new(None)),
            operation_latency: Arc::new(Mutex::new(Vec::new())),
            next_version: Arc::new(Mutex::new(1)),
        }
    }

    /// Add an active namespace (for test setup)
    pub fn add_namespace(&self, name: &str) {
        self.put_namespace(name, None);
    }

    /// Add a namespace that is being torn down (for test setup)
    pub fn add_deleting_namespace(&self, name: &str) {
        self.put_namespace(name, deletion_timestamp());
    }

    fn put_namespace(&self, name: &str, deletion_timestamp: Option<Time>) {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                deletion_timestamp,
                ..Default::default()
            },
            ..Default::default()
        };
        lock(&self.namespaces).insert(name.to_string(), namespace);
    }

    /// Insert or overwrite an object without counting it as a write (for test setup)
    pub fn insert(&self, mut obj: K) -> K {
        let key = Self::key_of(&obj);
        obj.meta_mut().resource_version = Some(self.bump_version());
        lock(&self.objects).insert(key, obj.clone());
        obj
    }

    /// Request deletion the way a user would, without counting it as a write
    pub fn request_deletion(&self, namespace: &str, name: &str) {
        let _ = self.delete_object(namespace, name);
    }

    /// Current copy of an object
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.objects)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Namespaces holding an object called `name`
    pub fn namespaces_with(&self, name: &str) -> Vec<String> {
        lock(&self.objects)
            .keys()
            .filter(|(_, n)| n == name)
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    /// Make `operation` fail `times` times, optionally only in `namespace`
    pub fn fail(&self, operation: Operation, namespace: Option<&str>, times: usize) {
        lock(&self.failures).push(Failure {
            operation,
            namespace: namespace.map(str::to_string),
            remaining: Some(times),
        });
    }

    /// Make `operation` fail until `clear_failures` is called
    pub fn fail_always(&self, operation: Operation, namespace: Option<&str>) {
        lock(&self.failures).push(Failure {
            operation,
            namespace: namespace.map(str::to_string),
            remaining: None,
        });
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Delay only `operation` by `latency`, overriding `set_latency` for it
    pub fn set_operation_latency(&self, operation: Operation, latency: Duration) {
        let mut latencies = lock(&self.operation_latency);
        latencies.retain(|(op, _)| *op != operation);
        latencies.push((operation, latency));
    }

    /// Successful writes so far, as `(operation, namespace/name)`
    pub fn writes(&self) -> Vec<(Operation, String)> {
        lock(&self.writes).clone()
    }

    /// Forget recorded writes
    pub fn reset_writes(&self) {
        lock(&self.writes).clear();
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    fn key_of(obj: &K) -> (String, String) {
        let meta = obj.meta();
        (
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    fn bump_version(&self) -> String {
        let mut next = lock(&self.next_version);
        let version = *next;
        *next += 1;
        version.to_string()
    }

    async fn enter(&self, operation: Operation, namespace: Option<&str>) -> Result<(), StoreError> {
        let latency = lock(&self.operation_latency)
            .iter()
            .find(|(op, _)| *op == operation)
            .map(|(_, latency)| *latency)
            .or(*lock(&self.latency));
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut failures = lock(&self.failures);
        let hit = failures.iter_mut().position(|f| {
            f.operation == operation
                && f.remaining != Some(0)
                && (f.namespace.is_none() || f.namespace.as_deref() == namespace)
        });
        if let Some(index) = hit {
            let failure = &mut failures[index];
            if let Some(remaining) = failure.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(StoreError::Unavailable(format!(
                "injected {:?} failure in {}",
                operation,
                namespace.unwrap_or("<cluster>")
            )));
        }
        Ok(())
    }

    fn record_write(&self, operation: Operation, key: String) {
        lock(&self.writes).push((operation, key));
    }

    fn delete_object(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = lock(&self.objects);
        let Some(obj) = objects.get_mut(&key) else {
            return Err(StoreError::NotFound(format!("{}/{}", namespace, name)));
        };
        let has_finalizers = obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty());
        if has_finalizers {
            let meta = obj.meta_mut();
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = deletion_timestamp();
                meta.resource_version = Some(self.bump_version());
            }
        } else {
            objects.remove(&key);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K: Replicable> ObjectStore<K> for MockObjectStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.enter(Operation::Get, Some(namespace)).await?;
        self.object(namespace, name)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", namespace, name)))
    }

    async fn list(&self, namespace: &str, labels: &Labels) -> Result<Vec<K>, StoreError> {
        self.enter(Operation::List, Some(namespace)).await?;
        let objects = lock(&self.objects);
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| {
                let have = obj.meta().labels.as_ref();
                labels
                    .iter()
                    .all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = Self::key_of(obj);
        self.enter(Operation::Create, Some(&namespace)).await?;
        if name.is_empty() || namespace.is_empty() {
            return Err(StoreError::InvalidObject(format!("missing name or namespace: {}", object_key(obj))));
        }
        let key = (namespace, name);
        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{}/{} already exists", key.0, key.1)));
        }
        let mut stored = obj.clone();
        {
            let meta = stored.meta_mut();
            meta.resource_version = Some(self.bump_version());
            meta.deletion_timestamp = None;
        }
        objects.insert(key.clone(), stored.clone());
        drop(objects);
        self.record_write(Operation::Create, format!("{}/{}", key.0, key.1));
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = Self::key_of(obj);
        self.enter(Operation::Update, Some(&namespace)).await?;
        let key = (namespace, name);
        let key_str = format!("{}/{}", key.0, key.1);
        let mut objects = lock(&self.objects);
        let Some(current) = objects.get(&key) else {
            return Err(StoreError::NotFound(key_str));
        };
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(StoreError::Conflict(format!("{} has been modified", key_str)));
        }

        let mut stored = obj.clone();
        // deletionTimestamp is owned by the server
        stored.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        let deleting = stored.meta().deletion_timestamp.is_some();
        let finalizers_left = stored.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty());

        if deleting && !finalizers_left {
            objects.remove(&key);
        } else {
            stored.meta_mut().resource_version = Some(self.bump_version());
            objects.insert(key, stored.clone());
        }
        drop(objects);
        self.record_write(Operation::Update, key_str);
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.enter(Operation::Delete, Some(namespace)).await?;
        self.delete_object(namespace, name)?;
        self.record_write(Operation::Delete, format!("{}/{}", namespace, name));
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        self.enter(Operation::ListNamespaces, None).await?;
        Ok(lock(&self.namespaces).values().cloned().collect())
    }

    async fn record_event(&self, target: &K, severity: EventSeverity, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            key: object_key(target),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::Role;

    fn role(namespace: &str, name: &str, finalizers: Option<Vec<String>>) -> Role {
        Role {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                finalizers,
                ..Default::default()
            },
            rules: None,
        }
    }

    #[tokio::test]
    async fn test_update_rejects_stale_resource_version() {
        let store = MockObjectStore::<Role>::new();
        let stored = store.insert(role("default", "view", None));

        let mut first = stored.clone();
        first.rules = Some(vec![]);
        store.update(&first).await.unwrap();

        let result = store.update(&stored).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_only_marks_object() {
        let store = MockObjectStore::<Role>::new();
        store.insert(role("kube-system", "view", Some(vec!["cleanup".to_string()])));

        store.delete("kube-system", "view").await.unwrap();
        let mut marked = store.object("kube-system", "view").unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = Some(vec![]);
        store.update(&marked).await.unwrap();
        assert!(store.object("kube-system", "view").is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MockObjectStore::<Role>::new();
        store.insert(role("a", "view", None));
        store.fail(Operation::Get, Some("a"), 1);

        assert!(store.get("a", "view").await.is_err());
        assert!(store.get("a", "view").await.is_ok());
    }

    #[tokio::test]
    async fn test_operation_latency_only_delays_that_operation() {
        let store = MockObjectStore::<Role>::new();
        store.insert(role("a", "view", None));
        store.set_operation_latency(Operation::Get, Duration::from_millis(200));

        let fast = tokio::time::timeout(Duration::from_millis(100), store.list_namespaces()).await;
        assert!(fast.is_ok());
        let slow = tokio::time::timeout(Duration::from_millis(100), store.get("a", "view")).await;
        assert!(slow.is_err());

        // A per-operation latency wins over the global one
        store.set_latency(Duration::from_millis(200));
        store.set_operation_latency(Operation::ListNamespaces, Duration::ZERO);
        let fast = tokio::time::timeout(Duration::from_millis(100), store.list_namespaces()).await;
        assert!(fast.is_ok());
        let slow = tokio::time::timeout(Duration::from_millis(100), store.list("a", &Labels::new())).await;
        assert!(slow.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MockObjectStore::<Role>::new();
        let err = store.delete("default", "view").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let store = MockObjectStore::<Role>::new();
        let mut labeled = role("kube-system", "view", None);
        labeled.metadata.labels = Some(crate::object::labels([("component", "userClusterRole")]));
        store.insert(labeled);
        store.insert(role("kube-system", "plain", None));
        let mut elsewhere = role("default", "view", None);
        elsewhere.metadata.labels = Some(crate::object::labels([("component", "userClusterRole")]));
        store.insert(elsewhere);

        let found = store
            .list("kube-system", &crate::object::labels([("component", "userClusterRole")]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("view"));
    }
}
