//! Kubernetes-backed object store
//!
//! Thin wrapper around `kube::Api` that maps API responses into `StoreError`
//! and publishes events through the kube-runtime event recorder.

use crate::error::StoreError;
use crate::object::{Labels, Replicable};
use crate::store_trait::{EventSeverity, ObjectStore};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Object store backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore<K> {
    client: Client,
    recorder: Recorder,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Creates a store. `controller_name` is reported as the source of recorded events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self {
            client,
            recorder,
            _kind: PhantomData,
        }
    }

    /// Underlying Kubernetes client.
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

/// Renders a label set as a Kubernetes equality-based selector.
pub fn label_selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn required<'a>(value: Option<&'a str>, field: &str, kind: &str) -> Result<&'a str, StoreError> {
    value.ok_or_else(|| StoreError::InvalidObject(format!("{} missing {}", kind, field)))
}

#[async_trait::async_trait]
impl<K: Replicable> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let key = format!("{}/{}", namespace, name);
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await {
            Ok(Some(obj)) => Ok(obj),
            Ok(None) => Err(StoreError::NotFound(key)),
            Err(e) => Err(StoreError::from_kube(e, &key)),
        }
    }

    async fn list(&self, namespace: &str, labels: &Labels) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        let list = api
            .list(&params)
            .await
            .map_err(|e| StoreError::from_kube(e, namespace))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let namespace = required(obj.meta().namespace.as_deref(), "namespace", &K::kind(&()))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let key = crate::object::object_key(obj);
        debug!("Creating {} {}", K::kind(&()), key);
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &key))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let namespace = required(obj.meta().namespace.as_deref(), "namespace", &K::kind(&()))?;
        let name = required(obj.meta().name.as_deref(), "name", &K::kind(&()))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let key = format!("{}/{}", namespace, name);
        debug!("Replacing {} {}", K::kind(&()), key);
        // replace() sends the resourceVersion we read, so a concurrent write yields 409
        api.replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &key))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = format!("{}/{}", namespace, name);
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        debug!("Deleting {} {}", K::kind(&()), key);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &key))
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::from_kube(e, "namespaces"))?;
        Ok(list.items)
    }

    async fn record_event(&self, target: &K, severity: EventSeverity, reason: &str, message: &str) {
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &target.object_ref(&())).await {
            warn!(
                "Failed to record {} event on {} {}: {}",
                reason,
                K::kind(&()),
                crate::object::object_key(target),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::labels;

    #[test]
    fn test_label_selector_rendering() {
        assert_eq!(label_selector(&labels([("component", "userClusterRole")])), "component=userClusterRole");
        assert_eq!(label_selector(&labels([("b", "2"), ("a", "1")])), "a=1,b=2");
        assert_eq!(label_selector(&Labels::new()), "");
    }
}
