//! Replicable objects and metadata helpers
//!
//! A template object is any namespaced Kubernetes resource whose "payload"
//! can be copied verbatim into other namespaces. The payload is whatever the
//! replicas must keep deep-equal to the template; everything else in the
//! object (metadata, status) belongs to each replica.

use k8s_openapi::api::rbac::v1::{PolicyRule, Role};
use kube::Resource;
use kube::core::NamespaceResourceScope;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Label set used for discovery selectors.
pub type Labels = BTreeMap<String, String>;

/// Builds a label set from string pairs.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A namespaced resource that can be fanned out into other namespaces.
pub trait Replicable:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Default
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The content replicas are kept equal to.
    type Payload: Clone + PartialEq + Debug + Send + Sync;

    /// Returns a copy of the object's payload.
    fn payload(&self) -> Self::Payload;

    /// Overwrites the object's payload.
    fn set_payload(&mut self, payload: Self::Payload);

    /// Builds a fresh replica of this object for `namespace`.
    ///
    /// Only name, labels and payload are carried over; uid, resource version,
    /// finalizers and every other piece of server-managed metadata start empty.
    fn replica_for(&self, namespace: &str) -> Self {
        let mut replica = Self::default();
        {
            let meta = replica.meta_mut();
            meta.name = self.meta().name.clone();
            meta.namespace = Some(namespace.to_string());
            meta.labels = self.meta().labels.clone();
        }
        replica.set_payload(self.payload());
        replica
    }
}

impl Replicable for Role {
    type Payload = Option<Vec<PolicyRule>>;

    fn payload(&self) -> Self::Payload {
        self.rules.clone()
    }

    fn set_payload(&mut self, payload: Self::Payload) {
        self.rules = payload;
    }
}

/// Returns true once deletion of the object has been requested.
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Returns true if `finalizer` is present on the object.
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// `namespace/name` key used in logs and error messages.
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or("<unknown>")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn template() -> Role {
        Role {
            metadata: ObjectMeta {
                name: Some("view".to_string()),
                namespace: Some("kube-system".to_string()),
                labels: Some(labels([("component", "userClusterRole")])),
                finalizers: Some(vec!["kubermatic.io/user-cluster-role".to_string()]),
                resource_version: Some("42".to_string()),
                uid: Some("6f1c".to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: vec!["get".to_string()],
                resources: Some(vec!["pods".to_string()]),
                ..Default::default()
            }]),
        }
    }

    #[test]
    fn test_replica_carries_name_labels_and_payload_only() {
        let template = template();
        let replica = template.replica_for("default");

        assert_eq!(replica.metadata.name.as_deref(), Some("view"));
        assert_eq!(replica.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(replica.metadata.labels, template.metadata.labels);
        assert_eq!(replica.payload(), template.payload());
        assert!(replica.metadata.finalizers.is_none());
        assert!(replica.metadata.resource_version.is_none());
        assert!(replica.metadata.uid.is_none());
    }

    #[test]
    fn test_has_finalizer() {
        let mut role = template();
        assert!(has_finalizer(&role, "kubermatic.io/user-cluster-role"));
        assert!(!has_finalizer(&role, "other"));

        role.metadata.finalizers = None;
        assert!(!has_finalizer(&role, "kubermatic.io/user-cluster-role"));
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(&template()), "kube-system/view");
        assert_eq!(object_key(&Role::default()), "/<unknown>");
    }
}
