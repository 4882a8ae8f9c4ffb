//! Target namespace enumeration.

use crate::error::ControllerError;
use fanout_store::{ObjectStore, Replicable};

/// Returns the namespaces replicas should exist in.
///
/// Every namespace except `source_namespace` and namespaces that are being
/// deleted. Writes into a terminating namespace either fail or are garbage
/// collected right away, so they are skipped. Read failures are returned as-is;
/// there is no cached fallback.
pub async fn eligible_namespaces<K, S>(
    store: &S,
    source_namespace: &str,
) -> Result<Vec<String>, ControllerError>
where
    K: Replicable,
    S: ObjectStore<K> + ?Sized,
{
    let namespaces = store
        .list_namespaces()
        .await
        .map_err(ControllerError::Namespaces)?;

    Ok(namespaces
        .into_iter()
        .filter_map(|ns| {
            let name = ns.metadata.name?;
            if name == source_namespace || ns.metadata.deletion_timestamp.is_some() {
                None
            } else {
                Some(name)
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_store::{MockObjectStore, Operation};
    use k8s_openapi::api::rbac::v1::Role;

    #[tokio::test]
    async fn test_excludes_source_and_deleting_namespaces() {
        let store = MockObjectStore::<Role>::new();
        store.add_namespace("default");
        store.add_namespace("kube-system");
        store.add_namespace("test");
        store.add_deleting_namespace("going-away");

        let mut namespaces = eligible_namespaces::<Role, _>(&store, "kube-system").await.unwrap();
        namespaces.sort();
        assert_eq!(namespaces, vec!["default".to_string(), "test".to_string()]);
    }

    #[tokio::test]
    async fn test_list_failure_propagates() {
        let store = MockObjectStore::<Role>::new();
        store.add_namespace("default");
        store.fail(Operation::ListNamespaces, None, 1);

        let err = eligible_namespaces::<Role, _>(&store, "kube-system").await.unwrap_err();
        assert!(matches!(err, ControllerError::Namespaces(_)));
    }

    #[tokio::test]
    async fn test_only_source_namespace_yields_empty_set() {
        let store = MockObjectStore::<Role>::new();
        store.add_namespace("kube-system");

        assert!(eligible_namespaces::<Role, _>(&store, "kube-system").await.unwrap().is_empty());
    }
}
