//! Test utilities for unit testing the reconciler
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::config::FanOutSettings;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use fanout_store::{MockObjectStore, labels};
#[cfg(test)]
use k8s_openapi::api::rbac::v1::{PolicyRule, Role};
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

/// Source namespace used throughout the tests
#[cfg(test)]
pub const SOURCE: &str = "kube-system";

/// Helper to create a policy rule
#[cfg(test)]
pub fn rule(verbs: &[&str], api_groups: &[&str], resources: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        verbs: owned(verbs),
        api_groups: Some(owned(api_groups)),
        resources: Some(owned(resources)),
        ..Default::default()
    }
}

/// Helper to create a labeled template Role in the source namespace
#[cfg(test)]
pub fn create_test_template(name: &str, rules: Vec<PolicyRule>) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(SOURCE.to_string()),
            labels: Some(labels([("component", "userClusterRole")])),
            ..Default::default()
        },
        rules: Some(rules),
    }
}

/// Helper to create a mock store holding the given namespaces
#[cfg(test)]
pub fn create_test_store(namespaces: &[&str]) -> MockObjectStore<Role> {
    let store = MockObjectStore::new();
    for ns in namespaces {
        store.add_namespace(ns);
    }
    store
}

/// Helper to create a reconciler over a mock store with default settings
#[cfg(test)]
pub fn create_test_reconciler(store: &MockObjectStore<Role>) -> Reconciler<Role> {
    create_test_reconciler_with_deadline(store, Duration::from_secs(10))
}

/// Helper to create a reconciler with a custom per-pass deadline
#[cfg(test)]
pub fn create_test_reconciler_with_deadline(store: &MockObjectStore<Role>, deadline: Duration) -> Reconciler<Role> {
    Reconciler::new(Arc::new(store.clone()), FanOutSettings::default(), deadline)
}
