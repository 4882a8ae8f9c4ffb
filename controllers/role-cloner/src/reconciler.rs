//! Reconciliation logic for template fan-out.
//!
//! One pass takes a template identity, re-reads the template and the namespace
//! list, and converges the replicas:
//! 1. Absent template: nothing to do
//! 2. Template being deleted with our finalizer: delete every replica, then drop the finalizer
//! 3. Template being deleted without our finalizer: nothing to do
//! 4. Active template without our finalizer: add it, then sync in the same pass
//! 5. Active template with our finalizer: create missing replicas, update drifted ones
//!
//! Nothing is cached between passes and every write is idempotent, so a pass
//! that failed halfway is simply run again by the controller.

use crate::config::FanOutSettings;
use crate::error::ControllerError;
use crate::namespaces::eligible_namespaces;
use fanout_store::{EventSeverity, ObjectStore, Replicable, has_finalizer, is_deleting, object_key};
use kube::Resource;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info};

/// Event reason recorded on a template when its reconciliation fails.
pub const RECONCILE_FAILED_REASON: &str = "ReconcilingError";

/// Lifecycle state of a template, derived fresh on every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateState {
    /// Template not found
    Absent,
    /// Deletion requested, our finalizer already gone
    DeletingWithoutFinalizer,
    /// Deletion requested, replicas still to be torn down
    DeletingWithFinalizer,
    /// Live template the finalizer has not been added to yet
    ActiveWithoutFinalizer,
    /// Live template guarded by our finalizer
    ActiveWithFinalizer,
}

impl TemplateState {
    /// Classifies `template` with respect to `finalizer`.
    pub fn of<K: Resource>(template: Option<&K>, finalizer: &str) -> Self {
        let Some(template) = template else {
            return TemplateState::Absent;
        };
        match (is_deleting(template), has_finalizer(template, finalizer)) {
            (true, true) => TemplateState::DeletingWithFinalizer,
            (true, false) => TemplateState::DeletingWithoutFinalizer,
            (false, false) => TemplateState::ActiveWithoutFinalizer,
            (false, true) => TemplateState::ActiveWithFinalizer,
        }
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// State the template was found in
    pub state: TemplateState,
    /// Replicas created
    pub created: usize,
    /// Replicas whose payload was rewritten
    pub updated: usize,
    /// Replicas deleted during teardown
    pub deleted: usize,
    /// Whether the finalizer was added in this pass
    pub finalizer_added: bool,
    /// Whether the finalizer was removed in this pass
    pub finalizer_removed: bool,
}

impl ReconcileOutcome {
    fn new(state: TemplateState) -> Self {
        Self {
            state,
            created: 0,
            updated: 0,
            deleted: 0,
            finalizer_added: false,
            finalizer_removed: false,
        }
    }

    /// Number of writes issued against the store.
    pub fn writes(&self) -> usize {
        self.created
            + self.updated
            + self.deleted
            + usize::from(self.finalizer_added)
            + usize::from(self.finalizer_removed)
    }
}

/// Keeps replicas of template objects in sync across namespaces.
pub struct Reconciler<K: Replicable> {
    store: Arc<dyn ObjectStore<K>>,
    settings: FanOutSettings,
    deadline: Duration,
}

impl<K: Replicable> Reconciler<K> {
    /// Creates a new reconciler. Each pass must finish within `deadline`.
    pub fn new(store: Arc<dyn ObjectStore<K>>, settings: FanOutSettings, deadline: Duration) -> Self {
        Self {
            store,
            settings,
            deadline,
        }
    }

    /// Fan-out settings this reconciler runs with.
    pub fn settings(&self) -> &FanOutSettings {
        &self.settings
    }

    /// Reconciles the template identified by `namespace/name`.
    ///
    /// The whole pass, template load included, must finish within the
    /// deadline. On failure a warning event is recorded against the template
    /// (when it could be loaded) before the error is returned for retry.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        let key = format!("{}/{}", namespace, name);
        debug!("Reconciling {} {}", K::kind(&()), key);

        // One deadline covers the template load and every write that follows
        let deadline = Instant::now() + self.deadline;

        let template = match timeout_at(deadline, self.store.get(namespace, name)).await {
            Ok(Ok(template)) => template,
            Ok(Err(e)) if e.is_not_found() => {
                debug!("{} {} not found, nothing to do", K::kind(&()), key);
                return Ok(ReconcileOutcome::new(TemplateState::Absent));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                // No template loaded, so there is nothing to record the event on
                error!("Timed out loading {} {}", K::kind(&()), key);
                return Err(ControllerError::Timeout(key));
            }
        };

        let result = match timeout_at(deadline, self.reconcile_template(template.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::Timeout(key.clone())),
        };

        match &result {
            Ok(outcome) if outcome.writes() > 0 => info!(
                "Reconciled {} {}: {} created, {} updated, {} deleted",
                K::kind(&()),
                key,
                outcome.created,
                outcome.updated,
                outcome.deleted
            ),
            Ok(_) => debug!("{} {} already converged", K::kind(&()), key),
            Err(e) => {
                error!("Failed to reconcile {} {}: {}", K::kind(&()), key, e);
                self.store
                    .record_event(&template, EventSeverity::Warning, RECONCILE_FAILED_REASON, &e.to_string())
                    .await;
            }
        }
        result
    }

    async fn reconcile_template(&self, template: K) -> Result<ReconcileOutcome, ControllerError> {
        let state = TemplateState::of(Some(&template), &self.settings.finalizer);
        let mut outcome = ReconcileOutcome::new(state);

        match state {
            TemplateState::Absent | TemplateState::DeletingWithoutFinalizer => {
                debug!("{} {} needs no work in state {:?}", K::kind(&()), object_key(&template), state);
            }
            TemplateState::DeletingWithFinalizer => {
                self.teardown(template, &mut outcome).await?;
            }
            TemplateState::ActiveWithoutFinalizer => {
                // The finalizer must be persisted before the first replica exists
                let template = self.add_finalizer(template).await?;
                outcome.finalizer_added = true;
                self.sync(&template, &mut outcome).await?;
            }
            TemplateState::ActiveWithFinalizer => {
                self.sync(&template, &mut outcome).await?;
            }
        }
        Ok(outcome)
    }

    async fn sync(&self, template: &K, outcome: &mut ReconcileOutcome) -> Result<(), ControllerError> {
        let name = template_name(template)?;
        let desired = template.payload();
        let namespaces = eligible_namespaces::<K, _>(self.store.as_ref(), &self.settings.source_namespace).await?;

        for namespace in namespaces {
            match self.store.get(&namespace, name).await {
                Err(e) if e.is_not_found() => {
                    // A replica created in this pass already matches, no comparison needed
                    let replica = template.replica_for(&namespace);
                    self.store
                        .create(&replica)
                        .await
                        .map_err(|source| replica_error("create", &namespace, name, source))?;
                    info!("Created {} {}/{}", K::kind(&()), namespace, name);
                    outcome.created += 1;
                }
                Err(source) => return Err(replica_error("get", &namespace, name, source)),
                Ok(mut existing) => {
                    if existing.payload() == desired {
                        continue;
                    }
                    // Only the payload is synced, labels stay as they were at creation
                    existing.set_payload(desired.clone());
                    self.store
                        .update(&existing)
                        .await
                        .map_err(|source| replica_error("update", &namespace, name, source))?;
                    info!("Updated {} {}/{}", K::kind(&()), namespace, name);
                    outcome.updated += 1;
                }
            }
        }
        Ok(())
    }

    async fn teardown(&self, template: K, outcome: &mut ReconcileOutcome) -> Result<(), ControllerError> {
        let name = template_name(&template)?.to_string();
        let namespaces = eligible_namespaces::<K, _>(self.store.as_ref(), &self.settings.source_namespace).await?;

        for namespace in namespaces {
            match self.store.delete(&namespace, &name).await {
                Ok(()) => {
                    info!("Deleted {} {}/{}", K::kind(&()), namespace, name);
                    outcome.deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(source) => {
                    return Err(ControllerError::ReplicaDelete {
                        namespace,
                        name,
                        source,
                    });
                }
            }
        }

        self.remove_finalizer(template).await?;
        outcome.finalizer_removed = true;
        Ok(())
    }

    async fn add_finalizer(&self, mut template: K) -> Result<K, ControllerError> {
        template
            .meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(self.settings.finalizer.clone());
        let key = object_key(&template);
        let updated = self.store.update(&template).await.map_err(|source| ControllerError::Finalizer {
            action: "add",
            key: key.clone(),
            source,
        })?;
        debug!("Added finalizer {} to {}", self.settings.finalizer, key);
        Ok(updated)
    }

    async fn remove_finalizer(&self, mut template: K) -> Result<(), ControllerError> {
        if let Some(finalizers) = template.meta_mut().finalizers.as_mut() {
            finalizers.retain(|f| f != &self.settings.finalizer);
        }
        let key = object_key(&template);
        self.store.update(&template).await.map_err(|source| ControllerError::Finalizer {
            action: "remove",
            key: key.clone(),
            source,
        })?;
        debug!("Removed finalizer {} from {}", self.settings.finalizer, key);
        Ok(())
    }
}

fn template_name<K: Resource>(template: &K) -> Result<&str, ControllerError> {
    template
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidObject("template missing name".to_string()))
}

fn replica_error(action: &'static str, namespace: &str, name: &str, source: fanout_store::StoreError) -> ControllerError {
    ControllerError::ReplicaSync {
        action,
        namespace: namespace.to_string(),
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_template;
    use fanout_store::mock::deletion_timestamp;

    const FINALIZER: &str = "kubermatic.io/user-cluster-role";

    #[test]
    fn test_state_classification() {
        let mut template = create_test_template("view", vec![]);
        assert_eq!(TemplateState::of::<k8s_openapi::api::rbac::v1::Role>(None, FINALIZER), TemplateState::Absent);
        assert_eq!(TemplateState::of(Some(&template), FINALIZER), TemplateState::ActiveWithoutFinalizer);

        template.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        assert_eq!(TemplateState::of(Some(&template), FINALIZER), TemplateState::ActiveWithFinalizer);

        template.metadata.deletion_timestamp = deletion_timestamp();
        assert_eq!(TemplateState::of(Some(&template), FINALIZER), TemplateState::DeletingWithFinalizer);

        template.metadata.finalizers = Some(vec!["someone-else".to_string()]);
        assert_eq!(TemplateState::of(Some(&template), FINALIZER), TemplateState::DeletingWithoutFinalizer);
    }

    #[test]
    fn test_outcome_write_count() {
        let mut outcome = ReconcileOutcome::new(TemplateState::ActiveWithoutFinalizer);
        assert_eq!(outcome.writes(), 0);
        outcome.finalizer_added = true;
        outcome.created = 2;
        assert_eq!(outcome.writes(), 3);
    }
}
