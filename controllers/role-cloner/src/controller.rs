//! Main controller implementation.
//!
//! Wires the reconciler into a kube-runtime `Controller`: labeled template Roles
//! in the source namespace are the primary resource, and changes to any labeled
//! Role or any Namespace in the cluster re-queue every template through
//! `reconcile_on`.
//! The probe server runs next to it.

use crate::backoff::BackoffTracker;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::{self, Metrics, ProbeState};
use crate::reconciler::Reconciler;
use crate::watcher::{EventMapper, change_notifications, template_requests};
use fanout_store::{KubeStore, ObjectStore, Replicable, object_key};
use futures::{Stream, StreamExt};
use k8s_openapi::api::rbac::v1::Role;
use kube::{Api, Client, Resource};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller as RuntimeController, watcher};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name reported on recorded events.
pub const CONTROLLER_NAME: &str = "role-cloner-controller";

/// Shared state handed to every reconcile call.
pub struct Context<K: Replicable> {
    reconciler: Reconciler<K>,
    backoff: BackoffTracker,
    metrics: Arc<Metrics>,
}

impl<K: Replicable> Context<K> {
    /// Bundles the reconciler with its backoff state and metrics.
    pub fn new(reconciler: Reconciler<K>, backoff: BackoffTracker, metrics: Arc<Metrics>) -> Self {
        Self {
            reconciler,
            backoff,
            metrics,
        }
    }
}

/// Reconciles one template and records the result.
///
/// Success waits for the next change, failures go through `error_policy`.
pub async fn reconcile<K: Replicable>(template: Arc<K>, ctx: Arc<Context<K>>) -> Result<Action, ControllerError> {
    let key = object_key(template.as_ref());
    let meta = template.meta();
    let (Some(namespace), Some(name)) = (meta.namespace.as_deref(), meta.name.as_deref()) else {
        return Err(ControllerError::InvalidObject(format!("template {} missing name or namespace", key)));
    };

    let started = Instant::now();
    match ctx.reconciler.reconcile(namespace, name).await {
        Ok(outcome) => {
            ctx.metrics.record_success(&outcome, started.elapsed());
            ctx.backoff.reset(&key);
            debug!("Reconcile of {} finished in state {:?}", key, outcome.state);
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.metrics.record_error(started.elapsed());
            Err(e)
        }
    }
}

/// Requeues a failed template with per-template Fibonacci backoff.
pub fn error_policy<K: Replicable>(template: Arc<K>, error: &ControllerError, ctx: Arc<Context<K>>) -> Action {
    let key = object_key(template.as_ref());
    let delay = ctx.backoff.next_delay(&key);
    warn!("Reconciliation error for {}: {} (retrying in {:?})", key, error, delay);
    Action::requeue(delay)
}

/// Main controller for template fan-out.
pub struct Controller {
    reconcile_loop: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates the controller and starts its tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Role Cloner Controller");

        let client = Client::try_default().await?;
        let metrics = Arc::new(Metrics::new()?);
        let probes = ProbeState::new(Arc::clone(&metrics));

        let store: Arc<dyn ObjectStore<Role>> = Arc::new(KubeStore::<Role>::new(client.clone(), CONTROLLER_NAME));
        let reconciler = Reconciler::new(Arc::clone(&store), config.fan_out.clone(), config.reconcile_timeout);
        let mapper = Arc::new(EventMapper::new(store, config.fan_out.clone()));
        let ctx = Arc::new(Context::new(
            reconciler,
            BackoffTracker::new(config.backoff_min, config.backoff_max),
            metrics,
        ));

        let reconcile_loop = {
            let client = client.clone();
            let config = config.clone();
            let probes = probes.clone();
            tokio::spawn(async move { run_reconcile_loop(client, config, mapper, ctx, probes).await })
        };
        let probe_server = {
            let addr = config.probe_addr;
            tokio::spawn(async move { metrics::serve(addr, probes).await.map_err(ControllerError::from) })
        };

        Ok(Self {
            reconcile_loop,
            probe_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Role Cloner Controller running");

        tokio::select! {
            result = &mut self.reconcile_loop => {
                result.map_err(|e| ControllerError::Watch(format!("Reconcile loop panicked: {}", e)))??;
                info!("Reconcile loop stopped");
            }
            result = &mut self.probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))??;
                warn!("Probe server stopped");
            }
        }

        self.reconcile_loop.abort();
        self.probe_server.abort();
        Ok(())
    }
}

/// Marks the probes ready on the first notification, which only arrives once
/// a watch has finished its initial list.
fn ready_on_first_notification<S>(notifications: S, probes: ProbeState) -> impl Stream<Item = ()> + Send + 'static
where
    S: Stream<Item = ()> + Send + 'static,
{
    notifications.inspect(move |()| {
        if !probes.is_ready() {
            info!("Initial watch sync complete, controller ready");
            probes.set_ready();
        }
    })
}

async fn run_reconcile_loop(
    client: Client,
    config: ControllerConfig,
    mapper: Arc<EventMapper<Role>>,
    ctx: Arc<Context<Role>>,
    probes: ProbeState,
) -> Result<(), ControllerError> {
    let fan_out = &config.fan_out;
    info!(
        "Watching {} templates in {} ({})",
        Role::kind(&()),
        fan_out.source_namespace,
        fan_out.label_selector()
    );

    let templates: Api<Role> = Api::namespaced(client.clone(), &fan_out.source_namespace);
    let notifications = ready_on_first_notification(change_notifications::<Role>(client, fan_out), probes);
    let trigger = template_requests(notifications, mapper);

    // Debounce batches bursts of changes, concurrency bounds parallel templates
    let runtime_config = RuntimeConfig::default()
        .debounce(config.debounce)
        .concurrency(config.concurrency);

    let controller = RuntimeController::new(templates, watcher::Config::default().labels(&fan_out.label_selector()))
        .with_config(runtime_config)
        .reconcile_on(trigger)
        .shutdown_on_signal();

    controller
        .run(reconcile::<Role>, error_policy::<Role>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {}/{}", obj.namespace.unwrap_or_default(), obj.name),
                Err(e) => error!("Controller error: {}", e),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanOutSettings;
    use crate::test_utils::*;
    use fanout_store::Operation;
    use std::time::Duration;

    fn context(store: &fanout_store::MockObjectStore<Role>) -> Arc<Context<Role>> {
        Arc::new(Context::new(
            create_test_reconciler(store),
            BackoffTracker::new(Duration::from_secs(5), Duration::from_secs(300)),
            Arc::new(Metrics::new().unwrap()),
        ))
    }

    #[tokio::test]
    async fn test_successful_reconcile_awaits_change() {
        let store = create_test_store(&["default", SOURCE]);
        let template = store.insert(create_test_template("view", vec![]));
        let ctx = context(&store);

        let action = reconcile(Arc::new(template), Arc::clone(&ctx)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(store.object("default", "view").is_some());

        let rendered = ctx.metrics.render().unwrap();
        assert!(rendered.contains(r#"role_cloner_reconciliations_total{result="success"} 1"#));
    }

    #[tokio::test]
    async fn test_error_policy_backs_off_until_success() {
        let store = create_test_store(&["default", SOURCE]);
        let template = Arc::new(store.insert(create_test_template("view", vec![])));
        store.fail(Operation::ListNamespaces, None, 3);
        let ctx = context(&store);

        let mut delays = Vec::new();
        for _ in 0..3 {
            let err = reconcile(Arc::clone(&template), Arc::clone(&ctx)).await.unwrap_err();
            delays.push(error_policy(Arc::clone(&template), &err, Arc::clone(&ctx)));
        }
        assert_eq!(
            delays,
            vec![
                Action::requeue(Duration::from_secs(5)),
                Action::requeue(Duration::from_secs(5)),
                Action::requeue(Duration::from_secs(10)),
            ]
        );

        // Template now carries the finalizer from the first attempt
        let template = Arc::new(store.object(SOURCE, "view").unwrap());
        reconcile(Arc::clone(&template), Arc::clone(&ctx)).await.unwrap();
        let err = ControllerError::Timeout(object_key(template.as_ref()));
        assert_eq!(
            error_policy(template, &err, ctx),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_template_without_namespace_is_rejected() {
        let store = create_test_store(&[SOURCE]);
        let mut template = create_test_template("view", vec![]);
        template.metadata.namespace = None;

        let err = reconcile(Arc::new(template), context(&store)).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidObject(_)));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_ready_only_after_first_notification() {
        let probes = ProbeState::new(Arc::new(Metrics::new().unwrap()));

        let none: Vec<()> = ready_on_first_notification(futures::stream::empty(), probes.clone())
            .collect()
            .await;
        assert!(none.is_empty());
        assert!(!probes.is_ready());

        let mut notifications = Box::pin(ready_on_first_notification(
            futures::stream::iter([(), ()]),
            probes.clone(),
        ));
        assert!(!probes.is_ready());
        notifications.next().await;
        assert!(probes.is_ready());
        notifications.next().await;
        assert!(probes.is_ready());
    }

    #[test]
    fn test_default_settings_select_user_cluster_roles() {
        assert_eq!(FanOutSettings::default().label_selector(), "component=userClusterRole");
    }
}
