//! Change triggers for the fan-out controller.
//!
//! Replicas live in every namespace, so a change anywhere (a replica drifting,
//! a namespace appearing) can require work on any template. Rather than work
//! out which template a change belongs to, every change re-lists the labeled
//! templates in the source namespace and requests a reconcile for each one.
//! The controller queue collapses duplicate requests per template.
//!
//! Only objects carrying the template label are watched. Replicas are created
//! with the template's labels, so replica drift still shows up while unrelated
//! objects never trigger a re-list.

use crate::config::FanOutSettings;
use fanout_store::{ObjectStore, Replicable};
use futures::{Stream, StreamExt, stream};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client, Resource};
use kube_runtime::WatchStreamExt;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher::{self, Event};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Maps any change notification to reconcile requests for every template.
pub struct EventMapper<K: Replicable> {
    store: Arc<dyn ObjectStore<K>>,
    settings: FanOutSettings,
}

impl<K: Replicable> EventMapper<K> {
    /// Creates a mapper listing templates through `store`.
    pub fn new(store: Arc<dyn ObjectStore<K>>, settings: FanOutSettings) -> Self {
        Self { store, settings }
    }

    /// Lists labeled templates in the source namespace and returns one
    /// request per template.
    ///
    /// A failed listing is logged and yields no requests.
    pub async fn requests(&self) -> Vec<ObjectRef<K>> {
        let source = &self.settings.source_namespace;
        let templates = match self.store.list(source, &self.settings.template_labels()).await {
            Ok(templates) => templates,
            Err(e) => {
                error!(
                    "Failed to list {} templates in {} ({}): {}",
                    K::kind(&()),
                    source,
                    self.settings.label_selector(),
                    e
                );
                return Vec::new();
            }
        };

        let requests: Vec<ObjectRef<K>> = templates
            .iter()
            .filter_map(|template| template.meta().name.as_deref())
            .map(|name| ObjectRef::new(name).within(source))
            .collect();
        debug!("Mapped change to {} template request(s)", requests.len());
        requests
    }
}

/// Whether a watch event signals a change worth re-listing templates for.
///
/// The initial list is collapsed into its `InitDone`, the per-object
/// `Init`/`InitApply` events are ignored.
pub fn is_change_notification<T>(event: &Event<T>) -> bool {
    matches!(event, Event::Apply(_) | Event::Delete(_) | Event::InitDone)
}

/// Watch configuration for templates and replicas in every namespace.
pub fn object_watch_config(settings: &FanOutSettings) -> watcher::Config {
    watcher::Config::default().labels(&settings.label_selector())
}

/// Change notifications for labeled `K` objects and every Namespace in the cluster.
///
/// Watch errors are logged and skipped, the underlying watchers retry with
/// backoff.
pub fn change_notifications<K: Replicable>(
    client: Client,
    settings: &FanOutSettings,
) -> impl Stream<Item = ()> + Send + use<K> {
    let objects = watcher::watcher(Api::<K>::all(client.clone()), object_watch_config(settings))
        .default_backoff()
        .map(|event| event.map(|e| is_change_notification(&e)));
    let namespaces = watcher::watcher(Api::<Namespace>::all(client), watcher::Config::default())
        .default_backoff()
        .map(|event| event.map(|e| is_change_notification(&e)));

    stream::select(objects, namespaces).filter_map(|result| async move {
        match result {
            Ok(true) => Some(()),
            Ok(false) => None,
            Err(e) => {
                warn!("Watch error: {}", e);
                None
            }
        }
    })
}

/// Turns change notifications into template reconcile requests.
pub fn template_requests<K, S>(notifications: S, mapper: Arc<EventMapper<K>>) -> impl Stream<Item = ObjectRef<K>> + Send + 'static
where
    K: Replicable,
    S: Stream<Item = ()> + Send + 'static,
{
    notifications
        .then(move |()| {
            let mapper = Arc::clone(&mapper);
            async move { mapper.requests().await }
        })
        .flat_map(stream::iter)
}
