//! Role Cloner Controller
//!
//! Replicates template Roles from the source namespace into every other
//! namespace:
//! - Roles labeled `component=userClusterRole` in `kube-system` are templates
//! - each template gets a replica with the same name and rules in every namespace
//! - rule changes propagate, drifted replicas are reverted
//! - deleting a template removes all its replicas before the template goes away

mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod namespaces;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use anyhow::{Context, Result};
use config::ControllerConfig;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls-tls needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Role Cloner Controller");

    let config = ControllerConfig::from_env().context("failed to load configuration")?;
    info!("Configuration:");
    info!("  Source namespace: {}", config.fan_out.source_namespace);
    info!("  Template selector: {}", config.fan_out.label_selector());
    info!("  Finalizer: {}", config.fan_out.finalizer);
    info!("  Concurrency: {}, debounce: {:?}", config.concurrency, config.debounce);
    info!("  Reconcile timeout: {:?}", config.reconcile_timeout);
    info!("  Probe address: {}", config.probe_addr);

    let controller = Controller::new(config)
        .await
        .context("failed to initialize controller")?;
    controller.run().await?;

    info!("Role Cloner Controller stopped");
    Ok(())
}
