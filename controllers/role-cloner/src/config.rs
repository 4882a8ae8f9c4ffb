//! Controller configuration.
//!
//! Everything is read from environment variables once at startup. The fan-out
//! settings (source namespace, discovery label, finalizer) default to the
//! values the user-cluster role templates have always used.

use crate::error::ControllerError;
use fanout_store::{Labels, labels};
use std::net::SocketAddr;
use std::time::Duration;

/// Namespace holding the template Roles.
pub const DEFAULT_SOURCE_NAMESPACE: &str = "kube-system";
/// Label key marking a Role as a template.
pub const DEFAULT_TEMPLATE_LABEL_KEY: &str = "component";
/// Label value marking a Role as a template.
pub const DEFAULT_TEMPLATE_LABEL_VALUE: &str = "userClusterRole";
/// Finalizer guarding replica cleanup.
pub const DEFAULT_CLEANUP_FINALIZER: &str = "kubermatic.io/user-cluster-role";

/// What gets fanned out, from where, and which finalizer guards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutSettings {
    /// Namespace holding the templates
    pub source_namespace: String,
    /// Discovery label key
    pub label_key: String,
    /// Discovery label value
    pub label_value: String,
    /// Finalizer token guarding replica cleanup
    pub finalizer: String,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            source_namespace: DEFAULT_SOURCE_NAMESPACE.to_string(),
            label_key: DEFAULT_TEMPLATE_LABEL_KEY.to_string(),
            label_value: DEFAULT_TEMPLATE_LABEL_VALUE.to_string(),
            finalizer: DEFAULT_CLEANUP_FINALIZER.to_string(),
        }
    }
}

impl FanOutSettings {
    /// Labels every template carries.
    pub fn template_labels(&self) -> Labels {
        labels([(self.label_key.as_str(), self.label_value.as_str())])
    }

    /// Equality selector matching template objects.
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.label_key, self.label_value)
    }
}

/// Full controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// What gets fanned out
    pub fan_out: FanOutSettings,
    /// Maximum templates reconciled in parallel
    pub concurrency: u16,
    /// Quiet period before a queued template is reconciled
    pub debounce: Duration,
    /// Deadline for one reconcile pass
    pub reconcile_timeout: Duration,
    /// First requeue delay after a failure
    pub backoff_min: Duration,
    /// Requeue delay cap
    pub backoff_max: Duration,
    /// Listener for health, readiness and metrics
    pub probe_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fan_out: FanOutSettings::default(),
            concurrency: 3,
            debounce: Duration::from_secs(5),
            reconcile_timeout: Duration::from_secs(60),
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let fan_out = FanOutSettings {
            source_namespace: string("SOURCE_NAMESPACE", DEFAULT_SOURCE_NAMESPACE),
            label_key: string("TEMPLATE_LABEL_KEY", DEFAULT_TEMPLATE_LABEL_KEY),
            label_value: string("TEMPLATE_LABEL_VALUE", DEFAULT_TEMPLATE_LABEL_VALUE),
            finalizer: string("CLEANUP_FINALIZER", DEFAULT_CLEANUP_FINALIZER),
        };

        let concurrency = parse(&lookup, "RECONCILE_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let seconds = |key: &str, default: Duration| -> Result<Duration, ControllerError> {
            parse(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };
        let backoff_min = seconds("BACKOFF_MIN_SECS", defaults.backoff_min)?;
        let backoff_max = seconds("BACKOFF_MAX_SECS", defaults.backoff_max)?;
        if backoff_min.is_zero() || backoff_min > backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "backoff bounds must satisfy 0 < BACKOFF_MIN_SECS ({}) <= BACKOFF_MAX_SECS ({})",
                backoff_min.as_secs(),
                backoff_max.as_secs()
            )));
        }

        let reconcile_timeout = seconds("RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout)?;
        if reconcile_timeout.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            fan_out,
            concurrency,
            debounce: seconds("RECONCILE_DEBOUNCE_SECS", defaults.debounce)?,
            reconcile_timeout,
            backoff_min,
            backoff_max,
            probe_addr: parse(&lookup, "PROBE_ADDR", defaults.probe_addr)?,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{} has invalid value {:?}: {}", key, raw, e))
        }),
        _ => Ok(default),
    }
}
