//! Object store for namespace fan-out controllers
//!
//! A small, typed facade over the Kubernetes API covering exactly what a
//! template fan-out controller needs: namespaced get/list/create/update/delete,
//! namespace enumeration and event recording.
//!
//! # Example
//!
//! ```no_run
//! use fanout_store::{KubeStore, ObjectStore, labels};
//! use k8s_openapi::api::rbac::v1::Role;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store: KubeStore<Role> = KubeStore::new(client, "role-cloner");
//!
//! // Templates live in one namespace and carry a marker label
//! let templates = store
//!     .list("kube-system", &labels([("component", "userClusterRole")]))
//!     .await?;
//!
//! for template in templates {
//!     println!("{:?}", template.metadata.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **`Replicable`**: describes which part of an object is copied into replicas
//! - **`ObjectStore`**: async trait implemented by the real and the mock store
//! - **`test-util`**: enables `MockObjectStore`, an in-memory store with
//!   failure injection for unit tests

pub mod client;
pub mod error;
pub mod object;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeStore;
pub use error::StoreError;
pub use object::{has_finalizer, is_deleting, labels, object_key, Labels, Replicable};
pub use store_trait::{EventSeverity, ObjectStore};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockObjectStore, Operation};
