//! A dynamic provisioner for Kubernetes `hostPath` persistent volumes.
//!
//! The provisioner watches persistent volume claims whose storage class names
//! it, creates a directory for each one under a configured root, and saves a
//! matching `PersistentVolume`. When a volume it created is released and its
//! reclaim policy is `Delete`, the directory and the volume are removed again.
//!
//! Several replicas may run at once. Only the holder of a leader lease does
//! any work, and every volume is stamped with the identity of the replica that
//! created it, so a replica never deletes another one's volumes.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hostpath_provisioner::api::KubeApi;
//! use hostpath_provisioner::config::Config;
//! use hostpath_provisioner::signal::stop_channel;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default_config("/tmp/hostpath-provisioner", "k8s.io/minikube-hostpath");
//!     let client = kube::Client::try_default().await?;
//!     let api = KubeApi::new(
//!         client,
//!         config.lock_namespace.clone(),
//!         config.lock_name.clone(),
//!         config.retry_period,
//!     );
//!     let (_trigger, stop) = stop_channel();
//!     hostpath_provisioner::run(config, Arc::new(api), stop).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod api;
pub mod backoff;
pub mod config;
pub mod driver;
pub mod events;
pub mod identity;
pub mod leader;
pub mod provisioner;
pub mod queue;
pub mod reconciler;
pub mod signal;
/// A local cache of watched objects.
pub mod store;
/// Parsing of the API server's version.
pub mod version;

#[doc(inline)]
pub use provisioner::{run, ProvisionerError};
