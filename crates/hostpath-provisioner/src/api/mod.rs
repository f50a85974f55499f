//! The seam between the provisioner and the cluster API.
//!
//! Everything the reconciler and the leader elector need from the cluster
//! goes through [`ClusterApi`], so the control loop only ever sees objects
//! and [`ApiError`] kinds, never HTTP.
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Event, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube_runtime::watcher::Event as WatchEvent;

use crate::leader::LeaderElectionRecord;

mod error;
mod kubernetes;
#[cfg(test)]
pub(crate) mod memory;

pub use self::error::ApiError;
pub use self::kubernetes::KubeApi;

/// A restartable stream of watch events for one kind of object.
///
/// Every (re)connection starts with a [`WatchEvent::Restarted`] carrying the
/// full current list, followed by incremental `Applied`/`Deleted` events.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ApiError>>;

/// The leader record as last read from the lock object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaderLock {
    /// The decoded record, if the lock object carries one.
    pub record: Option<LeaderElectionRecord>,
    /// The lock object's resource version, or `None` if it does not exist.
    pub resource_version: Option<String>,
}

/// Operations the provisioner performs against the cluster.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// The API server's `gitVersion`, e.g. `v1.22.3`.
    async fn server_version(&self) -> Result<String, ApiError>;

    /// Watches persistent volume claims across all namespaces.
    fn watch_claims(&self) -> WatchStream<PersistentVolumeClaim>;

    /// Watches persistent volumes.
    fn watch_volumes(&self) -> WatchStream<PersistentVolume>;

    /// Fetches a storage class by name.
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, ApiError>;

    /// Fetches the current state of a volume directly from the API server.
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, ApiError>;

    /// Creates a volume. Fails with [`ApiError::AlreadyExists`] if the name is taken.
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<(), ApiError>;

    /// Deletes a volume. A volume that is already gone is not an error.
    async fn delete_volume(&self, name: &str) -> Result<(), ApiError>;

    /// Reads the leader election lock.
    async fn get_leader_record(&self) -> Result<LeaderLock, ApiError>;

    /// Writes the leader record, creating the lock object when
    /// `resource_version` is `None`. Returns the new resource version.
    ///
    /// Fails with [`ApiError::Conflict`] if the lock changed since
    /// `resource_version` was read, or was created by someone else first.
    async fn update_leader_record(
        &self,
        record: &LeaderElectionRecord,
        resource_version: Option<&str>,
    ) -> Result<String, ApiError>;

    /// Records an event. Callers treat failure as best effort.
    async fn emit_event(&self, event: &Event) -> Result<(), ApiError>;
}
