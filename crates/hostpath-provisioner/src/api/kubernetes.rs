use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{future, stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Event, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, WatchEvent};
use kube::Client;
use kube_runtime::watcher::Event as StreamEvent;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ApiError, ClusterApi, LeaderLock, WatchStream};
use crate::leader::{LeaderElectionRecord, LEADER_ANNOTATION};

/// [`ClusterApi`] backed by a live API server.
///
/// The leader record lives in an annotation on an `Endpoints` object, which
/// every cluster version the provisioner supports can store. Every request is
/// bounded by `request_timeout`; a request that runs over is reported as
/// [`ApiError::Transient`].
///
/// Watches list everything first and then watch from the listed version until
/// the server closes the connection or an error comes through. They do not
/// resume on their own, so every reconnect starts from a fresh listing.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
    lock_namespace: String,
    lock_name: String,
    request_timeout: Duration,
    // The lock object as last read or written
    lock: Arc<Mutex<Option<Endpoints>>>,
}

impl KubeApi {
    /// Creates an adapter using `client`, with the election lock stored at
    /// `lock_namespace/lock_name`.
    pub fn new(
        client: Client,
        lock_namespace: impl Into<String>,
        lock_name: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        KubeApi {
            client,
            lock_namespace: lock_namespace.into(),
            lock_name: lock_name.into(),
            request_timeout,
            lock: Arc::new(Mutex::new(None)),
        }
    }

    async fn call<T, F>(&self, request: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::Transient(format!(
                "request did not complete within {:?}",
                self.request_timeout
            ))),
        }
    }

    fn locks(&self) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), &self.lock_namespace)
    }

    fn new_lock_object(&self, record: &LeaderElectionRecord) -> Endpoints {
        let mut annotations = BTreeMap::new();
        annotations.insert(LEADER_ANNOTATION.to_string(), record.to_annotation());
        Endpoints {
            metadata: ObjectMeta {
                name: Some(self.lock_name.clone()),
                namespace: Some(self.lock_namespace.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// The lock object at `resource_version`, from the last read if it is
    /// still that version. Fails with a conflict if the lock is gone.
    async fn current_lock(&self, resource_version: &str) -> Result<Endpoints, ApiError> {
        if let Some(lock) = self.lock.lock().await.as_ref() {
            if lock.metadata.resource_version.as_deref() == Some(resource_version) {
                return Ok(lock.clone());
            }
        }
        match self.call(self.locks().get(&self.lock_name)).await {
            Err(ApiError::NotFound(message)) => Err(ApiError::Conflict(message)),
            other => other,
        }
    }

    fn list_then_watch<K>(&self, api: Api<K>) -> WatchStream<K>
    where
        K: Clone + DeserializeOwned + Debug + Send + 'static,
    {
        let this = self.clone();
        let connect = async move {
            let params = ListParams::default();
            let listing = this.call(api.list(&params)).await?;
            let version = listing.metadata.resource_version.clone().unwrap_or_default();
            let updates = this.call(api.watch(&params, &version)).await?;
            let updates = updates.map_err(ApiError::from).try_filter_map(|event| {
                future::ready(match event {
                    WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                        Ok(Some(StreamEvent::Applied(object)))
                    }
                    WatchEvent::Deleted(object) => Ok(Some(StreamEvent::Deleted(object))),
                    WatchEvent::Bookmark(_) => Ok(None),
                    WatchEvent::Error(e) => Err(ApiError::from(e)),
                })
            });
            let restarted = stream::once(future::ready(Ok(StreamEvent::Restarted(listing.items))));
            Ok::<_, ApiError>(restarted.chain(updates))
        };
        stream::once(connect).try_flatten().boxed()
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeApi {
    async fn server_version(&self) -> Result<String, ApiError> {
        let info = self.call(self.client.apiserver_version()).await?;
        Ok(info.git_version)
    }

    fn watch_claims(&self) -> WatchStream<PersistentVolumeClaim> {
        self.list_then_watch(Api::all(self.client.clone()))
    }

    fn watch_volumes(&self) -> WatchStream<PersistentVolume> {
        self.list_then_watch(Api::all(self.client.clone()))
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, ApiError> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        self.call(api.get(name)).await
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, ApiError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.call(api.get(name)).await
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<(), ApiError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.call(api.create(&PostParams::default(), volume)).await?;
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), ApiError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match self.call(api.delete(name, &DeleteParams::default())).await {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound(_)) => {
                debug!(volume = name, "Volume already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_leader_record(&self) -> Result<LeaderLock, ApiError> {
        let locks = self.locks();
        let lock = match self.call(locks.get(&self.lock_name)).await {
            Ok(lock) => lock,
            Err(ApiError::NotFound(_)) => return Ok(LeaderLock::default()),
            Err(e) => return Err(e),
        };
        let record = match lock
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LEADER_ANNOTATION))
        {
            Some(value) => LeaderElectionRecord::from_annotation(value).map_err(|e| {
                ApiError::Fatal(format!("malformed leader record on {}: {}", self.lock_name, e))
            })?,
            None => None,
        };
        let resource_version = lock.metadata.resource_version.clone();
        *self.lock.lock().await = Some(lock);
        Ok(LeaderLock {
            record,
            resource_version,
        })
    }

    async fn update_leader_record(
        &self,
        record: &LeaderElectionRecord,
        resource_version: Option<&str>,
    ) -> Result<String, ApiError> {
        let locks = self.locks();
        let updated = match resource_version {
            None => {
                let lock = self.new_lock_object(record);
                match self.call(locks.create(&PostParams::default(), &lock)).await {
                    Err(ApiError::AlreadyExists(message)) => {
                        return Err(ApiError::Conflict(message))
                    }
                    other => other?,
                }
            }
            Some(expected) => {
                // Only the leader annotation changes; the rest of the object
                // is sent back as it was read.
                let mut lock = self.current_lock(expected).await?;
                lock.metadata.resource_version = Some(expected.to_string());
                lock.metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(LEADER_ANNOTATION.to_string(), record.to_annotation());
                self.call(locks.replace(&self.lock_name, &PostParams::default(), &lock))
                    .await?
            }
        };
        let version = updated.metadata.resource_version.clone().unwrap_or_default();
        *self.lock.lock().await = Some(updated);
        Ok(version)
    }

    async fn emit_event(&self, event: &Event) -> Result<(), ApiError> {
        let namespace = event.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        self.call(api.create(&PostParams::default(), event)).await?;
        Ok(())
    }
}
