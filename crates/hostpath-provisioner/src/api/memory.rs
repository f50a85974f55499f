//! An in-memory cluster for tests.
//!
//! Objects live in a shared [`Cluster`]; each [`MemoryApi`] is one replica's
//! connection to it, with its own injected failures and call log, so tests
//! can partition one replica while another keeps working.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures::{future, stream, StreamExt};
use k8s_openapi::api::core::v1::{Event, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use kube_runtime::watcher::Event as WatchEvent;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{ApiError, ClusterApi, LeaderLock, WatchStream};
use crate::leader::LeaderElectionRecord;

/// The calls a [`MemoryApi`] records and can be told to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    ServerVersion,
    WatchClaims,
    WatchVolumes,
    GetStorageClass,
    GetVolume,
    CreateVolume,
    DeleteVolume,
    GetLeaderRecord,
    UpdateLeaderRecord,
    EmitEvent,
}

struct Cluster {
    version: String,
    next_resource_version: u64,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    classes: HashMap<String, StorageClass>,
    lock: Option<(LeaderElectionRecord, String)>,
    events: Vec<Event>,
}

struct Shared {
    cluster: Mutex<Cluster>,
    claim_events: broadcast::Sender<WatchEvent<PersistentVolumeClaim>>,
    volume_events: broadcast::Sender<WatchEvent<PersistentVolume>>,
    disconnects: broadcast::Sender<()>,
}

#[derive(Default)]
struct Faults {
    partitioned: bool,
    failures: HashMap<Op, VecDeque<ApiError>>,
    blocked: HashSet<Op>,
    panics: HashSet<Op>,
    hanging: HashMap<Op, usize>,
    calls: Vec<Op>,
}

// Counts a call that hangs until its future is dropped.
struct Hanging {
    faults: Arc<Mutex<Faults>>,
    op: Op,
}

impl Hanging {
    fn new(faults: Arc<Mutex<Faults>>, op: Op) -> Self {
        *faults.lock().unwrap().hanging.entry(op).or_default() += 1;
        Hanging { faults, op }
    }
}

impl Drop for Hanging {
    fn drop(&mut self) {
        if let Ok(mut faults) = self.faults.lock() {
            if let Some(count) = faults.hanging.get_mut(&self.op) {
                *count -= 1;
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct MemoryApi {
    shared: Arc<Shared>,
    faults: Arc<Mutex<Faults>>,
}

fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!("{}/{}", claim.namespace().unwrap_or_default(), claim.name())
}

impl MemoryApi {
    pub(crate) fn new() -> Self {
        let (claim_events, _) = broadcast::channel(256);
        let (volume_events, _) = broadcast::channel(256);
        let (disconnects, _) = broadcast::channel(16);
        MemoryApi {
            shared: Arc::new(Shared {
                cluster: Mutex::new(Cluster {
                    version: "v1.22.3".to_string(),
                    next_resource_version: 1,
                    claims: BTreeMap::new(),
                    volumes: BTreeMap::new(),
                    classes: HashMap::new(),
                    lock: None,
                    events: Vec::new(),
                }),
                claim_events,
                volume_events,
                disconnects,
            }),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Another replica's connection to the same cluster.
    pub(crate) fn replica(&self) -> Self {
        MemoryApi {
            shared: self.shared.clone(),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub(crate) fn set_version(&self, version: &str) {
        self.cluster().version = version.to_string();
    }

    pub(crate) fn add_class(&self, class: StorageClass) {
        self.cluster().classes.insert(class.name(), class);
    }

    /// Creates or updates a claim, as another client would.
    pub(crate) fn apply_claim(&self, mut claim: PersistentVolumeClaim) {
        let mut cluster = self.cluster();
        claim.metadata.resource_version = Some(cluster.bump());
        cluster.claims.insert(claim_key(&claim), claim.clone());
        let _ = self.shared.claim_events.send(WatchEvent::Applied(claim));
    }

    pub(crate) fn remove_claim(&self, namespace: &str, name: &str) {
        let mut cluster = self.cluster();
        if let Some(claim) = cluster.claims.remove(&format!("{}/{}", namespace, name)) {
            let _ = self.shared.claim_events.send(WatchEvent::Deleted(claim));
        }
    }

    /// Deletes a claim without telling any watch, as if it happened while
    /// nobody was watching.
    pub(crate) fn remove_claim_unseen(&self, namespace: &str, name: &str) {
        self.cluster()
            .claims
            .remove(&format!("{}/{}", namespace, name));
    }

    /// Ends every open watch stream, as a dropped connection would.
    pub(crate) fn disconnect_watches(&self) {
        let _ = self.shared.disconnects.send(());
    }

    /// Creates or updates a volume, as another client would.
    pub(crate) fn apply_volume(&self, mut volume: PersistentVolume) {
        let mut cluster = self.cluster();
        volume.metadata.resource_version = Some(cluster.bump());
        cluster.volumes.insert(volume.name(), volume.clone());
        let _ = self.shared.volume_events.send(WatchEvent::Applied(volume));
    }

    pub(crate) fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.cluster().volumes.get(name).cloned()
    }

    pub(crate) fn volumes(&self) -> Vec<PersistentVolume> {
        self.cluster().volumes.values().cloned().collect()
    }

    pub(crate) fn leader_record(&self) -> Option<LeaderElectionRecord> {
        self.cluster().lock.as_ref().map(|(record, _)| record.clone())
    }

    /// Events recorded by any replica, as `(reason, involved object name)`.
    pub(crate) fn events(&self) -> Vec<(String, String)> {
        self.cluster()
            .events
            .iter()
            .map(|e| {
                (
                    e.reason.clone().unwrap_or_default(),
                    e.involved_object.name.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    pub(crate) fn events_with_reason(&self, reason: &str) -> usize {
        self.events().iter().filter(|(r, _)| r == reason).count()
    }

    /// Makes the next call of `op` on this connection fail with `error`.
    pub(crate) fn fail_next(&self, op: Op, error: ApiError) {
        self.faults()
            .failures
            .entry(op)
            .or_insert_with(VecDeque::new)
            .push_back(error);
    }

    /// Makes calls of `op` on this connection hang until they are cancelled.
    pub(crate) fn block(&self, op: Op) {
        self.faults().blocked.insert(op);
    }

    pub(crate) fn unblock(&self, op: Op) {
        self.faults().blocked.remove(&op);
    }

    /// Makes the next call of `op` on this connection panic.
    pub(crate) fn panic_next(&self, op: Op) {
        self.faults().panics.insert(op);
    }

    /// How many blocked calls of `op` are still waiting.
    pub(crate) fn hanging(&self, op: Op) -> usize {
        self.faults().hanging.get(&op).copied().unwrap_or_default()
    }

    /// While partitioned, every call on this connection fails as transient.
    pub(crate) fn set_partitioned(&self, partitioned: bool) {
        self.faults().partitioned = partitioned;
    }

    /// How many times `op` was called on this connection, failed calls included.
    pub(crate) fn calls(&self, op: Op) -> usize {
        self.faults().calls.iter().filter(|c| **c == op).count()
    }

    fn cluster(&self) -> std::sync::MutexGuard<'_, Cluster> {
        self.shared.cluster.lock().unwrap()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap()
    }

    fn record(&self, op: Op) {
        self.faults().calls.push(op);
    }

    async fn enter(&self, op: Op) -> Result<(), ApiError> {
        let (blocked, panics) = {
            let mut faults = self.faults();
            faults.calls.push(op);
            if faults.partitioned {
                return Err(ApiError::Transient("connection refused".to_string()));
            }
            if let Some(error) = faults.failures.get_mut(&op).and_then(VecDeque::pop_front) {
                return Err(error);
            }
            (faults.blocked.contains(&op), faults.panics.remove(&op))
        };
        if panics {
            panic!("injected panic in {:?}", op);
        }
        if blocked {
            let _hanging = Hanging::new(self.faults.clone(), op);
            future::pending::<()>().await;
        }
        Ok(())
    }
}

impl Cluster {
    fn bump(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }
}

fn watch<K>(
    snapshot: Vec<K>,
    receiver: broadcast::Receiver<WatchEvent<K>>,
    mut disconnect: broadcast::Receiver<()>,
) -> WatchStream<K>
where
    K: Clone + Send + 'static,
{
    let updates = BroadcastStream::new(receiver)
        .filter_map(|event| future::ready(event.ok()))
        .map(Ok);
    let disconnected = async move {
        let _ = disconnect.recv().await;
    };
    stream::once(future::ready(Ok(WatchEvent::Restarted(snapshot))))
        .chain(updates)
        .take_until(disconnected)
        .boxed()
}

#[async_trait::async_trait]
impl ClusterApi for MemoryApi {
    async fn server_version(&self) -> Result<String, ApiError> {
        self.enter(Op::ServerVersion).await?;
        Ok(self.cluster().version.clone())
    }

    fn watch_claims(&self) -> WatchStream<PersistentVolumeClaim> {
        self.record(Op::WatchClaims);
        let cluster = self.cluster();
        let receiver = self.shared.claim_events.subscribe();
        let disconnect = self.shared.disconnects.subscribe();
        watch(cluster.claims.values().cloned().collect(), receiver, disconnect)
    }

    fn watch_volumes(&self) -> WatchStream<PersistentVolume> {
        self.record(Op::WatchVolumes);
        let cluster = self.cluster();
        let receiver = self.shared.volume_events.subscribe();
        let disconnect = self.shared.disconnects.subscribe();
        watch(cluster.volumes.values().cloned().collect(), receiver, disconnect)
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, ApiError> {
        self.enter(Op::GetStorageClass).await?;
        self.cluster()
            .classes
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("storageclass {}", name)))
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, ApiError> {
        self.enter(Op::GetVolume).await?;
        self.volume(name)
            .ok_or_else(|| ApiError::NotFound(format!("persistentvolume {}", name)))
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<(), ApiError> {
        self.enter(Op::CreateVolume).await?;
        let name = volume.name();
        if self.cluster().volumes.contains_key(&name) {
            return Err(ApiError::AlreadyExists(format!("persistentvolume {}", name)));
        }
        self.apply_volume(volume.clone());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), ApiError> {
        self.enter(Op::DeleteVolume).await?;
        let mut cluster = self.cluster();
        if let Some(volume) = cluster.volumes.remove(name) {
            let _ = self.shared.volume_events.send(WatchEvent::Deleted(volume));
        }
        Ok(())
    }

    async fn get_leader_record(&self) -> Result<LeaderLock, ApiError> {
        self.enter(Op::GetLeaderRecord).await?;
        Ok(match &self.cluster().lock {
            Some((record, version)) => LeaderLock {
                record: Some(record.clone()),
                resource_version: Some(version.clone()),
            },
            None => LeaderLock::default(),
        })
    }

    async fn update_leader_record(
        &self,
        record: &LeaderElectionRecord,
        resource_version: Option<&str>,
    ) -> Result<String, ApiError> {
        self.enter(Op::UpdateLeaderRecord).await?;
        let mut cluster = self.cluster();
        let current = cluster.lock.as_ref().map(|(_, version)| version.as_str());
        if current != resource_version {
            return Err(ApiError::Conflict("leader lock was modified".to_string()));
        }
        let version = cluster.bump();
        cluster.lock = Some((record.clone(), version.clone()));
        Ok(version)
    }

    async fn emit_event(&self, event: &Event) -> Result<(), ApiError> {
        self.enter(Op::EmitEvent).await?;
        self.cluster().events.push(event.clone());
        Ok(())
    }
}
