//! The control loop that runs while this replica leads.
//!
//! Two watch tasks keep a local cache of claims and volumes and decide which
//! keys need work. Each kind has its own [`WorkQueue`] drained by a pool of
//! workers. A worker always acts on the latest cached state for its key,
//! never on the event that queued it, so a burst of updates to one claim
//! collapses into a single intent.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube_runtime::watcher::Event as WatchEvent;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ClusterApi, WatchStream};
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::driver::HostPathDriver;
use crate::events::EventRecorder;
use crate::identity::{Identity, IDENTITY_ANNOTATION};
use crate::queue::WorkQueue;
use crate::signal::{stop_channel, StopSignal, StopTrigger};
use crate::store::{ObjectKey, Store};
use crate::version::KubeVersion;

/// Retries an API call in place.
///
/// `error` is called with each failure and the attempt number, and returns
/// true to give up early. Attempts are spaced by the default backoff.
macro_rules! retry {
    ($action:expr, times: $num_times:expr, error: $on_err:expr) => {{
        let mut n = 0u32;
        let mut backoff = $crate::backoff::ExponentialBackoffStrategy::default();
        loop {
            n += 1;
            let result = $action;
            match result {
                Ok(_) => break result,
                Err(ref e) => {
                    if $on_err(e, n) || n >= $num_times {
                        break result;
                    }
                    $crate::backoff::BackoffStrategy::wait(&mut backoff).await;
                }
            }
        }
    }};
}

mod delete;
mod provision;

/// Claims naming a provisioner here are ours regardless of their class.
pub const PROVISIONER_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-provisioner";
/// Legacy way for claims and volumes to name their storage class.
pub const CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";
/// Names the provisioner that created a volume.
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

const PANIC_REQUEUE_DELAY: Duration = Duration::from_secs(5);
const WATCH_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How the reconciler behaves, fixed for a leadership term.
#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    /// Matched against claims and storage classes.
    pub provisioner_name: String,
    /// Stamped into, and required on, every volume this replica touches.
    pub identity: Identity,
    /// Decides how the storage class is recorded on new volumes.
    pub server_version: KubeVersion,
    /// Workers per queue.
    pub worker_count: usize,
    /// Attempts at creating a volume object before the intent is re-queued.
    pub max_retries: u32,
    /// How long a single intent may run before it is abandoned and re-queued.
    pub intent_deadline: Duration,
}

/// What a worker does with its key once an intent finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Finished, successfully or terminally. Backoff history is cleared.
    Done,
    /// Try again after the key's next backoff delay.
    Requeue,
    /// Try again after a fixed delay.
    RequeueAfter(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Claim,
    Volume,
}

pub(crate) struct Shared {
    pub(crate) api: Arc<dyn ClusterApi>,
    pub(crate) driver: HostPathDriver,
    pub(crate) events: EventRecorder,
    pub(crate) settings: ReconcilerSettings,
    pub(crate) claims: Store<PersistentVolumeClaim>,
    pub(crate) volumes: Store<PersistentVolume>,
    claim_queue: Arc<WorkQueue<ObjectKey>>,
    volume_queue: Arc<WorkQueue<ObjectKey>>,
    claims_synced: AtomicBool,
    volumes_synced: AtomicBool,
    synced: Notify,
    stop: StopSignal,
}

/// A running reconciler. Dropping it without calling [`stop`](Self::stop)
/// leaves its tasks running until their stop signal's trigger is dropped.
pub struct Reconciler {
    shared: Arc<Shared>,
    trigger: StopTrigger,
    tasks: Vec<JoinHandle<()>>,
}

impl Reconciler {
    /// Starts the watch tasks and workers.
    pub fn start(
        api: Arc<dyn ClusterApi>,
        driver: HostPathDriver,
        events: EventRecorder,
        settings: ReconcilerSettings,
    ) -> Self {
        let (trigger, stop) = stop_channel();
        let worker_count = settings.worker_count.max(1);
        let shared = Arc::new(Shared::new(api, driver, events, settings, stop));

        let mut tasks = Vec::with_capacity(2 + 2 * worker_count);
        tasks.push(tokio::spawn(watch_claims(shared.clone())));
        tasks.push(tokio::spawn(watch_volumes(shared.clone())));
        for id in 0..worker_count {
            tasks.push(tokio::spawn(run_worker(shared.clone(), Kind::Claim, id)));
            tasks.push(tokio::spawn(run_worker(shared.clone(), Kind::Volume, id)));
        }
        info!(workers = worker_count, "Reconciler started");
        Reconciler {
            shared,
            trigger,
            tasks,
        }
    }

    /// Cancels every task, abandoning in-flight intents, and waits for them
    /// to finish.
    pub async fn stop(self) {
        self.trigger.stop();
        self.shared.claim_queue.shutdown();
        self.shared.volume_queue.shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "Reconciler task panicked");
                }
            }
        }
        info!("Reconciler stopped");
    }
}

impl Shared {
    pub(crate) fn new(
        api: Arc<dyn ClusterApi>,
        driver: HostPathDriver,
        events: EventRecorder,
        settings: ReconcilerSettings,
        stop: StopSignal,
    ) -> Self {
        Shared {
            api,
            driver,
            events,
            settings,
            claims: Store::new(),
            volumes: Store::new(),
            claim_queue: Arc::new(WorkQueue::new()),
            volume_queue: Arc::new(WorkQueue::new()),
            claims_synced: AtomicBool::new(false),
            volumes_synced: AtomicBool::new(false),
            synced: Notify::new(),
            stop,
        }
    }

    fn queue(&self, kind: Kind) -> &Arc<WorkQueue<ObjectKey>> {
        match kind {
            Kind::Claim => &self.claim_queue,
            Kind::Volume => &self.volume_queue,
        }
    }

    /// Returns true if `claim` is unbound and asks for this provisioner.
    ///
    /// A claim without the provisioner annotation is considered if it names
    /// a class; the worker then checks the class's provisioner.
    pub(crate) fn should_provision(&self, claim: &PersistentVolumeClaim) -> bool {
        let bound = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_deref())
            .map_or(false, |name| !name.is_empty());
        if bound {
            return false;
        }
        match annotation(&claim.metadata, PROVISIONER_ANNOTATION) {
            Some(provisioner) => provisioner == self.settings.provisioner_name,
            None => claim_class(claim).is_some(),
        }
    }

    /// Returns true if `volume` is released, should be deleted on release,
    /// and was made by a provisioner of our name. Whether it was made by this
    /// replica is checked by the worker.
    pub(crate) fn should_delete(&self, volume: &PersistentVolume) -> bool {
        let released = volume
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some("Released");
        let reclaim_delete = volume
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            == Some("Delete");
        if !released || !reclaim_delete {
            return false;
        }
        match annotation(&volume.metadata, PROVISIONED_BY_ANNOTATION) {
            Some(provisioner) => provisioner == self.settings.provisioner_name,
            None => annotation(&volume.metadata, IDENTITY_ANNOTATION).is_some(),
        }
    }

    async fn apply_claim_event(&self, event: WatchEvent<PersistentVolumeClaim>) {
        match event {
            WatchEvent::Applied(claim) => {
                let wanted = self.should_provision(&claim);
                let key = self.claims.insert(claim).await;
                if wanted {
                    debug!(claim = %key, "Queueing claim for provisioning");
                    self.claim_queue.add(key);
                }
            }
            WatchEvent::Deleted(claim) => {
                let key = ObjectKey::from(&claim);
                self.claims.delete(&key).await;
                self.claim_queue.remove(&key);
            }
            WatchEvent::Restarted(claims) => {
                let wanted: Vec<ObjectKey> = claims
                    .iter()
                    .filter(|c| self.should_provision(c))
                    .map(ObjectKey::from)
                    .collect();
                for key in self.claims.replace_all(claims).await {
                    self.claim_queue.remove(&key);
                }
                for key in wanted {
                    self.claim_queue.add(key);
                }
                self.claims_synced.store(true, Ordering::SeqCst);
                self.synced.notify_waiters();
            }
        }
    }

    async fn apply_volume_event(&self, event: WatchEvent<PersistentVolume>) {
        match event {
            WatchEvent::Applied(volume) => {
                let wanted = self.should_delete(&volume);
                let key = self.volumes.insert(volume).await;
                if wanted {
                    debug!(volume = %key, "Queueing volume for deletion");
                    self.volume_queue.add(key);
                }
            }
            WatchEvent::Deleted(volume) => {
                let key = ObjectKey::from(&volume);
                self.volumes.delete(&key).await;
                self.volume_queue.remove(&key);
            }
            WatchEvent::Restarted(volumes) => {
                let wanted: Vec<ObjectKey> = volumes
                    .iter()
                    .filter(|v| self.should_delete(v))
                    .map(ObjectKey::from)
                    .collect();
                for key in self.volumes.replace_all(volumes).await {
                    self.volume_queue.remove(&key);
                }
                for key in wanted {
                    self.volume_queue.add(key);
                }
                self.volumes_synced.store(true, Ordering::SeqCst);
                self.synced.notify_waiters();
            }
        }
    }

    /// Waits until both caches have been filled by an initial listing, so
    /// that a claim is never provisioned before its volume could be seen.
    async fn wait_for_sync(&self) {
        loop {
            let notified = self.synced.notified();
            if self.claims_synced.load(Ordering::SeqCst) && self.volumes_synced.load(Ordering::SeqCst)
            {
                return;
            }
            notified.await;
        }
    }

    async fn process(self: &Arc<Self>, kind: Kind, key: ObjectKey) -> Option<Outcome> {
        let shared = self.clone();
        let intent_key = key.clone();
        let mut intent = tokio::spawn(async move {
            match kind {
                Kind::Claim => provision::reconcile(&shared, &intent_key).await,
                Kind::Volume => delete::reconcile(&shared, &intent_key).await,
            }
        });
        tokio::select! {
            result = tokio::time::timeout(self.settings.intent_deadline, &mut intent) => match result {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(e)) if e.is_panic() => {
                    error!(key = %key, error = %e, "Intent panicked");
                    Some(Outcome::RequeueAfter(PANIC_REQUEUE_DELAY))
                }
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "Intent was cancelled");
                    Some(Outcome::Requeue)
                }
                Err(_) => {
                    intent.abort();
                    warn!(
                        key = %key,
                        deadline = ?self.settings.intent_deadline,
                        "Intent did not finish before its deadline"
                    );
                    Some(Outcome::Requeue)
                }
            },
            _ = self.stop.stopped() => {
                intent.abort();
                None
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>, kind: Kind, id: usize) {
    tokio::select! {
        _ = shared.wait_for_sync() => {}
        _ = shared.stop.stopped() => return,
    }
    let queue = shared.queue(kind).clone();
    debug!(?kind, worker = id, "Worker started");
    loop {
        let key = tokio::select! {
            key = queue.get() => key,
            _ = shared.stop.stopped() => None,
        };
        let key = match key {
            Some(key) => key,
            None => break,
        };
        match shared.process(kind, key.clone()).await {
            Some(Outcome::Done) => {
                queue.forget(&key);
                queue.done(&key);
            }
            Some(Outcome::Requeue) => {
                queue.done(&key);
                let delay = queue.add_rate_limited(key.clone());
                debug!(key = %key, ?delay, "Requeued with backoff");
            }
            Some(Outcome::RequeueAfter(delay)) => {
                queue.done(&key);
                queue.add_after(key, delay);
            }
            None => break,
        }
    }
    debug!(?kind, worker = id, "Worker stopped");
}

async fn watch_claims(shared: Arc<Shared>) {
    let api = shared.api.clone();
    watch("claims", || api.watch_claims(), &shared, |event| {
        shared.apply_claim_event(event)
    })
    .await
}

async fn watch_volumes(shared: Arc<Shared>) {
    let api = shared.api.clone();
    watch("volumes", || api.watch_volumes(), &shared, |event| {
        shared.apply_volume_event(event)
    })
    .await
}

/// Feeds a watch into `apply` until stopped. When the stream fails or ends,
/// it is dropped and a new one connected after a capped backoff. A new stream
/// starts with a full listing, so whatever changed while disconnected is
/// replayed.
async fn watch<K, C, A, F>(kind: &str, connect: C, shared: &Shared, apply: A)
where
    C: Fn() -> WatchStream<K>,
    A: Fn(WatchEvent<K>) -> F,
    F: std::future::Future<Output = ()>,
{
    let mut backoff =
        ExponentialBackoffStrategy::new(Duration::from_millis(100), WATCH_BACKOFF_CAP);
    let mut stream = connect();
    loop {
        let next = tokio::select! {
            next = stream.try_next() => next,
            _ = shared.stop.stopped() => break,
        };
        match next {
            Ok(Some(event)) => {
                backoff.reset();
                apply(event).await;
                continue;
            }
            Ok(None) => debug!(kind, "Watch closed, re-listing"),
            Err(e) => warn!(kind, error = %e, "Error streaming object events, re-listing"),
        }
        tokio::select! {
            _ = backoff.wait() => {}
            _ = shared.stop.stopped() => break,
        }
        stream = connect();
    }
}

fn annotation<'a>(
    metadata: &'a k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    key: &str,
) -> Option<&'a str> {
    metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// The storage class a claim asks for. The legacy annotation wins over the
/// spec field, and an empty name means no class.
pub(crate) fn claim_class(claim: &PersistentVolumeClaim) -> Option<String> {
    annotation(&claim.metadata, CLASS_ANNOTATION)
        .or_else(|| {
            claim
                .spec
                .as_ref()
                .and_then(|s| s.storage_class_name.as_deref())
        })
        .filter(|class| !class.is_empty())
        .map(str::to_string)
}
