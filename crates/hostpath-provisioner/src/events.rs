//! Best-effort event recording.
//!
//! Events are handed to a background task over a bounded channel. A full
//! channel drops the event with a warning instead of blocking the worker that
//! produced it.
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Event, EventSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ClusterApi;

/// Cluster-scoped volumes have their events recorded here.
const VOLUME_EVENT_NAMESPACE: &str = "default";

/// Why an event was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// A volume was created for a claim.
    ProvisioningSucceeded,
    /// A volume could not be created for a claim.
    ProvisioningFailed,
    /// Work on a claim has started.
    Provisioning,
    /// A released volume and its directory were removed.
    VolumeDelete,
    /// A released volume could not be removed.
    VolumeFailedDelete,
    /// A released volume belongs to another replica and was left alone.
    IgnoredVolume,
}

impl Reason {
    /// The `reason` field of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ProvisioningSucceeded => "ProvisioningSucceeded",
            Reason::ProvisioningFailed => "ProvisioningFailed",
            Reason::Provisioning => "Provisioning",
            Reason::VolumeDelete => "VolumeDelete",
            Reason::VolumeFailedDelete => "VolumeFailedDelete",
            Reason::IgnoredVolume => "IgnoredVolume",
        }
    }

    /// `Normal` or `Warning`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Reason::ProvisioningSucceeded | Reason::Provisioning | Reason::VolumeDelete => {
                "Normal"
            }
            Reason::ProvisioningFailed | Reason::VolumeFailedDelete | Reason::IgnoredVolume => {
                "Warning"
            }
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records events on claims and volumes. Cheap to clone.
#[derive(Clone)]
pub struct EventRecorder {
    sender: mpsc::Sender<Event>,
    component: Arc<str>,
}

impl EventRecorder {
    /// Starts the task that delivers events through `api`. The task ends once
    /// every clone of the recorder is dropped.
    pub fn start(
        api: Arc<dyn ClusterApi>,
        component: impl Into<String>,
        buffer: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Event>(buffer.max(1));
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = api.emit_event(&event).await {
                    warn!(
                        error = %e,
                        reason = event.reason.as_deref().unwrap_or_default(),
                        "Unable to record event"
                    );
                }
            }
        });
        let recorder = EventRecorder {
            sender,
            component: Arc::from(component.into()),
        };
        (recorder, task)
    }

    /// Records an event on a claim.
    pub fn claim(&self, claim: &PersistentVolumeClaim, reason: Reason, message: impl Into<String>) {
        let namespace = claim.namespace().unwrap_or_default();
        let reference = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("PersistentVolumeClaim".to_string()),
            namespace: Some(namespace.clone()),
            name: Some(claim.name()),
            uid: claim.metadata.uid.clone(),
            resource_version: claim.metadata.resource_version.clone(),
            ..Default::default()
        };
        self.record(namespace, reference, reason, message.into());
    }

    /// Records an event on a volume.
    pub fn volume(&self, volume: &PersistentVolume, reason: Reason, message: impl Into<String>) {
        let reference = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("PersistentVolume".to_string()),
            name: Some(volume.name()),
            uid: volume.metadata.uid.clone(),
            resource_version: volume.metadata.resource_version.clone(),
            ..Default::default()
        };
        self.record(
            VOLUME_EVENT_NAMESPACE.to_string(),
            reference,
            reason,
            message.into(),
        );
    }

    fn record(&self, namespace: String, object: ObjectReference, reason: Reason, message: String) {
        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!(
                    "{}.{:x}",
                    object.name.as_deref().unwrap_or_default(),
                    now.timestamp_nanos()
                )),
                namespace: Some(namespace),
                ..Default::default()
            },
            involved_object: object,
            reason: Some(reason.as_str().to_string()),
            message: Some(message),
            type_: Some(reason.event_type().to_string()),
            source: Some(EventSource {
                component: Some(self.component.to_string()),
                host: None,
            }),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            count: Some(1),
            ..Default::default()
        };
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => warn!(
                reason = %reason,
                object = event.involved_object.name.as_deref().unwrap_or_default(),
                "Event buffer full, dropping event"
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(reason = %reason, "Event recorder stopped, dropping event")
            }
        }
    }
}
