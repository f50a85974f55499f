use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{claim_class, Outcome, Shared, CLASS_ANNOTATION, PROVISIONED_BY_ANNOTATION};
use crate::api::ApiError;
use crate::driver::DriverError;
use crate::events::Reason;
use crate::identity::IDENTITY_ANNOTATION;
use crate::store::ObjectKey;

/// The volume name is derived from the claim's UID so that replays of the
/// same intent always target the same object.
pub(crate) fn volume_name(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .metadata
        .uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .map(|uid| format!("pvc-{}", uid))
}

/// Provisions a volume for the claim at `key`.
#[tracing::instrument(level = "info", skip(shared, key), fields(claim = %key))]
pub(crate) async fn reconcile(shared: &Shared, key: &ObjectKey) -> Outcome {
    let claim = match shared.claims.get(key).await {
        Some(claim) => claim,
        None => {
            debug!("Claim no longer exists");
            return Outcome::Done;
        }
    };
    if !shared.should_provision(&claim) {
        debug!("Claim no longer needs provisioning");
        return Outcome::Done;
    }
    let pv_name = match volume_name(&claim) {
        Some(name) => name,
        None => {
            warn!("Claim has no UID, skipping");
            return Outcome::Done;
        }
    };
    if shared.volumes.get(&ObjectKey::cluster(&pv_name)).await.is_some() {
        debug!(volume = %pv_name, "Volume already exists");
        return Outcome::Done;
    }

    let class_name = match claim_class(&claim) {
        Some(class) => class,
        None => {
            shared.events.claim(
                &claim,
                Reason::ProvisioningFailed,
                "Claim does not name a storage class",
            );
            return Outcome::Done;
        }
    };
    let class = match shared.api.get_storage_class(&class_name).await {
        Ok(class) => class,
        Err(ApiError::NotFound(_)) => {
            shared.events.claim(
                &claim,
                Reason::ProvisioningFailed,
                format!("StorageClass {:?} not found", class_name),
            );
            return Outcome::Done;
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, class = %class_name, "Unable to read storage class");
            return Outcome::Requeue;
        }
        Err(e) => {
            shared.events.claim(
                &claim,
                Reason::ProvisioningFailed,
                format!("Unable to read StorageClass {:?}: {}", class_name, e),
            );
            return Outcome::Done;
        }
    };
    if class.provisioner != shared.settings.provisioner_name {
        debug!(
            class = %class_name,
            provisioner = %class.provisioner,
            "Storage class belongs to another provisioner"
        );
        return Outcome::Done;
    }
    let capacity = match requested_storage(&claim) {
        Some(capacity) => capacity,
        None => {
            shared.events.claim(
                &claim,
                Reason::ProvisioningFailed,
                "Claim does not request any storage",
            );
            return Outcome::Done;
        }
    };
    let reclaim_policy = class
        .reclaim_policy
        .clone()
        .unwrap_or_else(|| "Delete".to_string());

    shared.events.claim(
        &claim,
        Reason::Provisioning,
        format!(
            "External provisioner is provisioning volume for claim \"{}\"",
            key
        ),
    );
    let namespace = claim.namespace().unwrap_or_default();
    let path = match shared
        .driver
        .provision(&namespace, &claim.name(), &pv_name)
        .await
    {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, permission_denied = e.is_permission_denied(), "Unable to create volume directory");
            shared.events.claim(
                &claim,
                Reason::ProvisioningFailed,
                format!(
                    "Failed to provision volume with StorageClass \"{}\": {}",
                    class_name, e
                ),
            );
            // A bad name will not get better by waiting
            return match e {
                DriverError::Io { .. } => Outcome::Requeue,
                _ => Outcome::Done,
            };
        }
    };

    let volume = build_volume(
        shared,
        &claim,
        &pv_name,
        &class_name,
        reclaim_policy,
        capacity,
        &path,
    );
    let max_retries = shared.settings.max_retries;
    let created = retry!(
        shared.api.create_volume(&volume).await,
        times: max_retries,
        error: |e: &ApiError, n| {
            if e.is_retryable() {
                warn!(error = %e, attempt = n, volume = %pv_name, "Unable to save volume, retrying");
                false
            } else {
                true
            }
        }
    );
    match created {
        Ok(()) => {
            info!(volume = %pv_name, path = %path.display(), "Provisioned volume");
            shared.events.claim(
                &claim,
                Reason::ProvisioningSucceeded,
                format!("Successfully provisioned volume {}", pv_name),
            );
            Outcome::Done
        }
        Err(ApiError::AlreadyExists(_)) => {
            debug!(volume = %pv_name, "Volume was already saved");
            Outcome::Done
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, volume = %pv_name, "Unable to save volume, requeueing");
            Outcome::Requeue
        }
        Err(e) => {
            shared.events.claim(
                &claim,
                Reason::ProvisioningFailed,
                format!(
                    "Error creating provisioned PV object for claim {}: {}. Deleting the volume.",
                    key, e
                ),
            );
            // Without a volume object nothing would ever remove the directory
            if let Err(e) = shared.driver.delete(&path).await {
                warn!(error = %e, path = %path.display(), "Unable to clean up volume directory");
            }
            Outcome::Done
        }
    }
}

fn requested_storage(claim: &PersistentVolumeClaim) -> Option<Quantity> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .cloned()
}

/// Builds the volume object for `claim`, stamped with this replica's identity.
pub(crate) fn build_volume(
    shared: &Shared,
    claim: &PersistentVolumeClaim,
    pv_name: &str,
    class_name: &str,
    reclaim_policy: String,
    capacity: Quantity,
    path: &Path,
) -> PersistentVolume {
    let settings = &shared.settings;
    let mut annotations = BTreeMap::new();
    annotations.insert(
        IDENTITY_ANNOTATION.to_string(),
        settings.identity.to_string(),
    );
    annotations.insert(
        PROVISIONED_BY_ANNOTATION.to_string(),
        settings.provisioner_name.clone(),
    );
    let storage_class_name = if settings.server_version.at_least(1, 6) {
        Some(class_name.to_string())
    } else {
        annotations.insert(CLASS_ANNOTATION.to_string(), class_name.to_string());
        None
    };

    let mut capacities = BTreeMap::new();
    capacities.insert("storage".to_string(), capacity);

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(pv_name.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: claim.spec.as_ref().and_then(|s| s.access_modes.clone()),
            capacity: Some(capacities),
            claim_ref: Some(ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: claim.namespace(),
                name: Some(claim.name()),
                uid: claim.metadata.uid.clone(),
                resource_version: claim.metadata.resource_version.clone(),
                ..Default::default()
            }),
            host_path: Some(HostPathVolumeSource {
                path: path.to_string_lossy().into_owned(),
                type_: None,
            }),
            persistent_volume_reclaim_policy: Some(reclaim_policy),
            storage_class_name,
            ..Default::default()
        }),
        ..Default::default()
    }
}
