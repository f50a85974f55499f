use std::path::Path;

use tracing::{debug, info, warn};

use super::{annotation, Outcome, Shared};
use crate::api::ApiError;
use crate::events::Reason;
use crate::identity::IDENTITY_ANNOTATION;
use crate::store::ObjectKey;

/// Deletes the released volume at `key` and its directory, provided this
/// replica created it.
#[tracing::instrument(level = "info", skip(shared, key), fields(volume = %key))]
pub(crate) async fn reconcile(shared: &Shared, key: &ObjectKey) -> Outcome {
    if shared.volumes.get(key).await.is_none() {
        debug!("Volume no longer exists");
        return Outcome::Done;
    }
    // The cache may lag; only the API server's copy is trusted for deletion
    let volume = match shared.api.get_volume(key.name()).await {
        Ok(volume) => volume,
        Err(ApiError::NotFound(_)) => {
            debug!("Volume already deleted");
            return Outcome::Done;
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "Unable to read volume");
            return Outcome::Requeue;
        }
        Err(e) => {
            warn!(error = %e, "Unable to read volume, giving up");
            return Outcome::Done;
        }
    };
    if !shared.should_delete(&volume) {
        debug!("Volume no longer needs deletion");
        return Outcome::Done;
    }

    let identity = &shared.settings.identity;
    let stamped = annotation(&volume.metadata, IDENTITY_ANNOTATION);
    if !identity.matches(stamped) {
        info!(
            stamped = stamped.unwrap_or_default(),
            "Volume was provisioned by another replica, not deleting"
        );
        shared.events.volume(
            &volume,
            Reason::IgnoredVolume,
            format!(
                "identity annotation on PV does not match ours: {:?} != {:?}",
                stamped.unwrap_or_default(),
                identity.get()
            ),
        );
        return Outcome::Done;
    }

    let path = match volume
        .spec
        .as_ref()
        .and_then(|s| s.host_path.as_ref())
        .map(|h| h.path.clone())
    {
        Some(path) => path,
        None => {
            shared.events.volume(
                &volume,
                Reason::VolumeFailedDelete,
                "Volume has no hostPath source",
            );
            return Outcome::Done;
        }
    };
    if let Err(e) = shared.driver.delete(Path::new(&path)).await {
        warn!(error = %e, %path, "Unable to remove volume directory");
        shared
            .events
            .volume(&volume, Reason::VolumeFailedDelete, e.to_string());
        return Outcome::Requeue;
    }

    match shared.api.delete_volume(key.name()).await {
        Ok(()) => {
            info!(%path, "Deleted volume");
            shared.events.volume(
                &volume,
                Reason::VolumeDelete,
                format!("Deleted volume {} at {}", key, path),
            );
            Outcome::Done
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "Unable to delete volume object, requeueing");
            Outcome::Requeue
        }
        Err(e) => {
            shared
                .events
                .volume(&volume, Reason::VolumeFailedDelete, e.to_string());
            Outcome::Done
        }
    }
}
