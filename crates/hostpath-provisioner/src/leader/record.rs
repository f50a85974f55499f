use chrono::{SubsecRound, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

/// Annotation on the lock object that holds the JSON-encoded record.
pub const LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

/// The leader election record stored in the lock object's annotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionRecord {
    /// Identity of the current holder. Empty when the lease was released.
    #[serde(default)]
    pub holder_identity: String,
    /// How long the holder's claim is valid after `renew_time`.
    #[serde(default)]
    pub lease_duration_seconds: i64,
    /// When the current holder first acquired the lease.
    pub acquire_time: Option<Time>,
    /// When the current holder last renewed the lease.
    pub renew_time: Option<Time>,
    /// How many times the lease has changed hands.
    #[serde(default)]
    pub leader_transitions: i64,
}

impl LeaderElectionRecord {
    /// Returns true if nobody holds the lease.
    pub fn is_vacant(&self) -> bool {
        self.holder_identity.is_empty()
    }

    /// Decodes the record from an annotation value. An empty value is a
    /// vacant lease.
    pub fn from_annotation(value: &str) -> serde_json::Result<Option<Self>> {
        if value.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(value).map(Some)
    }

    /// Encodes the record for storage in the lock annotation.
    pub fn to_annotation(&self) -> String {
        // A struct of strings, integers and timestamps always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The current wall clock time truncated to whole seconds, which is the
/// precision the API server keeps for timestamps.
pub fn now() -> Time {
    Time(Utc::now().trunc_subsecs(0))
}
