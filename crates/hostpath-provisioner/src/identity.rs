//! The per-replica identity stamped into every volume this process creates.
use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use uuid::{Builder, Uuid, Variant, Version};

/// Annotation key under which the identity is stored on provisioned volumes.
pub const IDENTITY_ANNOTATION: &str = "hostPathProvisionerIdentity";

/// The operating system's randomness source could not produce an identity.
#[derive(Error, Debug)]
#[error("unable to read random bytes for provisioner identity: {0}")]
pub struct IdentityError(#[from] rand::Error);

/// A version 4 UUID generated once at startup.
///
/// Two replicas with different identities may run side by side; each one only
/// ever deletes the volumes carrying its own identity. The value is cheap to
/// clone and is passed around by value rather than shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Generates a fresh identity from the operating system's randomness source.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut bytes = [0u8; 16];
        OsRng.try_fill_bytes(&mut bytes)?;
        let uuid = Builder::from_bytes(bytes)
            .set_variant(Variant::RFC4122)
            .set_version(Version::Random)
            .build();
        Ok(Identity(uuid.to_string()))
    }

    /// Returns the identity as a string slice.
    pub fn get(&self) -> &str {
        &self.0
    }

    /// Returns true if the given annotation value names this identity.
    pub fn matches(&self, value: Option<&str>) -> bool {
        value == Some(self.0.as_str())
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity(value.to_owned())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
