use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The API server's `gitVersion` could not be understood.
#[derive(Error, Debug, PartialEq)]
#[error("unable to parse server version {0:?}")]
pub struct VersionError(String);

/// The release of the API server, ignoring any pre-release or build suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubeVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl KubeVersion {
    /// Creates a version from its parts.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        KubeVersion {
            major,
            minor,
            patch,
        }
    }

    /// Returns true if this version is `major.minor.0` or later.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= KubeVersion::new(major, minor, 0)
    }
}

impl FromStr for KubeVersion {
    type Err = VersionError;

    /// Accepts `v1.22.3`, `1.22.3`, `v1.22.3+k3s1`, `v1.22.3-gke.100` and
    /// the like. A missing patch component reads as zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionError(s.to_string());
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = trimmed
            .split(|c| c == '-' || c == '+')
            .next()
            .ok_or_else(err)?;
        let mut parts = core.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let patch = match parts.next() {
            Some(p) => p.parse().map_err(|_| err())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(KubeVersion::new(major, minor, patch))
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}
