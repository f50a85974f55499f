//! The backing store: one directory per provisioned volume under a fixed root.
//!
//! This is the only part of the provisioner that touches the filesystem.
//! Volumes live at `<root>/<namespace>/<claim-name>`. Nothing here retries;
//! the reconciler decides what to do with a failure.
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

const VOLUME_MODE: u32 = 0o777;

/// Errors returned by the [`HostPathDriver`].
#[derive(Error, Debug)]
pub enum DriverError {
    /// A filesystem call failed.
    #[error("{op} {path:?}: {source}")]
    Io {
        /// The operation that failed.
        op: &'static str,
        /// The path it was applied to.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The root directory must be absolute.
    #[error("root directory {0:?} is not an absolute path")]
    NotAbsolute(PathBuf),
    /// The path does not live strictly below the root directory.
    #[error("refusing to touch {0:?}: not below the provisioner root")]
    OutsideRoot(PathBuf),
    /// The path is, or resolves through, a symbolic link.
    #[error("refusing to delete {0:?}: path traverses a symbolic link")]
    Symlink(PathBuf),
    /// A namespace or claim name cannot be used as a single path component.
    #[error("{0:?} is not a valid directory name")]
    InvalidName(String),
}

impl DriverError {
    /// Returns true if the error was an `EACCES`/`EPERM` from the filesystem.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, DriverError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied)
    }

    fn io(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> DriverError {
        let path = path.to_owned();
        move |source| DriverError::Io { op, path, source }
    }
}

/// Creates and removes volume directories under an immutable root.
#[derive(Clone, Debug)]
pub struct HostPathDriver {
    root: PathBuf,
}

impl HostPathDriver {
    /// Returns a driver rooted at `root`, which must be absolute.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, DriverError> {
        let root = root.as_ref();
        if !root.is_absolute() {
            return Err(DriverError::NotAbsolute(root.to_owned()));
        }
        Ok(HostPathDriver {
            root: root.to_owned(),
        })
    }

    /// The root directory volumes are created under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root if needed and checks that it can be read.
    pub async fn ensure_root(&self) -> Result<(), DriverError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(DriverError::io("create", &self.root))?;
        tokio::fs::read_dir(&self.root)
            .await
            .map_err(DriverError::io("read", &self.root))?;
        Ok(())
    }

    /// The directory backing the claim `namespace/claim`.
    pub fn volume_path(&self, namespace: &str, claim: &str) -> Result<PathBuf, DriverError> {
        Ok(self
            .root
            .join(single_component(namespace)?)
            .join(single_component(claim)?))
    }

    /// Creates the directory for `namespace/claim` with mode 0777 and returns
    /// its absolute path.
    ///
    /// Safe to call repeatedly: an existing directory is left in place and
    /// only has its mode re-applied.
    pub async fn provision(
        &self,
        namespace: &str,
        claim: &str,
        pv_name: &str,
    ) -> Result<PathBuf, DriverError> {
        let path = self.volume_path(namespace, claim)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                debug!(volume = pv_name, path = %path.display(), "Volume directory already exists");
            }
            _ => {
                info!(volume = pv_name, path = %path.display(), "Creating volume directory");
                create_dir_all(&path).await?;
            }
        }
        // umask may have weakened the mode chosen at creation
        set_mode(&path).await?;
        Ok(path)
    }

    /// Recursively removes a volume directory.
    ///
    /// Refuses anything that is not strictly below the root, including paths
    /// that only get there through a symbolic link. A path that no longer
    /// exists is treated as already deleted.
    pub async fn delete(&self, path: &Path) -> Result<(), DriverError> {
        if !self.is_below_root(path) {
            return Err(DriverError::OutsideRoot(path.to_owned()));
        }
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Volume directory already gone");
                return Ok(());
            }
            Err(e) => return Err(DriverError::io("stat", path)(e)),
        };
        if meta.file_type().is_symlink() {
            return Err(DriverError::Symlink(path.to_owned()));
        }
        let canonical_root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(DriverError::io("resolve", &self.root))?;
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(DriverError::io("resolve", path))?;
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| DriverError::OutsideRoot(path.to_owned()))?;
        if canonical != canonical_root.join(relative) {
            return Err(DriverError::Symlink(path.to_owned()));
        }

        info!(path = %path.display(), "Deleting volume directory");
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::io("remove", path)(e)),
        }
    }

    fn is_below_root(&self, path: &Path) -> bool {
        path.is_absolute()
            && path != self.root
            && path.starts_with(&self.root)
            && !path.components().any(|c| c == Component::ParentDir)
    }
}

fn single_component(name: &str) -> Result<&str, DriverError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(name),
        _ => Err(DriverError::InvalidName(name.to_owned())),
    }
}

#[cfg(unix)]
async fn create_dir_all(path: &Path) -> Result<(), DriverError> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(VOLUME_MODE)
        .create(path)
        .await
        .map_err(DriverError::io("create", path))
}

#[cfg(not(unix))]
async fn create_dir_all(path: &Path) -> Result<(), DriverError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(DriverError::io("create", path))
}

#[cfg(unix)]
async fn set_mode(path: &Path) -> Result<(), DriverError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(VOLUME_MODE))
        .await
        .map_err(DriverError::io("chmod", path))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path) -> Result<(), DriverError> {
    Ok(())
}
