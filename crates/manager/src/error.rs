use crate::InstallError;
use derive_more::{Display, Error};
use miette::Diagnostic;
use packsync_catalog::CatalogError;
use packsync_config::SyntheticPackageError;
use packsync_data_dir::CleanupError;
use std::fmt;

/// Error type of [`PackageManager::package_path`](crate::PackageManager::package_path).
#[derive(Debug, Display, Error, Diagnostic)]
pub enum PackagePathError {
    /// Sentinel: the name is not in the backend's managed set.
    #[display("Package {name:?} is not managed by this backend")]
    PackageMissing { name: String },
}

/// One per-package (or per-phase) failure inside a sync or cleanup batch.
#[derive(Debug, Display, Error, Diagnostic)]
pub enum PackageFailure {
    #[display("Failed to resolve {package_id}@{version} against the catalog: {error}")]
    Resolve {
        package_id: String,
        version: String,
        #[error(source)]
        error: CatalogError,
    },
    #[display("Failed to install {package_id}@{version}: {error}")]
    Install {
        package_id: String,
        version: String,
        #[error(source)]
        error: InstallError,
    },
    #[display("Failed to derive a package from module {name:?}: {error}")]
    Synthetic {
        name: String,
        #[error(source)]
        error: SyntheticPackageError,
    },
    #[display("Failed to create package symlink {name:?}: {error}")]
    Symlink {
        name: String,
        #[error(source)]
        error: packsync_fs::LinkFileError,
    },
    Cleanup(#[error(source)] CleanupError),
    #[display("Failed to construct the cloud backend: {error}")]
    Connect {
        #[error(source)]
        error: reqwest::Error,
    },
    #[display("Cannot sync because no connection to the package catalog is available")]
    NoConnection,
    #[display("Sync was cancelled")]
    Cancelled,
}

/// Aggregate error of a sync or cleanup pass.
///
/// Carries every failure of the batch so one broken package does not mask
/// its peers; packages that installed cleanly stay managed regardless.
#[derive(Debug, Error, Diagnostic)]
pub struct SyncError {
    #[related]
    pub failures: Vec<PackageFailure>,
}

impl SyncError {
    /// `Ok` when `failures` is empty, the aggregate error otherwise.
    pub fn from_failures(failures: Vec<PackageFailure>) -> Result<(), SyncError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError { failures })
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Sync finished with {} failure(s): ", self.failures.len())?;
        for (index, failure) in self.failures.iter().enumerate() {
            if index > 0 {
                write!(formatter, "; ")?;
            }
            write!(formatter, "{failure}")?;
        }
        Ok(())
    }
}
