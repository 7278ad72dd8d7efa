use crate::DataDir;
use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use miette::Diagnostic;
use packsync_config::PackageConfig;
use packsync_fs::{write_file, WriteFileError};
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};

/// Phase a package's on-disk state is in.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[display("downloading")]
    Downloading,
    #[display("done")]
    Done,
    /// Unpacking a verified archive failed. Sticky: only a version change
    /// makes the engine try this `(package_id, version)` again.
    #[display("failed")]
    Failed,
}

/// Content of the `<tree>.status.json` sidecar.
///
/// A sidecar with `sync_status: done` and matching id + version is the sole
/// evidence that a package is synced. Unknown fields are tolerated so older
/// and newer robots can read each other's sidecars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSyncFile {
    pub package_id: String,
    pub version: String,
    pub modified_time: DateTime<Utc>,
    pub sync_status: SyncStatus,
    /// Base64 CRC32C of the downloaded archive; empty while downloading.
    #[serde(default)]
    pub tarball_checksum: String,
}

/// Error type of [`DataDir::write_status_file`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum WriteStatusFileError {
    WriteFile(#[error(source)] WriteFileError),
}

/// Error type of [`DataDir::read_status_file`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum ReadStatusFileError {
    #[display("Failed to read status file at {file_path:?}: {error}")]
    ReadFile {
        file_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to parse status file at {file_path:?}: {error}")]
    ParseFile {
        file_path: PathBuf,
        #[error(source)]
        error: serde_json::Error,
    },
}

impl DataDir {
    /// Record `status` for `pkg`, overwriting any previous sidecar.
    pub fn write_status_file(
        &self,
        pkg: &PackageConfig,
        sync_status: SyncStatus,
        tarball_checksum: &str,
    ) -> Result<(), WriteStatusFileError> {
        let status = PackageSyncFile {
            package_id: pkg.package_id.clone(),
            version: pkg.version.clone(),
            modified_time: Utc::now(),
            sync_status,
            tarball_checksum: tarball_checksum.to_string(),
        };
        let content = serde_json::to_string(&status).expect("convert a PackageSyncFile to JSON");
        write_file(&self.status_file_path(pkg), content.as_bytes(), Some(0o600))
            .map_err(WriteStatusFileError::WriteFile)
    }

    /// Read the status sidecar of `pkg`. A missing sidecar is `Ok(None)`;
    /// any other I/O or parse problem is an error.
    pub fn read_status_file(
        &self,
        pkg: &PackageConfig,
    ) -> Result<Option<PackageSyncFile>, ReadStatusFileError> {
        let file_path = self.status_file_path(pkg);
        let content = match std::fs::read(&file_path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(ReadStatusFileError::ReadFile { file_path, error }),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|error| ReadStatusFileError::ParseFile { file_path, error })
    }

    /// Whether `pkg` is present and healthy on disk.
    ///
    /// True only when the sidecar is readable, parses, and its id, version
    /// and `done` status all match the desired config. Every deviation forces
    /// a re-install.
    pub fn package_is_synced(&self, pkg: &PackageConfig) -> bool {
        match self.read_status_file(pkg) {
            Ok(Some(status)) => {
                status.sync_status == SyncStatus::Done
                    && status.package_id == pkg.package_id
                    && status.version == pkg.version
            }
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(
                    target: "packsync::status",
                    package_id = %pkg.package_id,
                    %error,
                    "Unreadable status file, treating package as unsynced",
                );
                false
            }
        }
    }
}
