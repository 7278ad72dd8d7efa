use derive_more::{Display, Error};
use miette::Diagnostic;
use packsync_config::{PackageConfig, PackageType};
use packsync_data_dir::{DataDir, SyncStatus, WriteStatusFileError};
use packsync_network::{CopyLocalError, DownloadError, Downloaded, GZIP_CONTENT_TYPE};
use packsync_tarball::{TarballError, UnpackArchive};
use std::{
    fs,
    future::Future,
    io,
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;

/// Error type of the transport callback handed to [`InstallPackage`]: either
/// the authenticated HTTP transport or the local-tarball copy.
#[derive(Debug, Display, Error, Diagnostic)]
pub enum FetchError {
    Http(#[error(source)] DownloadError),
    LocalCopy(#[error(source)] CopyLocalError),
}

/// Error type of [`InstallPackage`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum InstallError {
    #[display("Failed to prepare package directory at {path:?}: {error}")]
    PrepareDir {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    WriteStatus(#[error(source)] WriteStatusFileError),
    Fetch(#[error(source)] FetchError),
    #[display("Package archive has content type {content_type:?}, expected {GZIP_CONTENT_TYPE:?}")]
    WrongContentType { content_type: String },
    Unpack(#[error(source)] TarballError),
    #[display("Failed to move unpacked tree into place at {to:?}: {error}")]
    Rename {
        to: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display(
        "Unpacking {package_id}@{version} failed previously; a version change is required to retry"
    )]
    PreviouslyFailed { package_id: String, version: String },
    #[display("Install was cancelled")]
    Cancelled,
}

/// Install one package: download, verify, unpack into a scratch sibling,
/// atomically rename into place, and record status.
///
/// The transport is a callback so the cloud and local backends share every
/// other step. Whatever happens, the downloaded archive and the scratch
/// directory are gone when `run` returns; the extracted tree either appears
/// fully populated or not at all.
#[must_use]
pub struct InstallPackage<'a, Download> {
    pub data_dir: &'a DataDir,
    pub pkg: &'a PackageConfig,
    /// Absolute paths inside the tree that must exist and be non-empty for
    /// the already-installed short-circuit to apply.
    pub required_paths: &'a [PathBuf],
    pub cancel: &'a CancellationToken,
    /// Transport: writes the archive to the given path and reports checksum
    /// and content type.
    pub download: Download,
}

impl<'a, Download, DownloadFuture> InstallPackage<'a, Download>
where
    Download: FnOnce(PathBuf) -> DownloadFuture,
    DownloadFuture: Future<Output = Result<Downloaded, FetchError>>,
{
    /// Execute the subroutine.
    pub async fn run(self) -> Result<(), InstallError> {
        let InstallPackage { data_dir, pkg, required_paths, cancel, download } = self;
        let tree = data_dir.package_dir(pkg);
        let archive = data_dir.download_path(pkg);
        let tmp = data_dir.unpack_tmp_dir(pkg);

        if tree.is_dir() && required_paths.iter().all(|path| is_non_empty_file(path)) {
            tracing::debug!(
                target: "packsync::install",
                package_id = %pkg.package_id,
                version = %pkg.version,
                "Package tree already present, skipping install",
            );
            return Ok(());
        }

        // a failed unpack is sticky per (package_id, version): without this
        // gate every sync would re-download a known-bad archive forever
        if let Ok(Some(status)) = data_dir.read_status_file(pkg) {
            if status.sync_status == SyncStatus::Failed
                && status.package_id == pkg.package_id
                && status.version == pkg.version
            {
                return Err(InstallError::PreviouslyFailed {
                    package_id: pkg.package_id.clone(),
                    version: pkg.version.clone(),
                });
            }
        }

        let result = install(data_dir, pkg, cancel, download, &tree, &archive, &tmp).await;

        // staging never outlives the install, success or not
        let _ = fs::remove_file(&archive);
        let _ = fs::remove_dir_all(&tmp);
        result
    }
}

async fn install<Download, DownloadFuture>(
    data_dir: &DataDir,
    pkg: &PackageConfig,
    cancel: &CancellationToken,
    download: Download,
    tree: &Path,
    archive: &Path,
    tmp: &Path,
) -> Result<(), InstallError>
where
    Download: FnOnce(PathBuf) -> DownloadFuture,
    DownloadFuture: Future<Output = Result<Downloaded, FetchError>>,
{
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }

    tracing::info!(
        target: "packsync::install",
        package_id = %pkg.package_id,
        version = %pkg.version,
        "Installing package",
    );

    prepare_type_dir(data_dir, pkg)?;

    // drop remnants of any earlier attempt at this (package_id, version)
    remove_if_present(archive, false)?;
    remove_if_present(tmp, true)?;

    if pkg.package_type == PackageType::MlModel {
        // rebuilt by the backend after a successful install
        let _ = fs::remove_file(data_dir.legacy_symlink_path(&pkg.name));
    }

    data_dir
        .write_status_file(pkg, SyncStatus::Downloading, "")
        .map_err(InstallError::WriteStatus)?;

    let downloaded =
        download(archive.to_path_buf()).await.map_err(InstallError::Fetch)?;
    if downloaded.content_type != GZIP_CONTENT_TYPE {
        return Err(InstallError::WrongContentType { content_type: downloaded.content_type });
    }

    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }

    if let Err(error) = (UnpackArchive { archive, destination: tmp, cancel }).run() {
        data_dir
            .write_status_file(pkg, SyncStatus::Failed, &downloaded.checksum)
            .map_err(InstallError::WriteStatus)?;
        return Err(InstallError::Unpack(error));
    }

    rename_into_place(tmp, tree)?;

    data_dir
        .write_status_file(pkg, SyncStatus::Done, &downloaded.checksum)
        .map_err(InstallError::WriteStatus)?;

    tracing::info!(
        target: "packsync::install",
        package_id = %pkg.package_id,
        version = %pkg.version,
        "Package installed",
    );
    Ok(())
}

/// Make sure `data/<type>/` exists, clearing a same-named file left behind by
/// a legacy layout.
fn prepare_type_dir(data_dir: &DataDir, pkg: &PackageConfig) -> Result<(), InstallError> {
    let type_dir = data_dir.type_dir(pkg);
    if type_dir.is_file() {
        remove_if_present(&type_dir, false)?;
    }
    fs::create_dir_all(&type_dir)
        .map_err(|error| InstallError::PrepareDir { path: type_dir, error })
}

fn remove_if_present(path: &Path, is_dir: bool) -> Result<(), InstallError> {
    let result = if is_dir { fs::remove_dir_all(path) } else { fs::remove_file(path) };
    match result {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(InstallError::PrepareDir { path: path.to_path_buf(), error }),
    }
}

/// Atomically move the unpacked tree into its final location.
///
/// Platforms without replace-on-rename fail when the destination exists; that
/// is detected at runtime by retrying once after a best-effort pre-delete.
fn rename_into_place(tmp: &Path, tree: &Path) -> Result<(), InstallError> {
    match fs::rename(tmp, tree) {
        Ok(()) => Ok(()),
        Err(first_error) => {
            if tree.exists() {
                let _ = fs::remove_dir_all(tree);
                fs::rename(tmp, tree)
                    .map_err(|error| InstallError::Rename { to: tree.to_path_buf(), error })
            } else {
                Err(InstallError::Rename { to: tree.to_path_buf(), error: first_error })
            }
        }
    }
}

fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|metadata| metadata.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{gzipped_tarball, local_fetch, refusing_fetch};
    use packsync_data_dir::DataDir;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn package() -> PackageConfig {
        PackageConfig {
            name: "counter".to_string(),
            package_id: "org/counter".to_string(),
            version: "v1".to_string(),
            package_type: PackageType::Module,
            local_path: None,
        }
    }

    #[tokio::test]
    async fn installs_and_cleans_staging() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let source = root.path().join("src.tar.gz");
        gzipped_tarball(&source, &[("bin/counter", b"#!/bin/sh\n")]);
        let pkg = package();

        InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &[],
            cancel: &CancellationToken::new(),
            download: local_fetch(&source),
        }
        .run()
        .await
        .unwrap();

        let tree = data_dir.package_dir(&pkg);
        assert_eq!(fs::read(tree.join("bin/counter")).unwrap(), b"#!/bin/sh\n");
        assert!(data_dir.package_is_synced(&pkg));
        assert!(!data_dir.download_path(&pkg).exists());
        assert!(!data_dir.unpack_tmp_dir(&pkg).exists());
    }

    #[tokio::test]
    async fn existing_tree_short_circuits_the_transport() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let pkg = package();
        let tree = data_dir.package_dir(&pkg);
        fs::create_dir_all(tree.join("bin")).unwrap();
        fs::write(tree.join("bin/counter"), b"#!/bin/sh\n").unwrap();

        let required = [tree.join("bin/counter")];
        InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &required,
            cancel: &CancellationToken::new(),
            download: refusing_fetch("transport must not run when the tree is already usable"),
        }
        .run()
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn empty_required_path_forces_a_reinstall() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let pkg = package();
        let tree = data_dir.package_dir(&pkg);
        fs::create_dir_all(tree.join("bin")).unwrap();
        fs::write(tree.join("bin/counter"), b"").unwrap();

        let source = root.path().join("src.tar.gz");
        gzipped_tarball(&source, &[("bin/counter", b"#!/bin/sh\n")]);
        let required = [tree.join("bin/counter")];
        InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &required,
            cancel: &CancellationToken::new(),
            download: local_fetch(&source),
        }
        .run()
        .await
        .unwrap();

        assert_eq!(fs::read(tree.join("bin/counter")).unwrap(), b"#!/bin/sh\n");
    }

    #[tokio::test]
    async fn corrupt_archive_marks_the_package_failed() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let source = root.path().join("src.tar.gz");
        fs::write(&source, b"not actually gzip").unwrap();
        let pkg = package();

        let error = InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &[],
            cancel: &CancellationToken::new(),
            download: local_fetch(&source),
        }
        .run()
        .await
        .unwrap_err();
        assert!(matches!(error, InstallError::Unpack(_)));

        let status = data_dir.read_status_file(&pkg).unwrap().unwrap();
        assert_eq!(status.sync_status, SyncStatus::Failed);
        assert!(!data_dir.package_dir(&pkg).exists());
        assert!(!data_dir.download_path(&pkg).exists());

        // same (id, version) again: refused before any transport runs
        let error = InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &[],
            cancel: &CancellationToken::new(),
            download: refusing_fetch("transport must not run for a sticky-failed package"),
        }
        .run()
        .await
        .unwrap_err();
        assert!(matches!(error, InstallError::PreviouslyFailed { .. }));
    }

    #[tokio::test]
    async fn wrong_content_type_is_refused() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let pkg = package();

        let error = InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &[],
            cancel: &CancellationToken::new(),
            download: |destination: PathBuf| async move {
                fs::write(&destination, b"zip bytes").unwrap();
                Ok::<Downloaded, FetchError>(Downloaded {
                    checksum: String::new(),
                    content_type: "application/zip".to_string(),
                })
            },
        }
        .run()
        .await
        .unwrap_err();

        assert!(matches!(error, InstallError::WrongContentType { .. }));
        assert!(!data_dir.download_path(&pkg).exists());
        assert!(!data_dir.package_dir(&pkg).exists());
    }

    #[tokio::test]
    async fn reinstall_replaces_an_existing_tree() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let pkg = package();
        let source = root.path().join("src.tar.gz");

        gzipped_tarball(&source, &[("bin/counter", b"old")]);
        InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &[],
            cancel: &CancellationToken::new(),
            download: local_fetch(&source),
        }
        .run()
        .await
        .unwrap();

        // force a reinstall of the same version with new content by
        // emptying the required path
        let tree = data_dir.package_dir(&pkg);
        fs::write(tree.join("bin/counter"), b"").unwrap();
        gzipped_tarball(&source, &[("bin/counter", b"new")]);
        let required = [tree.join("bin/counter")];
        InstallPackage {
            data_dir: &data_dir,
            pkg: &pkg,
            required_paths: &required,
            cancel: &CancellationToken::new(),
            download: local_fetch(&source),
        }
        .run()
        .await
        .unwrap();

        assert_eq!(fs::read(tree.join("bin/counter")).unwrap(), b"new");
    }
}
