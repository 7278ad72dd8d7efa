use crate::{
    is_unchanged, required_paths_for, FetchError, InstallPackage, ManagedMap, ManagedPackage,
    PackageFailure, PackageManager, PackagePathError, SyncError,
};
use async_trait::async_trait;
use packsync_catalog::{GetPackageRequest, PackageCatalog};
use packsync_config::{Module, PackageConfig, PackageType};
use packsync_data_dir::{CleanupEntryError, CleanupError, DataDir};
use packsync_fs::link_file;
use packsync_network::{CloudClient, CloudCredentials, DownloadArchive};
use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Backend that resolves packages through the catalog RPC and downloads them
/// from the object store.
pub struct CloudManager {
    catalog: Arc<dyn PackageCatalog>,
    client: CloudClient,
    data_dir: DataDir,
    managed: RwLock<ManagedMap>,
}

impl CloudManager {
    pub fn new(
        catalog: Arc<dyn PackageCatalog>,
        credentials: CloudCredentials,
        data_dir: DataDir,
    ) -> Result<Self, reqwest::Error> {
        Ok(CloudManager {
            catalog,
            client: CloudClient::new(credentials)?,
            data_dir,
            managed: RwLock::new(ManagedMap::new()),
        })
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    /// Resolve, download and unpack one changed package.
    async fn install_one(
        &self,
        cancel: &CancellationToken,
        pkg: &PackageConfig,
        modules: &[Module],
    ) -> Result<(), PackageFailure> {
        let resolved = self
            .catalog
            .get_package(GetPackageRequest {
                package_id: pkg.package_id.clone(),
                version: pkg.version.clone(),
                package_type: pkg.package_type,
                include_url: true,
            })
            .await
            .map_err(|error| PackageFailure::Resolve {
                package_id: pkg.package_id.clone(),
                version: pkg.version.clone(),
                error,
            })?;

        let tree = self.data_dir.package_dir(pkg);
        let required = required_paths_for(&tree, modules);
        let url = resolved.url;
        let client = &self.client;

        InstallPackage {
            data_dir: &self.data_dir,
            pkg,
            required_paths: &required,
            cancel,
            download: move |destination: PathBuf| async move {
                DownloadArchive { client, url: &url, destination: &destination, cancel }
                    .run()
                    .await
                    .map_err(FetchError::Http)
            },
        }
        .run()
        .await
        .map_err(|error| PackageFailure::Install {
            package_id: pkg.package_id.clone(),
            version: pkg.version.clone(),
            error,
        })?;

        if pkg.package_type == PackageType::MlModel {
            link_file(&tree, &self.data_dir.legacy_symlink_path(&pkg.name))
                .map_err(|error| PackageFailure::Symlink { name: pkg.name.clone(), error })?;
        }
        Ok(())
    }
}

#[async_trait]
impl PackageManager for CloudManager {
    async fn sync(
        &self,
        cancel: &CancellationToken,
        packages: &[PackageConfig],
        modules: &[Module],
    ) -> Result<(), SyncError> {
        let mut managed = self.managed.write().await;
        let mut failures = Vec::new();
        let mut next = ManagedMap::new();
        let mut changed: Vec<&PackageConfig> = Vec::new();

        for pkg in packages {
            if let Err(error) = pkg.validate() {
                tracing::error!(target: "packsync::sync", %error, "Skipping invalid package config");
                continue;
            }
            if is_unchanged(&managed, pkg, &self.data_dir) {
                next.insert(pkg.name.clone(), ManagedPackage::observed_now(pkg));
            } else {
                changed.push(pkg);
            }
        }

        tracing::info!(
            target: "packsync::sync",
            unchanged = next.len(),
            changed = changed.len(),
            "Syncing packages",
        );

        for pkg in changed {
            if cancel.is_cancelled() {
                failures.push(PackageFailure::Cancelled);
                break;
            }
            match self.install_one(cancel, pkg, modules).await {
                Ok(()) => {
                    next.insert(pkg.name.clone(), ManagedPackage::observed_now(pkg));
                }
                Err(failure) => failures.push(failure),
            }
        }

        *managed = next;
        SyncError::from_failures(failures)
    }

    async fn cleanup(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        let managed = self.managed.write().await;
        let mut failures = Vec::new();

        let expected: HashSet<PathBuf> =
            managed.values().map(|entry| self.data_dir.package_dir(&entry.config)).collect();
        if let Err(error) = self.data_dir.cleanup(&expected) {
            failures.push(PackageFailure::Cleanup(error));
        }

        if let Some(error) = sweep_stale_symlinks(&self.data_dir, &managed) {
            failures.push(PackageFailure::Cleanup(error));
        }

        SyncError::from_failures(failures)
    }

    async fn package_path(&self, name: &str) -> Result<PathBuf, PackagePathError> {
        let managed = self.managed.read().await;
        managed
            .get(name)
            .map(|entry| self.data_dir.package_dir(&entry.config))
            .ok_or_else(|| PackagePathError::PackageMissing { name: name.to_string() })
    }

    async fn close(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Remove ml-model legacy symlinks at the packages root that no managed
/// package claims any more.
fn sweep_stale_symlinks(data_dir: &DataDir, managed: &ManagedMap) -> Option<CleanupError> {
    let entries = match fs::read_dir(data_dir.root()) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => {
            return Some(CleanupError {
                failures: vec![CleanupEntryError { path: data_dir.root().to_path_buf(), error }],
            })
        }
    };

    let mut failures = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_symlink = fs::symlink_metadata(&path)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            continue;
        }
        let claimed = entry
            .file_name()
            .to_str()
            .is_some_and(|name| managed.contains_key(name));
        if !claimed {
            tracing::debug!(target: "packsync::cleanup", path = %path.display(), "Removing stale package symlink");
            if let Err(error) = fs::remove_file(&path) {
                failures.push(CleanupEntryError { path, error });
            }
        }
    }
    if failures.is_empty() {
        None
    } else {
        Some(CleanupError { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        crc32c_base64, gzipped_tarball_bytes, serve_archive, test_credentials,
    };
    use packsync_catalog::MemoryCatalog;
    use packsync_data_dir::SyncStatus;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn ml_model(name: &str, package_id: &str, version: &str) -> PackageConfig {
        PackageConfig {
            name: name.to_string(),
            package_id: package_id.to_string(),
            version: version.to_string(),
            package_type: PackageType::MlModel,
            local_path: None,
        }
    }

    fn manager_at(catalog: &Arc<MemoryCatalog>, root: &std::path::Path) -> CloudManager {
        CloudManager::new(
            catalog.clone(),
            test_credentials(),
            DataDir::new(root.join("packages")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sync_installs_and_repeats_without_network_io() {
        crate::test_support::enable_test_tracing();
        let root = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let body = gzipped_tarball_bytes(&[("model.tflite", b"weights")]);
        let mock = serve_archive(&mut server, "/org/m/v1.tar.gz", &body, 1).await;

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("org/m", "v1", &format!("{}/org/m/v1.tar.gz", server.url()));
        let manager = manager_at(&catalog, root.path());
        let pkg = ml_model("m", "org/m", "v1");
        let cancel = CancellationToken::new();

        manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap();

        let tree = manager.data_dir().package_dir(&pkg);
        assert_eq!(fs::read(tree.join("model.tflite")).unwrap(), b"weights");
        assert_eq!(fs::read_link(manager.data_dir().legacy_symlink_path("m")).unwrap(), tree);
        assert!(manager.data_dir().package_is_synced(&pkg));
        assert_eq!(manager.package_path("m").await.unwrap(), tree);

        // second sync of the same desired set: no catalog call, no download
        manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap();
        assert_eq!(catalog.lookups(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_cleanup_clears_the_marker() {
        let root = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let body = gzipped_tarball_bytes(&[("model.tflite", b"weights")]);
        server
            .mock("GET", "/org/m/v1.tar.gz")
            .with_header("content-type", "application/x-gzip")
            .with_header("x-goog-hash", &format!("crc32c={}", crc32c_base64(b"other bytes")))
            .with_body(&body)
            .create_async()
            .await;

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("org/m", "v1", &format!("{}/org/m/v1.tar.gz", server.url()));
        let manager = manager_at(&catalog, root.path());
        let pkg = ml_model("m", "org/m", "v1");
        let cancel = CancellationToken::new();

        let error = manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap_err();
        assert!(error.to_string().contains("did not match expected hash"));
        assert!(!manager.data_dir().package_dir(&pkg).exists());
        manager.package_path("m").await.unwrap_err();

        manager.cleanup(&cancel).await.unwrap();
        assert!(!manager.data_dir().status_file_path(&pkg).exists());
    }

    #[tokio::test]
    async fn failed_unpack_is_sticky_until_a_version_change() {
        let root = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        // valid checksum over an archive that is not actually a tarball
        let corrupt = b"valid bytes, invalid archive".as_slice();
        let corrupt_mock = serve_archive(&mut server, "/org/m/v1.tar.gz", corrupt, 1).await;
        let good = gzipped_tarball_bytes(&[("model.tflite", b"weights")]);
        serve_archive(&mut server, "/org/m/v2.tar.gz", &good, 1).await;

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("org/m", "v1", &format!("{}/org/m/v1.tar.gz", server.url()));
        catalog.insert("org/m", "v2", &format!("{}/org/m/v2.tar.gz", server.url()));
        let manager = manager_at(&catalog, root.path());
        let cancel = CancellationToken::new();

        let v1 = ml_model("m", "org/m", "v1");
        let error = manager.sync(&cancel, std::slice::from_ref(&v1), &[]).await.unwrap_err();
        assert!(matches!(
            error.failures[0],
            PackageFailure::Install { error: crate::InstallError::Unpack(_), .. }
        ));
        let status = manager.data_dir().read_status_file(&v1).unwrap().unwrap();
        assert_eq!(status.sync_status, SyncStatus::Failed);

        // same version again: still an error, but zero additional downloads
        manager.sync(&cancel, std::slice::from_ref(&v1), &[]).await.unwrap_err();
        corrupt_mock.assert_async().await;

        // a version bump clears the stickiness
        let v2 = ml_model("m", "org/m", "v2");
        manager.sync(&cancel, std::slice::from_ref(&v2), &[]).await.unwrap();
        assert!(manager.data_dir().package_dir(&v2).is_dir());
    }

    #[tokio::test]
    async fn version_upgrade_replaces_the_tree_after_cleanup() {
        let root = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let body_v1 = gzipped_tarball_bytes(&[("model.tflite", b"v1 weights")]);
        let body_v2 = gzipped_tarball_bytes(&[("model.tflite", b"v2 weights")]);
        serve_archive(&mut server, "/org/m/v1.tar.gz", &body_v1, 1).await;
        serve_archive(&mut server, "/org/m/v2.tar.gz", &body_v2, 1).await;

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("org/m", "v1", &format!("{}/org/m/v1.tar.gz", server.url()));
        catalog.insert("org/m", "v2", &format!("{}/org/m/v2.tar.gz", server.url()));
        let manager = manager_at(&catalog, root.path());
        let cancel = CancellationToken::new();

        let v1 = ml_model("m", "org/m", "v1");
        let v2 = ml_model("m", "org/m", "v2");
        manager.sync(&cancel, std::slice::from_ref(&v1), &[]).await.unwrap();
        manager.sync(&cancel, std::slice::from_ref(&v2), &[]).await.unwrap();
        manager.cleanup(&cancel).await.unwrap();

        assert!(!manager.data_dir().package_dir(&v1).exists());
        assert!(!manager.data_dir().status_file_path(&v1).exists());
        assert!(manager.data_dir().package_dir(&v2).is_dir());
        assert!(manager.data_dir().status_file_path(&v2).is_file());
        assert_eq!(
            fs::read_link(manager.data_dir().legacy_symlink_path("m")).unwrap(),
            manager.data_dir().package_dir(&v2),
        );
    }

    #[tokio::test]
    async fn partial_success_keeps_the_healthy_packages() {
        let root = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let body = gzipped_tarball_bytes(&[("model.tflite", b"weights")]);
        serve_archive(&mut server, "/org/b/v1.tar.gz", &body, 1).await;

        let catalog = Arc::new(MemoryCatalog::new());
        // "org/a" is deliberately absent from the catalog
        catalog.insert("org/b", "v1", &format!("{}/org/b/v1.tar.gz", server.url()));
        let manager = manager_at(&catalog, root.path());
        let cancel = CancellationToken::new();

        let a = ml_model("a", "org/a", "v1");
        let b = ml_model("b", "org/b", "v1");
        let error = manager.sync(&cancel, &[a, b.clone()], &[]).await.unwrap_err();

        assert_eq!(error.failures.len(), 1);
        assert!(error.to_string().contains("org/a"));
        assert!(matches!(error.failures[0], PackageFailure::Resolve { .. }));
        assert!(manager.data_dir().package_dir(&b).is_dir());
        manager.package_path("b").await.unwrap();
        manager.package_path("a").await.unwrap_err();
    }

    #[tokio::test]
    async fn invalid_configs_are_skipped_not_failed() {
        let root = tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let manager = manager_at(&catalog, root.path());

        let mut invalid = ml_model("m", "org/m", "v1");
        invalid.package_id = "../escape".to_string();
        manager
            .sync(&CancellationToken::new(), std::slice::from_ref(&invalid), &[])
            .await
            .unwrap();
        assert_eq!(catalog.lookups(), 0);
        manager.package_path("m").await.unwrap_err();
    }

    #[tokio::test]
    async fn cleanup_sweeps_stale_symlinks() {
        let root = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let body = gzipped_tarball_bytes(&[("model.tflite", b"weights")]);
        serve_archive(&mut server, "/org/m/v1.tar.gz", &body, 1).await;

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("org/m", "v1", &format!("{}/org/m/v1.tar.gz", server.url()));
        let manager = manager_at(&catalog, root.path());
        let cancel = CancellationToken::new();
        let pkg = ml_model("m", "org/m", "v1");
        manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap();

        let stale = manager.data_dir().legacy_symlink_path("forgotten");
        packsync_fs::symlink_dir(&manager.data_dir().package_dir(&pkg), &stale).unwrap();

        manager.cleanup(&cancel).await.unwrap();
        assert!(!stale.exists());
        assert!(manager.data_dir().legacy_symlink_path("m").is_symlink());
        assert!(manager.data_dir().package_dir(&pkg).is_dir());
    }

    #[tokio::test]
    async fn cancelled_sync_reports_cancellation() {
        let root = tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("org/m", "v1", "http://unreachable.invalid/pkg.tar.gz");
        let manager = manager_at(&catalog, root.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pkg = ml_model("m", "org/m", "v1");
        let error = manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap_err();
        assert!(matches!(error.failures[0], PackageFailure::Cancelled));
        assert_eq!(catalog.lookups(), 0);
    }
}
