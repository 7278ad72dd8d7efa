use crate::{
    CloudManager, PackageFailure, PackageManager, PackagePathError, SyncError,
};
use async_trait::async_trait;
use packsync_catalog::{CatalogError, PackageCatalog};
use packsync_config::{Module, PackageConfig};
use packsync_data_dir::DataDir;
use packsync_network::CloudCredentials;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// What the connection channel eventually delivers: a catalog client, or the
/// error explaining why none will arrive.
pub type CatalogConnection = Result<Arc<dyn PackageCatalog>, CatalogError>;

/// Backend used while the robot has no catalog connection: every operation
/// succeeds without touching the network or the disk, and `package_path`
/// echoes the name back.
pub struct NoopManager;

#[async_trait]
impl PackageManager for NoopManager {
    async fn sync(
        &self,
        _cancel: &CancellationToken,
        _packages: &[PackageConfig],
        _modules: &[Module],
    ) -> Result<(), SyncError> {
        Ok(())
    }

    async fn cleanup(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        Ok(())
    }

    async fn package_path(&self, name: &str) -> Result<PathBuf, PackagePathError> {
        Ok(PathBuf::from(name))
    }

    async fn close(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

#[derive(Clone)]
enum ActiveBackend {
    Noop,
    Cloud(Arc<CloudManager>),
}

struct DeferredState {
    connection: Option<oneshot::Receiver<CatalogConnection>>,
    cloud: Option<Arc<CloudManager>>,
    last_used: ActiveBackend,
}

/// Frontend that lets a robot reconfigure before it can reach the catalog.
///
/// Until the connection channel delivers a catalog client, syncs whose
/// packages are all already on disk are served by [`NoopManager`]; a sync
/// that actually needs bytes blocks on the channel. Once a cloud backend is
/// built it serves everything. `cleanup`, `package_path` and `close` always
/// route to whichever backend handled the most recent `sync`, so a cleanup
/// can never run against a manager that has not seen the desired set.
pub struct DeferredManager {
    credentials: CloudCredentials,
    data_dir: DataDir,
    state: Mutex<DeferredState>,
}

impl DeferredManager {
    pub fn new(
        credentials: CloudCredentials,
        data_dir: DataDir,
        connection: oneshot::Receiver<CatalogConnection>,
    ) -> Self {
        DeferredManager {
            credentials,
            data_dir,
            state: Mutex::new(DeferredState {
                connection: Some(connection),
                cloud: None,
                last_used: ActiveBackend::Noop,
            }),
        }
    }

    fn build_cloud(
        &self,
        state: &mut DeferredState,
        catalog: Arc<dyn PackageCatalog>,
    ) -> Result<Arc<CloudManager>, SyncError> {
        let cloud = CloudManager::new(catalog, self.credentials.clone(), self.data_dir.clone())
            .map_err(|error| SyncError { failures: vec![PackageFailure::Connect { error }] })?;
        let cloud = Arc::new(cloud);
        state.cloud = Some(cloud.clone());
        Ok(cloud)
    }

    /// Pick the backend for one sync, blocking on the connection channel
    /// only when a desired package is not on disk yet.
    async fn backend_for_sync(
        &self,
        state: &mut DeferredState,
        cancel: &CancellationToken,
        packages: &[PackageConfig],
    ) -> Result<ActiveBackend, SyncError> {
        if let Some(cloud) = &state.cloud {
            return Ok(ActiveBackend::Cloud(cloud.clone()));
        }

        let no_connection =
            || SyncError { failures: vec![PackageFailure::NoConnection] };

        let missing_on_disk = packages
            .iter()
            .filter(|pkg| pkg.validate().is_ok())
            .any(|pkg| !self.data_dir.package_dir(pkg).is_dir());
        if missing_on_disk {
            let Some(mut receiver) = state.connection.take() else {
                return Err(no_connection());
            };
            tracing::info!(
                target: "packsync::sync",
                "Desired packages are not on disk yet, waiting for a catalog connection",
            );
            let delivered = tokio::select! {
                _ = cancel.cancelled() => {
                    state.connection = Some(receiver);
                    return Err(SyncError { failures: vec![PackageFailure::Cancelled] });
                }
                delivered = &mut receiver => delivered,
            };
            return match delivered {
                Ok(Ok(catalog)) => Ok(ActiveBackend::Cloud(self.build_cloud(state, catalog)?)),
                Ok(Err(error)) => {
                    tracing::error!(target: "packsync::sync", %error, "Catalog connection failed");
                    Err(no_connection())
                }
                Err(_sender_dropped) => Err(no_connection()),
            };
        }

        // everything is on disk: take a connection if one happens to be
        // ready, but never block an offline start-up
        match state.connection.as_mut().map(oneshot::Receiver::try_recv) {
            Some(Ok(Ok(catalog))) => Ok(ActiveBackend::Cloud(self.build_cloud(state, catalog)?)),
            Some(Ok(Err(error))) => {
                tracing::warn!(target: "packsync::sync", %error, "Catalog connection failed, staying offline");
                state.connection = None;
                Ok(ActiveBackend::Noop)
            }
            Some(Err(oneshot::error::TryRecvError::Empty)) => Ok(ActiveBackend::Noop),
            Some(Err(oneshot::error::TryRecvError::Closed)) | None => {
                state.connection = None;
                Ok(ActiveBackend::Noop)
            }
        }
    }
}

#[async_trait]
impl PackageManager for DeferredManager {
    async fn sync(
        &self,
        cancel: &CancellationToken,
        packages: &[PackageConfig],
        modules: &[Module],
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let backend = self.backend_for_sync(&mut state, cancel, packages).await?;
        state.last_used = backend.clone();
        match &backend {
            ActiveBackend::Noop => NoopManager.sync(cancel, packages, modules).await,
            ActiveBackend::Cloud(cloud) => cloud.sync(cancel, packages, modules).await,
        }
    }

    async fn cleanup(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let state = self.state.lock().await;
        match &state.last_used {
            ActiveBackend::Noop => NoopManager.cleanup(cancel).await,
            ActiveBackend::Cloud(cloud) => cloud.cleanup(cancel).await,
        }
    }

    async fn package_path(&self, name: &str) -> Result<PathBuf, PackagePathError> {
        let state = self.state.lock().await;
        match &state.last_used {
            ActiveBackend::Noop => NoopManager.package_path(name).await,
            ActiveBackend::Cloud(cloud) => cloud.package_path(name).await,
        }
    }

    async fn close(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.connection = None;
        match &state.last_used {
            ActiveBackend::Noop => NoopManager.close().await,
            ActiveBackend::Cloud(cloud) => cloud.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{gzipped_tarball_bytes, serve_archive, test_credentials};
    use packsync_catalog::MemoryCatalog;
    use packsync_config::PackageType;
    use pretty_assertions::assert_eq;
    use std::fs;
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

    #[tokio::test]
    async fn offline_start_with_cached_packages_stays_noop() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let pkg = ml_model("m", "org/m", "v1");
        let tree = data_dir.package_dir(&pkg);
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("model.tflite"), b"weights").unwrap();

        let (_sender, receiver) = oneshot::channel();
        let manager = DeferredManager::new(test_credentials(), data_dir, receiver);
        let cancel = CancellationToken::new();

        manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap();
        // served by the no-op backend: the name echoes back and cleanup
        // leaves the cached tree alone
        assert_eq!(manager.package_path("m").await.unwrap(), PathBuf::from("m"));
        manager.cleanup(&cancel).await.unwrap();
        assert!(tree.is_dir());
    }

    #[tokio::test]
    async fn blocks_until_the_connection_arrives_when_packages_are_missing() {
        crate::test_support::enable_test_tracing();
        let root = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let body = gzipped_tarball_bytes(&[("model.tflite", b"weights")]);
        serve_archive(&mut server, "/org/m/v1.tar.gz", &body, 1).await;

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("org/m", "v1", &format!("{}/org/m/v1.tar.gz", server.url()));

        let data_dir = DataDir::new(root.path().join("packages"));
        let (sender, receiver) = oneshot::channel();
        let manager = DeferredManager::new(test_credentials(), data_dir.clone(), receiver);
        let cancel = CancellationToken::new();
        let pkg = ml_model("m", "org/m", "v1");

        // deliver the catalog a moment after the sync starts blocking
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let catalog: Arc<dyn PackageCatalog> = catalog;
            let _ = sender.send(Ok(catalog));
        });

        manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap();

        let tree = data_dir.package_dir(&pkg);
        assert_eq!(fs::read(tree.join("model.tflite")).unwrap(), b"weights");
        // subsequent calls route to the cloud backend that did the sync
        assert_eq!(manager.package_path("m").await.unwrap(), tree);
        manager.cleanup(&cancel).await.unwrap();
        assert!(tree.is_dir());
    }

    #[tokio::test]
    async fn connection_error_fails_a_sync_that_needs_bytes() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let (sender, receiver) = oneshot::channel();
        let manager = DeferredManager::new(test_credentials(), data_dir, receiver);
        let pkg = ml_model("m", "org/m", "v1");

        sender
            .send(Err(CatalogError::Rpc {
                package_id: String::new(),
                version: String::new(),
                message: "robot is not provisioned".to_string(),
            }))
            .ok();

        let error = manager
            .sync(&CancellationToken::new(), std::slice::from_ref(&pkg), &[])
            .await
            .unwrap_err();
        assert!(error.to_string().to_lowercase().contains("no connection"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let root = tempdir().unwrap();
        let data_dir = DataDir::new(root.path().join("packages"));
        let (_sender, receiver) = oneshot::channel();
        let manager = DeferredManager::new(test_credentials(), data_dir, receiver);
        let pkg = ml_model("m", "org/m", "v1");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error =
            manager.sync(&cancel, std::slice::from_ref(&pkg), &[]).await.unwrap_err();
        assert!(matches!(error.failures[0], PackageFailure::Cancelled));
    }
}
