use crate::{
    is_unchanged, FetchError, InstallPackage, ManagedMap, ManagedPackage, PackageFailure,
    PackageManager, PackagePathError, SyncError,
};
use async_trait::async_trait;
use packsync_config::{Module, PackageConfig};
use packsync_data_dir::{CleanupEntryError, CleanupError, DataDir};
use packsync_network::CopyLocalArchive;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Backend for locally-developed modules: treats each local tarball as a
/// synthetic package and installs it through the same pipeline the cloud
/// backend uses, from a `file://` source instead of the object store.
///
/// Works in a `-local` sibling of the packages root so it never interferes
/// with cloud-synced trees.
pub struct LocalManager {
    data_dir: DataDir,
    managed: RwLock<ManagedMap>,
}

impl LocalManager {
    /// `data_dir` is the robot's packages root; the backend derives its own
    /// sibling root from it.
    pub fn new(data_dir: DataDir) -> Self {
        LocalManager { data_dir: data_dir.local_variant(), managed: RwLock::new(ManagedMap::new()) }
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    /// Copy and unpack one synthetic package from its tarball.
    async fn install_one(
        &self,
        cancel: &CancellationToken,
        pkg: &PackageConfig,
        source: &Path,
    ) -> Result<(), PackageFailure> {
        tracing::info!(
            target: "packsync::sync",
            package_id = %pkg.package_id,
            url = %format!("file://{}", source.display()),
            "Syncing local module tarball",
        );
        InstallPackage {
            data_dir: &self.data_dir,
            pkg,
            required_paths: &[],
            cancel,
            download: move |destination: PathBuf| async move {
                CopyLocalArchive { source, destination: &destination }
                    .run()
                    .map_err(FetchError::LocalCopy)
            },
        }
        .run()
        .await
        .map_err(|error| PackageFailure::Install {
            package_id: pkg.package_id.clone(),
            version: pkg.version.clone(),
            error,
        })
    }

    /// Re-sync a single module, re-copying its tarball only when the source
    /// is newer than the extracted tree. Used when the user explicitly
    /// restarts a module.
    pub async fn sync_one(
        &self,
        cancel: &CancellationToken,
        module: &Module,
    ) -> Result<(), SyncError> {
        if !module.is_local_tarball() {
            return Ok(());
        }
        let pkg = match module.synthetic_package() {
            Ok(pkg) => pkg,
            Err(error) => {
                return Err(SyncError {
                    failures: vec![PackageFailure::Synthetic { name: module.name.clone(), error }],
                })
            }
        };

        let mut managed = self.managed.write().await;
        let tree = self.data_dir.package_dir(&pkg);
        if tree.is_dir() {
            if !source_newer_than_tree(&module.exe_path, &tree) {
                managed.insert(pkg.name.clone(), ManagedPackage::observed_now(&pkg));
                return Ok(());
            }
            // force the pipeline past its already-installed short-circuit
            if let Err(error) = fs::remove_dir_all(&tree) {
                return Err(SyncError {
                    failures: vec![PackageFailure::Cleanup(CleanupError {
                        failures: vec![CleanupEntryError { path: tree, error }],
                    })],
                });
            }
        }

        match self.install_one(cancel, &pkg, &module.exe_path).await {
            Ok(()) => {
                managed.insert(pkg.name.clone(), ManagedPackage::observed_now(&pkg));
                Ok(())
            }
            Err(failure) => Err(SyncError { failures: vec![failure] }),
        }
    }
}

#[async_trait]
impl PackageManager for LocalManager {
    async fn sync(
        &self,
        cancel: &CancellationToken,
        packages: &[PackageConfig],
        modules: &[Module],
    ) -> Result<(), SyncError> {
        let mut managed = self.managed.write().await;
        let mut failures = Vec::new();

        // desired set: synthetic configs handed to us directly, plus one per
        // local-tarball module
        let mut desired: Vec<PackageConfig> =
            packages.iter().filter(|pkg| pkg.is_synthetic()).cloned().collect();
        for module in modules.iter().filter(|module| module.is_local_tarball()) {
            match module.synthetic_package() {
                Ok(pkg) => desired.push(pkg),
                Err(error) => {
                    failures.push(PackageFailure::Synthetic { name: module.name.clone(), error })
                }
            }
        }

        let mut next = ManagedMap::new();
        for pkg in &desired {
            if let Err(error) = pkg.validate() {
                tracing::error!(target: "packsync::sync", %error, "Skipping invalid synthetic package");
                continue;
            }
            let Some(source) = pkg.local_path.clone() else {
                tracing::error!(
                    target: "packsync::sync",
                    package_id = %pkg.package_id,
                    "Skipping synthetic package without a source path",
                );
                continue;
            };
            if is_unchanged(&managed, pkg, &self.data_dir) {
                next.insert(pkg.name.clone(), ManagedPackage::observed_now(pkg));
                continue;
            }
            if cancel.is_cancelled() {
                failures.push(PackageFailure::Cancelled);
                break;
            }
            match self.install_one(cancel, pkg, &source).await {
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
        let expected: HashSet<PathBuf> =
            managed.values().map(|entry| self.data_dir.package_dir(&entry.config)).collect();
        let mut failures = Vec::new();
        if let Err(error) = self.data_dir.cleanup(&expected) {
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

fn source_newer_than_tree(source: &Path, tree: &Path) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|metadata| metadata.modified());
    match (modified(source), modified(tree)) {
        (Ok(source_mtime), Ok(tree_mtime)) => source_mtime > tree_mtime,
        _ => false,
    }
}
