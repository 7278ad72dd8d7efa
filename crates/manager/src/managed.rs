use chrono::{DateTime, Utc};
use packsync_config::{Module, PackageConfig};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// A package that is present and healthy on disk, as far as the backend that
/// installed it knows. Entries are only mutated under the backend's write
/// lock.
#[derive(Debug, Clone)]
pub struct ManagedPackage {
    pub config: PackageConfig,
    pub last_observed: DateTime<Utc>,
}

impl ManagedPackage {
    pub fn observed_now(config: &PackageConfig) -> Self {
        ManagedPackage { config: config.clone(), last_observed: Utc::now() }
    }
}

/// Backend-internal map of managed packages, keyed by package name.
pub type ManagedMap = HashMap<String, ManagedPackage>;

/// Whether `pkg` can be skipped entirely: already managed under the same
/// `(package_id, version)` and backed by a `done` status file on disk.
pub(crate) fn is_unchanged(
    managed: &ManagedMap,
    pkg: &PackageConfig,
    data_dir: &packsync_data_dir::DataDir,
) -> bool {
    managed.get(&pkg.name).is_some_and(|entry| {
        entry.config.package_id == pkg.package_id && entry.config.version == pkg.version
    }) && data_dir.package_is_synced(pkg)
}

/// Paths inside `tree` that must be non-empty for the install short-circuit.
///
/// Only module packages have them: the one module whose executable lives in
/// this tree names the file that proves the tree is usable. With several
/// matching modules the hint is ambiguous, so the check is skipped.
pub(crate) fn required_paths_for(tree: &Path, modules: &[Module]) -> Vec<PathBuf> {
    let mut matching = modules.iter().filter(|module| module.exe_path.starts_with(tree));
    match (matching.next(), matching.next()) {
        (Some(module), None) => vec![module.exe_path.clone()],
        (Some(_), Some(_)) => {
            tracing::warn!(
                target: "packsync::sync",
                tree = %tree.display(),
                "Multiple modules claim this package tree, skipping the non-empty executable check",
            );
            vec![]
        }
        _ => vec![],
    }
}
