use derive_more::From;
use packsync_config::PackageConfig;
use std::{
    ffi::OsString,
    path::{self, Path, PathBuf},
};

/// Suffix of the sidecar recording a package's sync state.
pub const STATUS_FILE_SUFFIX: &str = ".status.json";

/// Suffix of the marker the module driver writes after a module's first
/// successful start. Preserved by cleanup alongside the tree it annotates.
pub const FIRST_RUN_MARKER_SUFFIX: &str = ".first_run_succeeded";

/// Suffix of the archive while (and after) it is being downloaded.
pub const DOWNLOAD_SUFFIX: &str = ".download";

/// Root of the packages directory on a robot.
///
/// All extracted trees, download staging files and status sidecars live in
/// sub-paths derived here; consumers should never assemble these paths by
/// hand.
#[derive(Debug, Clone, PartialEq, Eq, From)]
pub struct DataDir {
    root: PathBuf,
}

/// Flatten a package id into a single path component.
pub fn sanitize_package_id(package_id: &str) -> String {
    package_id.replace(['/', '\\'], "-")
}

impl DataDir {
    /// Construct an instance of [`DataDir`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        root.into().into()
    }

    /// The packages root itself. Ml-model legacy symlinks are created directly
    /// under it.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an object that [displays](std::fmt::Display) the root.
    pub fn display(&self) -> path::Display {
        self.root.display()
    }

    /// Sibling root used by the local backend so cloud and local syncs never
    /// interfere.
    pub fn local_variant(&self) -> DataDir {
        let mut root = OsString::from(self.root.as_os_str());
        root.push("-local");
        DataDir::new(PathBuf::from(root))
    }

    /// Get `<root>/data`, the directory holding all type buckets.
    pub fn data(&self) -> PathBuf {
        self.root.join("data")
    }

    /// The type bucket a package's tree lives in.
    pub fn type_dir(&self, pkg: &PackageConfig) -> PathBuf {
        self.data().join(pkg.package_type.dir_name())
    }

    /// The extracted tree of a package:
    /// `<root>/data/<type>/<sanitized-id>-<version>`.
    pub fn package_dir(&self, pkg: &PackageConfig) -> PathBuf {
        self.type_dir(pkg)
            .join(format!("{id}-{version}", id = sanitize_package_id(&pkg.package_id), version = pkg.version))
    }

    /// Staging destination of a package's downloaded archive.
    pub fn download_path(&self, pkg: &PackageConfig) -> PathBuf {
        suffixed(&self.package_dir(pkg), DOWNLOAD_SUFFIX)
    }

    /// Scratch directory the archive is unpacked into before the atomic
    /// rename. Same parent as the final tree.
    pub fn unpack_tmp_dir(&self, pkg: &PackageConfig) -> PathBuf {
        suffixed(&self.package_dir(pkg), ".tmp")
    }

    /// The status sidecar of an extracted tree.
    pub fn status_file_path(&self, pkg: &PackageConfig) -> PathBuf {
        suffixed(&self.package_dir(pkg), STATUS_FILE_SUFFIX)
    }

    /// Legacy symlink `<root>/<name>` kept for ml-model consumers.
    pub fn legacy_symlink_path(&self, package_name: &str) -> PathBuf {
        self.root.join(package_name)
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use packsync_config::PackageType;
    use pipe_trait::Pipe;
    use pretty_assertions::assert_eq;

    fn detector() -> PackageConfig {
        PackageConfig {
            name: "detector".to_string(),
            package_id: "org/detector".to_string(),
            version: "v1".to_string(),
            package_type: PackageType::MlModel,
            local_path: None,
        }
    }

    #[test]
    fn package_dir_flattens_the_id() {
        let received = "/opt/robot/packages".pipe(DataDir::new).package_dir(&detector());
        let expected = PathBuf::from("/opt/robot/packages/data/ml_model/org-detector-v1");
        assert_eq!(&received, &expected);
    }

    #[test]
    fn derived_paths_are_siblings_of_the_tree() {
        let data_dir = DataDir::new("/opt/robot/packages");
        let pkg = detector();
        assert_eq!(
            data_dir.download_path(&pkg),
            PathBuf::from("/opt/robot/packages/data/ml_model/org-detector-v1.download"),
        );
        assert_eq!(
            data_dir.unpack_tmp_dir(&pkg),
            PathBuf::from("/opt/robot/packages/data/ml_model/org-detector-v1.tmp"),
        );
        assert_eq!(
            data_dir.status_file_path(&pkg),
            PathBuf::from("/opt/robot/packages/data/ml_model/org-detector-v1.status.json"),
        );
    }

    #[test]
    fn local_variant_is_a_sibling_root() {
        let received = DataDir::new("/opt/robot/packages").local_variant();
        assert_eq!(received, DataDir::new("/opt/robot/packages-local"));
    }

    #[test]
    fn legacy_symlink_lives_at_the_root() {
        let received = DataDir::new("/opt/robot/packages").legacy_symlink_path("detector");
        assert_eq!(received, PathBuf::from("/opt/robot/packages/detector"));
    }
}
