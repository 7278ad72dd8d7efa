use derive_more::{Display, Error};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest archive the engine will download or unpack (50 GiB). Bigger
/// payloads are refused by both the transport and the unpacker.
pub const MAX_PACKAGE_SIZE: u64 = 50 * 1024 * 1024 * 1024;

/// Kind of artifact a package carries.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    #[display("ml_model")]
    MlModel,
    #[display("module")]
    Module,
    #[display("archive")]
    Archive,
}

impl PackageType {
    /// Name of the type bucket under `data/` that trees of this type live in.
    pub fn dir_name(&self) -> &'static str {
        match self {
            PackageType::MlModel => "ml_model",
            PackageType::Module => "module",
            PackageType::Archive => "archive",
        }
    }
}

/// A single desired-state entry: one immutable, versioned artifact the robot
/// wants present on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Logical name, unique within a config. User-facing references
    /// (`${packages.<name>}`) and ml-model legacy symlinks use it.
    pub name: String,
    /// Globally unique identifier in the catalog, e.g. `org/model`.
    pub package_id: String,
    /// Immutable version label.
    pub version: String,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    /// When set, the package is synthetic: sourced from this path on disk
    /// instead of the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// Error type of [`PackageConfig::validate`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum InvalidPackageError {
    #[display("Package {name:?} has an empty {field} field")]
    EmptyField {
        name: String,
        field: &'static str,
    },
    #[display("Package {name:?} has a malformed id {package_id:?}")]
    MalformedId { name: String, package_id: String },
}

impl PackageConfig {
    /// Whether this package is sourced from a local path instead of the catalog.
    pub fn is_synthetic(&self) -> bool {
        self.local_path.is_some()
    }

    /// Reject configs that cannot be laid out on disk.
    ///
    /// The id participates in the on-disk directory name, so ids that could
    /// navigate the filesystem are refused outright.
    pub fn validate(&self) -> Result<(), InvalidPackageError> {
        let empty = |field| InvalidPackageError::EmptyField { name: self.name.clone(), field };
        if self.name.is_empty() {
            return Err(empty("name"));
        }
        if self.package_id.is_empty() {
            return Err(empty("package_id"));
        }
        if self.version.is_empty() {
            return Err(empty("version"));
        }
        let id = self.package_id.as_str();
        if id.starts_with('/') || id.split('/').any(|segment| segment == ".." || segment == ".") {
            return Err(InvalidPackageError::MalformedId {
                name: self.name.clone(),
                package_id: self.package_id.clone(),
            });
        }
        Ok(())
    }
}
