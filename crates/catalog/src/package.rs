use packsync_config::PackageType;
use serde::{Deserialize, Serialize};

/// Arguments of [`PackageCatalog::get_package`](crate::PackageCatalog::get_package).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPackageRequest {
    pub package_id: String,
    pub version: String,
    pub package_type: PackageType,
    /// Ask the catalog to mint a signed download URL.
    pub include_url: bool,
}

/// Catalog's answer: where and what the package is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub package_id: String,
    pub version: String,
    pub package_type: PackageType,
    /// Signed object-store URL. Empty when `include_url` was false.
    #[serde(default)]
    pub url: String,
}
