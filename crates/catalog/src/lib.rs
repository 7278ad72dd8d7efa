mod error;
mod memory;
mod package;

pub use error::*;
pub use memory::*;
pub use package::*;

use async_trait::async_trait;

/// Client of the package catalog service.
///
/// The engine only ever asks the catalog one question: where do the bytes of
/// `(package_id, version)` live. Implementations wrap the actual RPC stub;
/// [`MemoryCatalog`] answers from a map for tests and offline tooling.
#[async_trait]
pub trait PackageCatalog: Send + Sync {
    async fn get_package(
        &self,
        request: GetPackageRequest,
    ) -> Result<ResolvedPackage, CatalogError>;
}
