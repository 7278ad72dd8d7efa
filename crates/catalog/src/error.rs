use derive_more::{Display, Error};
use miette::Diagnostic;

/// Error type of [`PackageCatalog`](crate::PackageCatalog) calls.
#[derive(Debug, Display, Error, Diagnostic)]
pub enum CatalogError {
    #[display("Package {package_id}@{version} was not found in the catalog")]
    NotFound { package_id: String, version: String },
    #[display("Catalog request for {package_id}@{version} failed: {message}")]
    Rpc {
        package_id: String,
        version: String,
        message: String,
    },
}
