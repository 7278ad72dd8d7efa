use crate::{CatalogError, GetPackageRequest, PackageCatalog, ResolvedPackage};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

/// In-memory [`PackageCatalog`] backed by a `(package_id, version) → url` map.
///
/// Counts lookups so callers can assert how many RPCs a sync performed.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    urls: Mutex<HashMap<(String, String), String>>,
    lookups: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, package_id: &str, version: &str, url: &str) {
        self.urls
            .lock()
            .expect("memory catalog lock")
            .insert((package_id.to_string(), version.to_string()), url.to_string());
    }

    /// Number of `get_package` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageCatalog for MemoryCatalog {
    async fn get_package(
        &self,
        request: GetPackageRequest,
    ) -> Result<ResolvedPackage, CatalogError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let GetPackageRequest { package_id, version, package_type, include_url } = request;
        let urls = self.urls.lock().expect("memory catalog lock");
        let url = urls.get(&(package_id.clone(), version.clone())).ok_or_else(|| {
            CatalogError::NotFound { package_id: package_id.clone(), version: version.clone() }
        })?;
        Ok(ResolvedPackage {
            package_id,
            version,
            package_type,
            url: if include_url { url.clone() } else { String::new() },
        })
    }
}
