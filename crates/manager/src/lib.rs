mod cloud;
mod deferred;
mod error;
mod install;
mod local;
mod managed;

pub use cloud::*;
pub use deferred::*;
pub use error::*;
pub use install::*;
pub use local::*;
pub use managed::*;

#[cfg(test)]
pub(crate) mod test_support;

use async_trait::async_trait;
use packsync_config::{Module, PackageConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// One sync backend: something that can bring the robot's package tree in
/// agreement with a desired set and answer where a package lives.
///
/// The reconfiguration driver calls `sync` then `cleanup` from a single
/// thread; implementations serialise both behind one write lock and answer
/// `package_path` under the shared side of it.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Make the on-disk tree match `packages` (plus whatever `modules`
    /// imply), downloading and unpacking whatever changed.
    async fn sync(
        &self,
        cancel: &CancellationToken,
        packages: &[PackageConfig],
        modules: &[Module],
    ) -> Result<(), SyncError>;

    /// Remove everything on disk that the most recent `sync` does not manage.
    async fn cleanup(&self, cancel: &CancellationToken) -> Result<(), SyncError>;

    /// Absolute path of the extracted tree of the package named `name`.
    async fn package_path(&self, name: &str) -> Result<PathBuf, PackagePathError>;

    /// Release resources held by the backend.
    async fn close(&self) -> Result<(), SyncError>;
}
