use crate::{PackageConfig, PackageType};
use derive_more::{Display, Error};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

/// Where a module's executable comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Local,
    Registry,
}

/// A desired executable module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    /// Path of the module binary, or of a local tarball that contains it.
    pub exe_path: PathBuf,
}

/// Error type of [`Module::synthetic_package`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum SyntheticPackageError {
    #[display("Module {name:?} does not name a local tarball: {exe_path:?}")]
    NotATarball { name: String, exe_path: PathBuf },
    #[display("Failed to stat tarball {exe_path:?} of module {name:?}: {error}")]
    Stat {
        name: String,
        exe_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

fn is_tarball_path(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

impl Module {
    /// Whether this module is distributed as a tarball on the local filesystem.
    pub fn is_local_tarball(&self) -> bool {
        self.module_type == ModuleType::Local && is_tarball_path(&self.exe_path)
    }

    /// Wrap a local tarball in a synthetic [`PackageConfig`].
    ///
    /// The version is derived from the tarball's mtime and length, so
    /// rewriting the tarball yields a new version while an unchanged file
    /// resyncs to the same one.
    pub fn synthetic_package(&self) -> Result<PackageConfig, SyntheticPackageError> {
        if !self.is_local_tarball() {
            return Err(SyntheticPackageError::NotATarball {
                name: self.name.clone(),
                exe_path: self.exe_path.clone(),
            });
        }
        let metadata = std::fs::metadata(&self.exe_path).map_err(|error| {
            SyntheticPackageError::Stat {
                name: self.name.clone(),
                exe_path: self.exe_path.clone(),
                error,
            }
        })?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Ok(PackageConfig {
            name: self.name.clone(),
            package_id: format!("local-module/{}", self.name),
            version: format!("{mtime}-{len}", len = metadata.len()),
            package_type: PackageType::Module,
            local_path: Some(self.exe_path.clone()),
        })
    }
}
