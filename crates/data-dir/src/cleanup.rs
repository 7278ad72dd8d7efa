use crate::{DataDir, FIRST_RUN_MARKER_SUFFIX, STATUS_FILE_SUFFIX};
use derive_more::{Display, Error};
use miette::Diagnostic;
use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
};

/// A single entry the cleanup pass could not inspect or remove.
#[derive(Debug, Display, Error, Diagnostic)]
#[display("Failed to clean up {path:?}: {error}")]
pub struct CleanupEntryError {
    pub path: PathBuf,
    #[error(source)]
    pub error: io::Error,
}

/// Error type of [`DataDir::cleanup`]. Carries every failed entry, not just
/// the first, so one stubborn file does not hide the rest.
#[derive(Debug, Display, Error, Diagnostic)]
#[display("Failed to clean up {} entries under the package data directory", failures.len())]
pub struct CleanupError {
    #[related]
    pub failures: Vec<CleanupEntryError>,
}

/// Whether `path` is a sidecar (`.status.json` / first-run marker) annotating
/// a tree in `expected`.
fn is_sidecar_of_expected(path: &Path, expected: &HashSet<PathBuf>) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return false;
    };
    [STATUS_FILE_SUFFIX, FIRST_RUN_MARKER_SUFFIX].iter().any(|suffix| {
        name.strip_suffix(suffix)
            .is_some_and(|tree_name| expected.contains(&parent.join(tree_name)))
    })
}

impl DataDir {
    /// Delete everything under `data/` that is not in `expected`.
    ///
    /// `expected` holds the absolute tree directories of every managed
    /// package. Their status sidecars and first-run markers are preserved
    /// with them; type buckets left empty are removed.
    pub fn cleanup(&self, expected: &HashSet<PathBuf>) -> Result<(), CleanupError> {
        let data = self.data();
        let mut failures = Vec::new();

        match fs::read_dir(&data) {
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => failures.push(CleanupEntryError { path: data, error }),
            Ok(buckets) => {
                for bucket in buckets.flatten() {
                    cleanup_bucket(&bucket.path(), expected, &mut failures);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }
}

fn remove_entry(path: &Path, is_dir: bool, failures: &mut Vec<CleanupEntryError>) {
    tracing::debug!(target: "packsync::cleanup", path = %path.display(), "Removing stale entry");
    let result = if is_dir { fs::remove_dir_all(path) } else { fs::remove_file(path) };
    if let Err(error) = result {
        failures.push(CleanupEntryError { path: path.to_path_buf(), error });
    }
}

fn cleanup_bucket(bucket: &Path, expected: &HashSet<PathBuf>, failures: &mut Vec<CleanupEntryError>) {
    if !bucket.is_dir() {
        // stray file directly under data/; keep only status sidecars, they
        // may belong to a legacy layout still being migrated
        let is_status = bucket
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(STATUS_FILE_SUFFIX));
        if !is_status {
            remove_entry(bucket, false, failures);
        }
        return;
    }

    let entries = match fs::read_dir(bucket) {
        Ok(entries) => entries,
        Err(error) => {
            failures.push(CleanupEntryError { path: bucket.to_path_buf(), error });
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if expected.contains(&path) || is_sidecar_of_expected(&path, expected) {
            continue;
        }
        remove_entry(&path, path.is_dir(), failures);
    }

    // drop the bucket itself once nothing is left in it
    match fs::read_dir(bucket) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                if let Err(error) = fs::remove_dir(bucket) {
                    failures.push(CleanupEntryError { path: bucket.to_path_buf(), error });
                }
            }
        }
        Err(error) => failures.push(CleanupEntryError { path: bucket.to_path_buf(), error }),
    }
}
