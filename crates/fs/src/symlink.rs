use derive_more::{Display, Error};
use miette::Diagnostic;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Create a symlink to a directory.
///
/// The `link` path will be a symbolic link pointing to `original`.
pub fn symlink_dir(original: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    return std::os::unix::fs::symlink(original, link);
    #[cfg(windows)]
    return junction::create(original, link); // junctions instead of symlinks because symlinks may require elevated privileges.
}

/// Error type of [`link_file`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum LinkFileError {
    #[display("Failed to inspect existing link at {link_path:?}: {error}")]
    ReadLink {
        link_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to remove existing entry at {link_path:?}: {error}")]
    RemoveExisting {
        link_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to create symlink at {link_path:?} to {target:?}: {error}")]
    CreateSymlink {
        target: PathBuf,
        link_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

/// Create a symlink at `link_path` pointing to `target`, idempotently.
///
/// * If `link_path` is already a symlink whose target equals `target`, nothing happens.
/// * If `link_path` exists as anything else, it is removed first.
pub fn link_file(target: &Path, link_path: &Path) -> Result<(), LinkFileError> {
    match fs::symlink_metadata(link_path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                let current = fs::read_link(link_path).map_err(|error| {
                    LinkFileError::ReadLink { link_path: link_path.to_path_buf(), error }
                })?;
                if current == target {
                    return Ok(());
                }
            }
            fs::remove_file(link_path).map_err(|error| LinkFileError::RemoveExisting {
                link_path: link_path.to_path_buf(),
                error,
            })?;
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(LinkFileError::ReadLink { link_path: link_path.to_path_buf(), error })
        }
    }

    symlink_dir(target, link_path).map_err(|error| LinkFileError::CreateSymlink {
        target: target.to_path_buf(),
        link_path: link_path.to_path_buf(),
        error,
    })
}
