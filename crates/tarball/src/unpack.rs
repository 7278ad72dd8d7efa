use derive_more::{Display, Error};
use flate2::read::GzDecoder;
use miette::Diagnostic;
use packsync_config::MAX_PACKAGE_SIZE;
use packsync_fs::{safe_join, safe_link, unpacked_file_mode, UnsafePathError};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
};
use tar::EntryType;
use tokio_util::sync::CancellationToken;

/// Error type of [`UnpackArchive`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum TarballError {
    #[display("Failed to open archive at {archive:?}: {error}")]
    OpenArchive {
        archive: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to read an entry of archive {archive:?}: {error}")]
    ReadEntry {
        archive: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Archive entry refused: {error}")]
    UnsafeEntryPath {
        #[error(source)]
        error: UnsafePathError,
    },
    #[display("Failed to create directory at {path:?}: {error}")]
    CreateDir {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to write file at {path:?}: {error}")]
    WriteFile {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to create hard link at {path:?} to {target:?}: {error}")]
    HardLink {
        path: PathBuf,
        target: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to create symlink at {path:?} to {target:?}: {error}")]
    Symlink {
        path: PathBuf,
        target: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Unpacking was cancelled")]
    Cancelled,
}

/// Stream a gzip-compressed tar archive into `destination`.
///
/// `destination` is expected to be absent or empty; the caller owns staging
/// and the atomic rename into the final location. Entry paths and link
/// targets are validated against `destination`, so no entry of an
/// attacker-chosen archive can land outside it. Hard links and symlinks are
/// deferred to a second pass so their targets exist when they are created.
#[must_use]
pub struct UnpackArchive<'a> {
    pub archive: &'a Path,
    pub destination: &'a Path,
    pub cancel: &'a CancellationToken,
}

impl<'a> UnpackArchive<'a> {
    /// Execute the subroutine.
    pub fn run(self) -> Result<(), TarballError> {
        let UnpackArchive { archive, destination, cancel } = self;

        tracing::debug!(
            target: "packsync::tarball",
            archive = %archive.display(),
            destination = %destination.display(),
            "Unpacking archive",
        );

        let open = |error| TarballError::OpenArchive { archive: archive.to_path_buf(), error };
        let read = |error| TarballError::ReadEntry { archive: archive.to_path_buf(), error };
        let file = File::open(archive).map_err(open)?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));

        fs::create_dir_all(destination)
            .map_err(|error| TarballError::CreateDir { path: destination.to_path_buf(), error })?;

        // links are created after all regular files so their targets exist
        let mut hard_links: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut symlinks: Vec<(PathBuf, PathBuf)> = Vec::new();

        for entry in tar.entries().map_err(read)? {
            if cancel.is_cancelled() {
                return Err(TarballError::Cancelled);
            }
            let mut entry = entry.map_err(read)?;
            let name = entry.path().map_err(read)?.into_owned();
            if name.as_os_str().is_empty() || name == Path::new(".") || name == Path::new("./") {
                continue;
            }
            let path = checked_join(destination, &name)?;

            match entry.header().entry_type() {
                EntryType::Directory => {
                    fs::create_dir_all(&path)
                        .map_err(|error| TarballError::CreateDir { path: path.clone(), error })?;
                    set_permissions(&path, entry.header().mode().map_err(read)?)
                        .map_err(|error| TarballError::CreateDir { path: path.clone(), error })?;
                }
                EntryType::Regular => {
                    let mode = entry.header().mode().map_err(read)?;
                    write_entry_file(&path, &mut entry, mode)?;
                }
                EntryType::Link => {
                    let target = link_name(&entry).map_err(read)?;
                    hard_links.push((path, checked_join(destination, &target)?));
                }
                EntryType::Symlink => {
                    let target = link_name(&entry).map_err(read)?;
                    let target = safe_link(destination, &target)
                        .map_err(|error| TarballError::UnsafeEntryPath { error })?;
                    symlinks.push((path, target));
                }
                // character/block devices, fifos, pax extensions and the like
                _ => {}
            }
        }

        for (path, target) in hard_links {
            if cancel.is_cancelled() {
                return Err(TarballError::Cancelled);
            }
            fs::hard_link(&target, &path)
                .map_err(|error| TarballError::HardLink { path, target, error })?;
        }
        for (path, target) in symlinks {
            if cancel.is_cancelled() {
                return Err(TarballError::Cancelled);
            }
            symlink_any(&target, &path)
                .map_err(|error| TarballError::Symlink { path, target, error })?;
        }

        Ok(())
    }
}

fn checked_join(destination: &Path, name: &Path) -> Result<PathBuf, TarballError> {
    safe_join(destination, name).map_err(|error| TarballError::UnsafeEntryPath { error })
}

fn link_name<R: Read>(entry: &tar::Entry<R>) -> io::Result<PathBuf> {
    entry
        .link_name()?
        .map(|name| name.into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "link entry without a target"))
}

fn write_entry_file<R: Read>(
    path: &Path,
    entry: &mut tar::Entry<R>,
    header_mode: u32,
) -> Result<(), TarballError> {
    let write = |error| TarballError::WriteFile { path: path.to_path_buf(), error };

    // tolerate archives that carry no explicit directory entries
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| TarballError::CreateDir { path: parent.to_path_buf(), error })?;
    }

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(unpacked_file_mode(header_mode));
    }
    #[cfg(not(unix))]
    let _ = header_mode;

    let mut file = options.open(path).map_err(write)?;
    // a short read is fine, anything beyond the cap is not written
    io::copy(&mut entry.take(MAX_PACKAGE_SIZE), &mut file).map_err(write)?;
    file.sync_all().map_err(write)?;
    Ok(())
}

#[cfg_attr(not(unix), allow(unused))]
fn set_permissions(path: &Path, header_mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(unpacked_file_mode(header_mode)))?;
    }
    Ok(())
}

fn symlink_any(target: &Path, path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    return std::os::unix::fs::symlink(target, path);
    #[cfg(windows)]
    return std::os::windows::fs::symlink_file(target, path);
}
