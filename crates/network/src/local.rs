use crate::{Crc32cHasher, Downloaded, GZIP_CONTENT_TYPE};
use derive_more::{Display, Error};
use miette::Diagnostic;
use packsync_config::MAX_PACKAGE_SIZE;
use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

/// Error type of [`CopyLocalArchive`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum CopyLocalError {
    #[display("Failed to read local archive at {path:?}: {error}")]
    ReadSource {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to write local archive copy to {path:?}: {error}")]
    WriteDestination {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Local archive at {path:?} exceeds the {limit}-byte package size limit")]
    TooLarge { path: PathBuf, limit: u64 },
}

/// Transport variant for synthetic packages: the "download" is a copy of a
/// tarball that is already on the robot's disk.
///
/// The filename extension filter upstream guarantees the source is a gzipped
/// tar, so the content type is reported as such unconditionally.
#[must_use]
pub struct CopyLocalArchive<'a> {
    pub source: &'a Path,
    pub destination: &'a Path,
}

impl<'a> CopyLocalArchive<'a> {
    /// Execute the subroutine.
    pub fn run(self) -> Result<Downloaded, CopyLocalError> {
        let CopyLocalArchive { source, destination } = self;
        let read_error =
            |error| CopyLocalError::ReadSource { path: source.to_path_buf(), error };
        let write_error =
            |error| CopyLocalError::WriteDestination { path: destination.to_path_buf(), error };

        let mut from = File::open(source).map_err(read_error)?;
        let mut to = File::create(destination).map_err(write_error)?;
        let mut hasher = Crc32cHasher::new();
        let mut copied: u64 = 0;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = from.read(&mut buffer).map_err(read_error)?;
            if read == 0 {
                break;
            }
            copied += read as u64;
            if copied > MAX_PACKAGE_SIZE {
                drop(to);
                let _ = std::fs::remove_file(destination);
                return Err(CopyLocalError::TooLarge {
                    path: source.to_path_buf(),
                    limit: MAX_PACKAGE_SIZE,
                });
            }
            hasher.update(&buffer[..read]);
            to.write_all(&buffer[..read]).map_err(write_error)?;
        }
        to.sync_all().map_err(write_error)?;

        Ok(Downloaded {
            checksum: hasher.to_base64(),
            content_type: GZIP_CONTENT_TYPE.to_string(),
        })
    }
}
