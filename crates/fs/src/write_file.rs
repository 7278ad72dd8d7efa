use derive_more::{Display, Error};
use miette::Diagnostic;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Error type of [`write_file`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum WriteFileError {
    #[display("Failed to create the parent directory at {parent_dir:?}: {error}")]
    CreateDir {
        parent_dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to create file at {file_path:?}: {error}")]
    CreateFile {
        file_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Failed to write to file at {file_path:?}: {error}")]
    WriteFile {
        file_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

/// Write `content` to `file_path`, truncating any existing content and
/// applying `mode` to newly-created files on unix.
///
/// Ancestor directories will be created if they don't already exist.
pub fn write_file(
    file_path: &Path,
    content: &[u8],
    #[cfg_attr(windows, allow(unused))] mode: Option<u32>,
) -> Result<(), WriteFileError> {
    let parent_dir = file_path.parent().unwrap();
    fs::create_dir_all(parent_dir).map_err(|error| WriteFileError::CreateDir {
        parent_dir: parent_dir.to_path_buf(),
        error,
    })?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }

    options
        .open(file_path)
        .map_err(|error| WriteFileError::CreateFile { file_path: file_path.to_path_buf(), error })?
        .write_all(content)
        .map_err(|error| WriteFileError::WriteFile { file_path: file_path.to_path_buf(), error })
}
