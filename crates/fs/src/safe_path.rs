use derive_more::{Display, Error};
use miette::Diagnostic;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR};

/// Error type of [`safe_join`] and [`safe_link`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum UnsafePathError {
    #[display("Path {child:?} escapes parent directory {parent:?}")]
    EscapesParent { parent: PathBuf, child: PathBuf },
    #[display("Link target {link:?} must not be absolute")]
    AbsoluteLink { link: PathBuf },
}

/// Join `child` onto `parent`, refusing results that escape `parent`.
///
/// `..` and `.` components are resolved lexically before the prefix check, so
/// a crafted name such as `a/../../etc/passwd` is rejected rather than written.
pub fn safe_join(parent: &Path, child: impl AsRef<Path>) -> Result<PathBuf, UnsafePathError> {
    let child = child.as_ref();
    let joined = normalize_lexically(&parent.join(child));
    let prefix = format!("{}{}", parent.display(), MAIN_SEPARATOR_STR);
    if !joined.starts_with(parent) || !format!("{}", joined.display()).starts_with(&prefix) {
        return Err(UnsafePathError::EscapesParent {
            parent: parent.to_path_buf(),
            child: child.to_path_buf(),
        });
    }
    Ok(joined)
}

/// Validate a link target found inside an archive.
///
/// The target must be relative and must not point outside `parent` when
/// resolved against it. Returns the target unchanged so links are stored
/// relative.
pub fn safe_link(parent: &Path, link: impl AsRef<Path>) -> Result<PathBuf, UnsafePathError> {
    let link = link.as_ref();
    if link.is_absolute() {
        return Err(UnsafePathError::AbsoluteLink { link: link.to_path_buf() });
    }
    safe_join(parent, link)?;
    Ok(link.to_path_buf())
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                normalized.push(component);
            }
            Component::ParentDir => {
                if matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
                    normalized.pop();
                } else {
                    normalized.push(component);
                }
            }
            Component::CurDir => {}
        }
    }
    normalized
}
