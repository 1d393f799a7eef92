use crate::{Fileman, FilemanError, StoredFile};
use std::path::{Component, Path, PathBuf};

/// A reference to a persisted file, either by its storage-relative path or by
/// the descriptor returned from [Fileman::save].
#[derive(Debug, Clone, Copy)]
pub enum FileRef<'a> {
    ByPath(&'a str),
    ByDescriptor(&'a StoredFile),
}

impl<'a> FileRef<'a> {
    /// The storage-relative path being referenced.
    pub fn path(&self) -> &'a str {
        match self {
            | Self::ByPath(path) => path,
            | Self::ByDescriptor(file) => &file.path,
        }
    }
}

impl<'a> From<&'a str> for FileRef<'a> {
    fn from(path: &'a str) -> Self {
        Self::ByPath(path)
    }
}

impl<'a> From<&'a String> for FileRef<'a> {
    fn from(path: &'a String) -> Self {
        Self::ByPath(path)
    }
}

impl<'a> From<&'a StoredFile> for FileRef<'a> {
    fn from(file: &'a StoredFile) -> Self {
        Self::ByDescriptor(file)
    }
}

impl Fileman {
    /// Resolves a storage-relative path to its absolute location inside the
    /// storage directory.
    ///
    /// Leading separators are ignored, `.` and `..` segments are collapsed and
    /// any path climbing above the storage root is rejected.
    pub fn resolve<'a>(&self, file: impl Into<FileRef<'a>>) -> Result<PathBuf, FilemanError> {
        join_within(self.stordir(), file.into().path())
    }
}

/// Joins `relative` onto `root`, refusing results outside of `root`.
pub(crate) fn join_within(root: &Path, relative: &str) -> Result<PathBuf, FilemanError> {
    let mut segments = Vec::new();

    for component in Path::new(relative).components() {
        match component {
            | Component::Normal(segment) => segments.push(segment),
            | Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(FilemanError::PathEscape { path: relative.to_string() });
                }
            }
            | Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    Ok(segments.into_iter().fold(root.to_path_buf(), |path, segment| path.join(segment)))
}

/// Lexically normalizes `path` without touching the file system.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            | Component::CurDir => {}
            | Component::ParentDir => match normalized.components().next_back() {
                | Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                | Some(Component::RootDir | Component::Prefix(_)) => {}
                | _ => normalized.push(".."),
            },
            | other => normalized.push(other),
        }
    }

    normalized
}

/// Converts `path` into a `/` separated key relative to `root`.
pub(crate) fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Option<Vec<&str>> = relative
        .components()
        .map(|component| match component {
            | Component::Normal(segment) => segment.to_str(),
            | _ => None,
        })
        .collect();
    segments.map(|segments| segments.join("/"))
}
