use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Marker file at the root of every Godot project.
pub const PROJECT_FILE: &str = "project.godot";

/// Opaque reference to the host's startup project.
///
/// The host decides what the string means; a [`ProjectLocator`] turns it into
/// a directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectHandle(String);

impl ProjectHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for ProjectHandle {
    fn from(path: &Path) -> Self {
        Self(path.display().to_string())
    }
}

/// Maps a project handle to a directory on disk.
///
/// Returning `None` means the host does not know the project.
pub trait ProjectLocator: Send + Sync {
    fn locate(&self, handle: &ProjectHandle) -> Option<PathBuf>;
}

impl<F> ProjectLocator for F
where
    F: Fn(&ProjectHandle) -> Option<PathBuf> + Send + Sync,
{
    fn locate(&self, handle: &ProjectHandle) -> Option<PathBuf> {
        self(handle)
    }
}

impl<L: ProjectLocator + ?Sized> ProjectLocator for Arc<L> {
    fn locate(&self, handle: &ProjectHandle) -> Option<PathBuf> {
        (**self).locate(handle)
    }
}

/// Treats the handle itself as a filesystem path.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLocator;

impl ProjectLocator for PathLocator {
    fn locate(&self, handle: &ProjectHandle) -> Option<PathBuf> {
        let path = PathBuf::from(handle.as_str());
        if path.as_os_str().is_empty() {
            return None;
        }
        Some(path)
    }
}

/// Walk `start` and its ancestors for the directory holding `project.godot`.
///
/// `start` may also point at a file inside the project.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let start = if start.is_file() { start.parent()? } else { start };
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_FILE).is_file())
        .map(Path::to_path_buf)
}
