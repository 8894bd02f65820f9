use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};

/// A filesystem path that is provably confined beneath a fixed root.
///
/// The only ways to obtain one are [`RootedPath::new`] and
/// [`RootedPath::join_within_root`]; both resolve symlinks before accepting a
/// path, so every write that consumes a `RootedPath` stays under the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootedPath {
    root: PathBuf,
    path: PathBuf,
}

impl RootedPath {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(Error::invalid_input(format!(
                "rooted path root must be absolute: {}",
                root.display()
            )));
        }
        let root = resolve_with_missing_tail(&root)?;
        Ok(Self {
            path: root.clone(),
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subpath_from_root(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(&self.path)
    }

    /// Join `subpath` onto the current path and verify the fully-resolved
    /// result is still a descendant of the root. Symlinks in the already
    /// existing part of the path are followed; not-yet-existing tail
    /// components are resolved lexically from the deepest existing ancestor.
    pub fn join_within_root(&self, subpath: impl AsRef<Path>) -> Result<RootedPath> {
        let candidate = self.path.join(subpath.as_ref());
        let resolved = resolve_with_missing_tail(&candidate)?;
        if !resolved.starts_with(&self.root) {
            return Err(Error::new(
                ErrorKind::PathOutsideRoot,
                format!(
                    "path {} is outside {}, refusing to proceed",
                    candidate.display(),
                    self.root.display()
                ),
            )
            .with_solution(
                "Files outside the declared source/output directories are never accessed.",
            ));
        }
        Ok(Self {
            root: self.root.clone(),
            path: resolved,
        })
    }
}

impl std::fmt::Display for RootedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Resolve a path whose tail may not exist yet: canonicalize the deepest
/// existing ancestor, then apply the remaining components lexically.
pub(crate) fn resolve_with_missing_tail(path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    while fs::symlink_metadata(existing).is_err() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }

    let canonical = fs::canonicalize(existing).map_err(|source| {
        Error::invalid_input(format!(
            "failed to resolve path {}: {source}",
            existing.display()
        ))
    })?;

    let tail = path.strip_prefix(existing).unwrap_or(Path::new(""));
    let mut resolved = canonical;
    for component in tail.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => resolved.push(name),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(resolved)
}
