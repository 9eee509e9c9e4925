//! Path Resolver
//!
//! Every filesystem mutation in the engine goes through [`CanonicalPath`]. Raw
//! strings and structured paths are normalized here once, so later stages never
//! have to ask "what kind of path is this".
//!
//! # Normalization
//!
//! - Relative paths are made absolute against the current directory
//! - `.` components are dropped, `..` pops one component
//! - Symlinks are **not** resolved (a link path must stay the link path)
//!
//! Normalization is purely lexical, so canonicalizing an already canonical
//! path returns an equal value.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Input accepted by [`canonicalize`].
#[derive(Debug, Clone)]
pub enum PathInput {
    /// A user-supplied string (CLI argument, config value)
    Raw(String),
    /// A structured path from the standard library
    Path(PathBuf),
    /// A path that already went through the resolver
    Canonical(CanonicalPath),
}

impl From<&str> for PathInput {
    fn from(value: &str) -> Self {
        Self::Raw(value.to_string())
    }
}

impl From<String> for PathInput {
    fn from(value: String) -> Self {
        Self::Raw(value)
    }
}

impl From<&Path> for PathInput {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<PathBuf> for PathInput {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<CanonicalPath> for PathInput {
    fn from(value: CanonicalPath) -> Self {
        Self::Canonical(value)
    }
}

impl From<&CanonicalPath> for PathInput {
    fn from(value: &CanonicalPath) -> Self {
        Self::Canonical(value.clone())
    }
}

/// Absolute, lexically normalized path.
///
/// The only path type accepted by the planner, backup manager and execution
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath(PathBuf);

/// Normalize any supported path input into a [`CanonicalPath`].
///
/// # Errors
///
/// Returns `MigrationError::PathType` when the input is empty or contains a
/// NUL byte, or when the current directory cannot be determined for a
/// relative input.
pub fn canonicalize(input: impl Into<PathInput>) -> Result<CanonicalPath> {
    let path = match input.into() {
        PathInput::Canonical(path) => return Ok(path),
        PathInput::Raw(raw) => {
            check_usable(&raw)?;
            PathBuf::from(raw)
        }
        PathInput::Path(path) => {
            check_usable(&path.to_string_lossy())?;
            path
        }
    };

    let absolute = if path.is_absolute() {
        path
    } else {
        let cwd = std::env::current_dir().map_err(|e| {
            MigrationError::PathType(format!("cannot resolve relative path {:?}: {}", path, e))
        })?;
        cwd.join(path)
    };

    Ok(CanonicalPath(normalize_lexically(&absolute)))
}

fn check_usable(raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(MigrationError::PathType("path is empty".to_string()));
    }
    if raw.contains('\0') {
        return Err(MigrationError::PathType(format!(
            "path contains a NUL byte: {:?}",
            raw
        )));
    }
    Ok(())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // pop() never removes the root
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

impl CanonicalPath {
    /// Borrow the underlying path
    #[inline]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Consume into the underlying `PathBuf`
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// True if the path exists, following symlinks
    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    /// True if anything occupies the path, including a dangling symlink
    pub fn is_occupied(&self) -> bool {
        self.0.symlink_metadata().is_ok()
    }

    /// True if the path is a directory, following symlinks
    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    /// True if the path itself is a symlink
    pub fn is_symlink(&self) -> bool {
        self.0.is_symlink()
    }

    /// Parent directory, or `None` at the filesystem root
    pub fn parent(&self) -> Option<CanonicalPath> {
        self.0.parent().map(|p| CanonicalPath(p.to_path_buf()))
    }

    /// Final component of the path
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    /// Append a relative component, keeping the result normalized
    pub fn join(&self, part: impl AsRef<Path>) -> CanonicalPath {
        CanonicalPath(normalize_lexically(&self.0.join(part)))
    }

    /// True if `self` is `other` or lies beneath it
    pub fn starts_with(&self, other: &CanonicalPath) -> bool {
        self.0.starts_with(&other.0)
    }

    /// Target of the symlink at this path
    pub fn read_link(&self) -> Result<PathBuf> {
        std::fs::read_link(&self.0).map_err(|e| MigrationError::from_io(&self.0, e))
    }

    /// True if this path is a symlink whose target is exactly `source`
    pub fn links_to(&self, source: &CanonicalPath) -> bool {
        self.is_symlink()
            && std::fs::read_link(&self.0)
                .map(|target| target == source.0)
                .unwrap_or(false)
    }

    /// Nearest ancestor (or self) that exists on disk
    pub fn nearest_existing(&self) -> Option<CanonicalPath> {
        self.0
            .ancestors()
            .find(|p| p.exists())
            .map(|p| CanonicalPath(p.to_path_buf()))
    }

    /// Create a symlink at `self` pointing at `source`.
    ///
    /// Both endpoints must be canonical. On Windows a directory link is
    /// created when `source` is a directory.
    ///
    /// # Errors
    ///
    /// - `SymlinkUnsupported` if the host or filesystem refuses link creation
    /// - `PermissionDenied` if the parent directory is not writable
    pub fn symlink_to(&self, source: &CanonicalPath) -> Result<()> {
        #[cfg(unix)]
        let outcome = std::os::unix::fs::symlink(&source.0, &self.0);

        #[cfg(windows)]
        let outcome = if source.is_dir() {
            std::os::windows::fs::symlink_dir(&source.0, &self.0)
        } else {
            std::os::windows::fs::symlink_file(&source.0, &self.0)
        };

        outcome.map_err(|e| self.map_symlink_error(source, e))
    }

    fn map_symlink_error(&self, source: &CanonicalPath, err: std::io::Error) -> MigrationError {
        // ERROR_PRIVILEGE_NOT_HELD
        let privilege_missing = cfg!(windows) && err.raw_os_error() == Some(1314);
        if privilege_missing || err.kind() == std::io::ErrorKind::Unsupported {
            MigrationError::SymlinkUnsupported {
                link: self.0.clone(),
                source_path: source.0.clone(),
                reason: err.to_string(),
            }
        } else {
            MigrationError::from_io(&self.0, err)
        }
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl Serialize for CanonicalPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CanonicalPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = PathBuf::deserialize(deserializer)?;
        canonicalize(raw).map_err(serde::de::Error::custom)
    }
}
