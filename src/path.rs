//! Filesystem path normalization.
//!
//! Configured directories (mount root, socket path) are carried as
//! [`AbsolutePath`] so every join below them starts from a clean, anchored
//! prefix.

use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// A path that is guaranteed to be absolute and lexically normalized.
///
/// No `.` or `..` components survive construction. Existence on disk is not
/// checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "PathBuf", into = "PathBuf")]
pub struct AbsolutePath(PathBuf);

impl AbsolutePath {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(path.as_ref().absolute())
    }
    pub fn into_inner(self) -> PathBuf {
        self.0
    }
    pub fn as_path(&self) -> &Path {
        &self.0
    }
    pub fn parent(&self) -> Option<AbsolutePath> {
        self.0.parent().map(AbsolutePath::new)
    }
    pub fn join(&self, path: impl AsRef<Path>) -> Self {
        Self::new(self.0.join(path))
    }
}

trait PathExt {
    /// Resolves `.` and `..` lexically. Symlinks are not followed.
    fn clean(&self) -> PathBuf;
    /// Anchors the path to the current directory, then cleans it.
    fn absolute(&self) -> PathBuf;
}

impl PathExt for Path {
    fn clean(&self) -> PathBuf {
        let mut components = self.components().peekable();
        let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
            components.next();
            PathBuf::from(c.as_os_str())
        } else {
            PathBuf::new()
        };

        for component in components {
            match component {
                Component::Prefix(..) => {}
                Component::RootDir => ret.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    ret.pop();
                }
                Component::Normal(c) => ret.push(c),
            }
        }
        ret
    }

    fn absolute(&self) -> PathBuf {
        std::path::absolute(self)
            .map(|p| p.clean())
            .unwrap_or_else(|_| self.clean())
    }
}

impl From<PathBuf> for AbsolutePath {
    fn from(p: PathBuf) -> Self {
        Self::new(p)
    }
}

impl From<&Path> for AbsolutePath {
    fn from(p: &Path) -> Self {
        Self::new(p)
    }
}

impl From<AbsolutePath> for PathBuf {
    fn from(p: AbsolutePath) -> Self {
        p.0
    }
}

impl Deref for AbsolutePath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for AbsolutePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.display().fmt(f)
    }
}

impl FromStr for AbsolutePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("path cannot be empty".to_string());
        }
        Ok(AbsolutePath::new(s))
    }
}

impl PartialEq<Path> for AbsolutePath {
    fn eq(&self, other: &Path) -> bool {
        self.0 == other
    }
}

impl PartialEq<PathBuf> for AbsolutePath {
    fn eq(&self, other: &PathBuf) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_clean() {
        assert_eq!(Path::new("a/./b/./c").clean(), PathBuf::from("a/b/c"));
        assert_eq!(Path::new("/var/lib/nfsvol/").clean(), PathBuf::from("/var/lib/nfsvol"));
    }

    #[test]
    fn test_parent_dir_absolute() {
        assert_eq!(Path::new("/a/b/../c").clean(), PathBuf::from("/a/c"));
        assert_eq!(Path::new("/..").clean(), PathBuf::from("/"));
    }

    #[test]
    fn test_join_stays_clean() {
        let root = AbsolutePath::new("/var/lib/nfsvol/mounts");
        assert_eq!(
            root.join("vol/../other"),
            PathBuf::from("/var/lib/nfsvol/mounts/other")
        );
    }

    #[test]
    fn test_relative_is_anchored() {
        let p = AbsolutePath::new("mounts/../state");
        assert!(p.is_absolute());
        assert!(!p.to_string().contains(".."));
    }

    #[test]
    fn test_from_str_rejects_empty() {
        assert!("".parse::<AbsolutePath>().is_err());
        assert_eq!(
            "/run/nfsvol.sock".parse::<AbsolutePath>().unwrap(),
            PathBuf::from("/run/nfsvol.sock")
        );
    }
}
