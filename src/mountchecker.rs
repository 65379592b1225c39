//! Live mount enumeration.
//!
//! [`ProcMountChecker`] reads the kernel mount table. Platforms without one
//! use [`StatMountChecker`], which can only tell whether a path exists.

use crate::fs::{FileSystem, LineReader, OsFileSystem};
use regex::Regex;
use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const PROC_MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Error)]
pub enum MountCheckError {
    #[error("failed to open mount table {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read mount table {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to close mount table {path:?}: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid mount pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to stat {path:?}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub trait MountChecker: Send + Sync {
    /// Whether `path` is itself a mountpoint. Prefix matches do not count.
    fn exists(&self, path: &Path) -> Result<bool, MountCheckError>;

    /// Mountpoints matching the regular expression `pattern`.
    fn list(&self, pattern: &str) -> Result<Vec<PathBuf>, MountCheckError>;
}

/// Picks the checker for the running platform.
pub fn platform_checker(fs: Arc<dyn FileSystem>) -> Arc<dyn MountChecker> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcMountChecker::new(fs))
    } else {
        Arc::new(StatMountChecker::new(fs))
    }
}

pub struct ProcMountChecker {
    fs: Arc<dyn FileSystem>,
    table: PathBuf,
}

impl ProcMountChecker {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self::with_table(fs, PROC_MOUNTS)
    }

    pub fn with_table(fs: Arc<dyn FileSystem>, table: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            table: table.into(),
        }
    }

    /// Collects every mountpoint in the table accepted by `keep`.
    ///
    /// The table is always closed. A read error wins over a close error.
    fn scan(&self, mut keep: impl FnMut(&Path) -> bool) -> Result<Vec<PathBuf>, MountCheckError> {
        let mut reader = self
            .fs
            .open(&self.table)
            .map_err(|source| MountCheckError::Open {
                path: self.table.clone(),
                source,
            })?;

        let read = read_mountpoints(reader.as_mut(), &mut keep);
        let closed = reader.close();

        let found = read.map_err(|source| MountCheckError::Read {
            path: self.table.clone(),
            source,
        })?;
        closed.map_err(|source| MountCheckError::Close {
            path: self.table.clone(),
            source,
        })?;
        Ok(found)
    }
}

fn read_mountpoints(
    reader: &mut dyn LineReader,
    keep: &mut impl FnMut(&Path) -> bool,
) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(found);
        }
        let Some(field) = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|f| !f.is_empty())
            .nth(1)
        else {
            continue;
        };
        let mountpoint = PathBuf::from(OsString::from_vec(unescape(field)));
        if keep(mountpoint.as_path()) {
            found.push(mountpoint);
        }
    }
}

/// Decodes the octal escapes the kernel uses for whitespace and backslashes.
/// Every other byte is passed through untouched.
fn unescape(field: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;
    while i < field.len() {
        if field[i] == b'\\' {
            if let Some(byte) = field.get(i + 1..i + 4).and_then(octal) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(field[i]);
        i += 1;
    }
    out
}

fn octal(digits: &[u8]) -> Option<u8> {
    let value = digits.iter().try_fold(0u16, |acc, &d| match d {
        b'0'..=b'7' => Some(acc * 8 + u16::from(d - b'0')),
        _ => None,
    })?;
    u8::try_from(value).ok()
}

impl MountChecker for ProcMountChecker {
    fn exists(&self, path: &Path) -> Result<bool, MountCheckError> {
        let found = self.scan(|mountpoint| mountpoint == path)?;
        Ok(!found.is_empty())
    }

    fn list(&self, pattern: &str) -> Result<Vec<PathBuf>, MountCheckError> {
        let pattern = Regex::new(pattern)?;
        self.scan(|mountpoint| pattern.is_match(&mountpoint.to_string_lossy()))
    }
}

/// Existence-only fallback.
pub struct StatMountChecker {
    fs: Arc<dyn FileSystem>,
}

impl StatMountChecker {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

impl MountChecker for StatMountChecker {
    fn exists(&self, path: &Path) -> Result<bool, MountCheckError> {
        match self.fs.stat(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(MountCheckError::Stat {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn list(&self, pattern: &str) -> Result<Vec<PathBuf>, MountCheckError> {
        Regex::new(pattern)?;
        Ok(Vec::new())
    }
}

impl Default for ProcMountChecker {
    fn default() -> Self {
        Self::new(Arc::new(OsFileSystem))
    }
}
