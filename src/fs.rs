//! Filesystem capability used by the driver and the mount checker.
//!
//! Everything that touches disk goes through [`FileSystem`] so the driver's
//! state handling can be exercised against an in-memory fake.

use std::fs::{DirBuilder, File};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// A line-oriented reader with an explicit close step.
///
/// Lines are raw bytes: mount tables carry paths, which need not be UTF-8.
pub trait LineReader: Send {
    /// Appends the next line (including its terminator) to `buf`.
    /// Returns `Ok(0)` at end of input.
    fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    fn close(self: Box<Self>) -> io::Result<()>;
}

pub trait FileSystem: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn LineReader>>;

    /// Succeeds if `path` exists.
    fn stat(&self, path: &Path) -> io::Result<()>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replaces the file at `path` with `data` in one step.
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Removes an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

struct FileLines(BufReader<File>);

impl LineReader for FileLines {
    fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.0.read_until(b'\n', buf)
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        // std reports no errors when a read-only handle is dropped.
        drop(self.0.into_inner());
        Ok(())
    }
}

impl FileSystem for OsFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn LineReader>> {
        let file = File::open(path)?;
        Ok(Box::new(FileLines(BufReader::new(file))))
    }

    fn stat(&self, path: &Path) -> io::Result<()> {
        std::fs::metadata(path).map(|_| ())
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no parent directory", path.display()),
            )
        })?;
        // Temp file in the same directory so the rename cannot cross devices.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(0o755).create(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_replaces_contents() {
        let tmp = assert_fs::TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        OsFileSystem.write(&path, b"{}").unwrap();
        OsFileSystem.write(&path, b"{\"a\":1}").unwrap();
        assert_eq!(OsFileSystem.read(&path).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_write_without_parent_dir_fails() {
        let tmp = assert_fs::TempDir::new().unwrap();
        let path = tmp.path().join("missing").join("state.json");
        assert!(OsFileSystem.write(&path, b"{}").is_err());
    }

    #[test]
    fn test_open_reads_lines_until_eof() {
        let tmp = assert_fs::TempDir::new().unwrap();
        let path = tmp.path().join("mounts");
        std::fs::write(&path, b"a b\nc\xe9 d\n").unwrap();

        let mut reader = OsFileSystem.open(&path).unwrap();
        let mut lines = Vec::new();
        loop {
            let mut line = Vec::new();
            if reader.read_line(&mut line).unwrap() == 0 {
                break;
            }
            lines.push(line);
        }
        reader.close().unwrap();
        assert_eq!(lines, vec![b"a b\n".to_vec(), b"c\xe9 d\n".to_vec()]);
    }

    #[test]
    fn test_stat_and_remove_dir() {
        let tmp = assert_fs::TempDir::new().unwrap();
        let dir = tmp.path().join("a/b");
        OsFileSystem.create_dir_all(&dir).unwrap();
        OsFileSystem.stat(&dir).unwrap();
        OsFileSystem.remove_dir(&dir).unwrap();
        let err = OsFileSystem.stat(&dir).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
