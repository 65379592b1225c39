#![allow(dead_code)]

use async_trait::async_trait;
use nfsvol::context::OpContext;
use nfsvol::fs::{FileSystem, LineReader};
use nfsvol::invoker::InvokeError;
use nfsvol::mountchecker::{MountCheckError, MountChecker};
use nfsvol::mounter::{MountError, Mounter, SafeError};
use nfsvol::path::AbsolutePath;
use nfsvol::volume::registry::{RegistryParts, VolumeRegistry};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ROOT: &str = "/var/lib/nfsvol/mounts";

pub fn state_path() -> PathBuf {
    Path::new(ROOT).join(nfsvol::volume::registry::STATE_FILE)
}

pub fn opts(source: &str) -> HashMap<String, String> {
    HashMap::from([("source".to_string(), source.to_string())])
}

/// In-memory filesystem with switchable failures.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    dirs: Mutex<HashSet<PathBuf>>,
    pub fail_writes: AtomicBool,
    pub writes: AtomicUsize,
    remove_dir_error: Mutex<Option<io::ErrorKind>>,
}

impl MemFs {
    pub fn seed(&self, path: impl Into<PathBuf>, data: &[u8]) {
        self.files.lock().unwrap().insert(path.into(), data.to_vec());
    }

    pub fn has_dir(&self, path: impl AsRef<Path>) -> bool {
        self.dirs.lock().unwrap().contains(path.as_ref())
    }

    pub fn fail_remove_dir(&self, kind: io::ErrorKind) {
        *self.remove_dir_error.lock().unwrap() = Some(kind);
    }

    /// The persisted volume table, if any was written.
    pub fn state(&self) -> Option<serde_json::Value> {
        let files = self.files.lock().unwrap();
        files
            .get(&state_path())
            .map(|data| serde_json::from_slice(data).unwrap())
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn LineReader>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a line source", path.display()),
        ))
    }

    fn stat(&self, path: &Path) -> io::Result<()> {
        if self.has_dir(path) || self.files.lock().unwrap().contains_key(path) {
            Ok(())
        } else {
            Err(io::ErrorKind::NotFound.into())
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("disk full"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.seed(path, data);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        for ancestor in path.ancestors() {
            dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        if let Some(kind) = *self.remove_dir_error.lock().unwrap() {
            return Err(kind.into());
        }
        if self.dirs.lock().unwrap().remove(path) {
            Ok(())
        } else {
            Err(io::ErrorKind::NotFound.into())
        }
    }
}

/// Mount table shared between the fake mounter and the registry.
#[derive(Default)]
pub struct FakeChecker {
    mounted: Mutex<HashSet<PathBuf>>,
    pub fail: AtomicBool,
}

impl FakeChecker {
    pub fn add(&self, path: impl Into<PathBuf>) {
        self.mounted.lock().unwrap().insert(path.into());
    }

    pub fn forget(&self, path: impl AsRef<Path>) {
        self.mounted.lock().unwrap().remove(path.as_ref());
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.mounted.lock().unwrap().contains(path.as_ref())
    }
}

impl MountChecker for FakeChecker {
    fn exists(&self, path: &Path) -> Result<bool, MountCheckError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MountCheckError::Open {
                path: "/proc/mounts".into(),
                source: io::Error::other("mount table unavailable"),
            });
        }
        Ok(self.contains(path))
    }

    fn list(&self, pattern: &str) -> Result<Vec<PathBuf>, MountCheckError> {
        let re = regex::Regex::new(pattern)?;
        let mut found: Vec<_> = self
            .mounted
            .lock()
            .unwrap()
            .iter()
            .filter(|p| re.is_match(&p.to_string_lossy()))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }
}

#[derive(Debug, Clone)]
pub enum MountFailure {
    Exit(String),
    Safe(String),
}

/// Records calls and keeps [`FakeChecker`] in sync with what it mounts.
pub struct FakeMounter {
    checker: Arc<FakeChecker>,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
    pub checks: AtomicUsize,
    pub alive: AtomicBool,
    pub fail_unmount: AtomicBool,
    mount_delay: Mutex<Duration>,
    mount_failure: Mutex<Option<MountFailure>>,
    pub last_opts: Mutex<HashMap<String, String>>,
    pub purged: Mutex<Vec<PathBuf>>,
    /// Signalled each time a mount succeeds.
    pub mounted: tokio::sync::Notify,
}

impl FakeMounter {
    pub fn new(checker: Arc<FakeChecker>) -> Self {
        Self {
            checker,
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            fail_unmount: AtomicBool::new(false),
            mount_delay: Mutex::new(Duration::ZERO),
            mount_failure: Mutex::new(None),
            last_opts: Mutex::new(HashMap::new()),
            purged: Mutex::new(Vec::new()),
            mounted: tokio::sync::Notify::new(),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.mount_delay.lock().unwrap() = delay;
    }

    pub fn fail_mount(&self, failure: Option<MountFailure>) {
        *self.mount_failure.lock().unwrap() = failure;
    }

    pub fn mount_calls(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }
}

fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code << 8)
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        _ctx: &OpContext,
        _source: &str,
        target: &Path,
        opts: &HashMap<String, String>,
    ) -> Result<(), MountError> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        *self.last_opts.lock().unwrap() = opts.clone();

        let delay = *self.mount_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.mount_failure.lock().unwrap().clone();
        match failure {
            Some(MountFailure::Exit(output)) => Err(InvokeError::Exited {
                executable: "mount".into(),
                status: exit_status(32),
                output,
            }
            .into()),
            Some(MountFailure::Safe(text)) => Err(SafeError::new(text).into()),
            None => {
                self.checker.add(target);
                self.alive.store(true, Ordering::SeqCst);
                self.mounted.notify_one();
                Ok(())
            }
        }
    }

    async fn unmount(&self, _ctx: &OpContext, target: &Path) -> Result<(), MountError> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(InvokeError::Exited {
                executable: "umount".into(),
                status: exit_status(32),
                output: "umount: target is busy".into(),
            }
            .into());
        }
        self.checker.forget(target);
        Ok(())
    }

    async fn check(&self, _ctx: &OpContext, _name: &str, _mountpoint: &Path) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.alive.load(Ordering::SeqCst)
    }

    async fn purge(&self, _ctx: &OpContext, path: &Path) {
        self.purged.lock().unwrap().push(path.to_path_buf());
    }
}

pub struct Harness {
    pub fs: Arc<MemFs>,
    pub checker: Arc<FakeChecker>,
    pub mounter: Arc<FakeMounter>,
}

impl Harness {
    pub fn new() -> Self {
        let checker = Arc::new(FakeChecker::default());
        Self {
            fs: Arc::new(MemFs::default()),
            mounter: Arc::new(FakeMounter::new(checker.clone())),
            checker,
        }
    }

    pub fn registry(&self) -> VolumeRegistry {
        self.registry_with_threshold(Duration::from_secs(8))
    }

    pub fn registry_with_threshold(&self, threshold: Duration) -> VolumeRegistry {
        VolumeRegistry::new(RegistryParts {
            mount_root: AbsolutePath::new(ROOT),
            fs: self.fs.clone(),
            checker: self.checker.clone(),
            mounter: self.mounter.clone(),
            slow_mount_threshold: threshold,
        })
        .expect("registry")
    }
}

/// Collects formatted log lines for assertions.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Installs a subscriber for the current thread until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
