use super::{
    api::VolumeInfo,
    driver::VolumeDriver,
    error::{PersistOp, PluginError},
    types::{DockerOptions, SOURCE_OPT, VolumeName},
};
use crate::{
    context::OpContext, fs::FileSystem, mountchecker::MountChecker, mounter::Mounter,
    path::AbsolutePath, syncmap::SyncMap,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const STATE_FILE: &str = ".nfsvol-state.json";
pub const DEFAULT_SLOW_MOUNT_THRESHOLD: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeRecord {
    #[serde(default)]
    name: String,
    /// Creation options may carry credentials and are never written to disk.
    #[serde(skip)]
    opts: DockerOptions,
    #[serde(default)]
    mountpoint: String,
    #[serde(default)]
    mount_count: u32,
    #[serde(default)]
    source: String,
}

impl VolumeRecord {
    fn to_info(&self) -> VolumeInfo {
        VolumeInfo {
            name: self.name.clone(),
            mountpoint: self.mountpoint.clone(),
            mount_count: self.mount_count,
        }
    }

    fn is_mounted(&self) -> bool {
        self.mount_count > 0 && !self.mountpoint.is_empty()
    }

    /// Options handed to the mounter. Always include the source.
    fn mount_opts(&self) -> DockerOptions {
        let mut opts = self.opts.clone();
        opts.entry(SOURCE_OPT.to_string())
            .or_insert_with(|| self.source.clone());
        opts
    }

    /// Enforces "no mounts" <=> "no mountpoint". Returns true if changed.
    fn normalize(&mut self) -> bool {
        if self.is_mounted() || (self.mount_count == 0 && self.mountpoint.is_empty()) {
            return false;
        }
        self.mount_count = 0;
        self.mountpoint.clear();
        true
    }
}

/// Everything the registry needs from the outside world.
pub struct RegistryParts {
    pub mount_root: AbsolutePath,
    pub fs: Arc<dyn FileSystem>,
    pub checker: Arc<dyn MountChecker>,
    pub mounter: Arc<dyn Mounter>,
    pub slow_mount_threshold: Duration,
}

/// Why a last-reference teardown did not fully succeed.
enum Teardown {
    /// Nothing changed on disk; the record must stay as it is.
    Aborted(PluginError),
    /// The mount is gone but something was off; the record still advances.
    Incomplete(PluginError),
}

pub struct VolumeRegistry {
    mount_root: AbsolutePath,
    state_file: AbsolutePath,
    fs: Arc<dyn FileSystem>,
    checker: Arc<dyn MountChecker>,
    mounter: Arc<dyn Mounter>,
    slow_mount_threshold: Duration,
    entries: Arc<RwLock<HashMap<String, VolumeRecord>>>,
    /// Serializes Mount/Unmount/Remove per volume.
    locks: SyncMap<Arc<Mutex<()>>>,
}

impl VolumeRegistry {
    /// Prepares the mount root and restores the persisted table.
    ///
    /// Restored volumes that claim a mount are kept only if the mount checker
    /// still sees it.
    pub fn new(parts: RegistryParts) -> Result<Self, PluginError> {
        let RegistryParts {
            mount_root,
            fs,
            checker,
            mounter,
            slow_mount_threshold,
        } = parts;

        fs.create_dir_all(&mount_root)
            .map_err(|source| PluginError::Setup {
                path: mount_root.to_path_buf(),
                source,
            })?;

        let state_file = mount_root.join(STATE_FILE);
        let restored = load_state(fs.as_ref(), &state_file);
        let (entries, changed) = reconcile(restored, checker.as_ref());

        if changed {
            if let Err(e) = write_state(fs.as_ref(), &state_file, &entries) {
                warn!(error = %e, state_file = %state_file, "failed to persist reconciled state");
            }
        }
        report_orphans(checker.as_ref(), &mount_root, &entries);
        info!(volumes = entries.len(), state_file = %state_file, "state restored");

        Ok(Self {
            mount_root,
            state_file,
            fs,
            checker,
            mounter,
            slow_mount_threshold,
            entries: Arc::new(RwLock::new(entries)),
            locks: SyncMap::new(),
        })
    }

    pub fn mount_root(&self) -> &AbsolutePath {
        &self.mount_root
    }

    fn persist(&self, entries: &HashMap<String, VolumeRecord>) -> io::Result<()> {
        write_state(self.fs.as_ref(), &self.state_file, entries)
    }

    fn volume_lock(&self, name: &VolumeName) -> Arc<Mutex<()>> {
        self.locks
            .get_or_insert_with(name.as_str(), || Arc::new(Mutex::new(())))
    }

    /// Forgets the per-volume lock once no operation holds it.
    fn release_lock(&self, name: &VolumeName, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .delete_if(name.as_str(), |held| Arc::strong_count(held) == 1);
    }

    async fn snapshot(&self, name: &VolumeName) -> Option<VolumeRecord> {
        self.entries.read().await.get(name.as_str()).cloned()
    }

    async fn mount_locked(
        &self,
        ctx: &OpContext,
        name: &VolumeName,
        held: OwnedMutexGuard<()>,
    ) -> Result<PathBuf, PluginError> {
        let record = self
            .snapshot(name)
            .await
            .ok_or_else(|| PluginError::NotCreated(name.to_string()))?;
        let target = self.mount_root.join(name.as_str());

        let started = Instant::now();
        let needs_mount = if record.mount_count < 1 {
            true
        } else if self.mounter.check(ctx, name, &target).await {
            false
        } else {
            warn!(volume = %name, mountpoint = %target, "mount is stale, remounting");
            true
        };

        if needs_mount {
            self.fs
                .create_dir_all(&target)
                .map_err(|source| PluginError::MountDir {
                    path: target.to_path_buf(),
                    source,
                })?;
            self.mounter
                .mount(ctx, &record.source, &target, &record.mount_opts())
                .await?;
        }

        let elapsed = started.elapsed();
        if elapsed > self.slow_mount_threshold {
            warn!(
                volume = %name,
                elapsed = %humantime::format_duration(elapsed),
                threshold = %humantime::format_duration(self.slow_mount_threshold),
                "mount-duration-too-high"
            );
        }

        // The mount exists from here on. Recording it must outlive the
        // request, and the volume stays locked until it is recorded.
        let recorded = tokio::spawn(record_mount(
            Arc::clone(&self.entries),
            Arc::clone(&self.fs),
            self.state_file.clone(),
            name.clone(),
            target,
            held,
        ));
        recorded
            .await
            .map_err(|e| PluginError::Internal(format!("mount bookkeeping failed: {e}")))?
    }

    /// Takes the last reference off a mount: unmount, then remove the
    /// mount directory.
    async fn teardown(&self, ctx: &OpContext, name: &VolumeName, mountpoint: &Path) -> Result<(), Teardown> {
        let present = match self.checker.exists(mountpoint) {
            Ok(present) => present,
            Err(e) => {
                warn!(volume = %name, error = %e, "cannot inspect mount table, unmounting anyway");
                true
            }
        };

        if !present {
            error!(volume = %name, mountpoint = %mountpoint.display(), "failed-mountpoint-not-found");
            let name = name.to_string();
            let path = mountpoint.display().to_string();
            let err = match self.fs.remove_dir(mountpoint) {
                Ok(()) => PluginError::MountpointMissing { name, path },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    PluginError::MountpointMissing { name, path }
                }
                Err(source) => PluginError::MountpointCleanup { name, path, source },
            };
            return Err(Teardown::Incomplete(err));
        }

        self.mounter
            .unmount(ctx, mountpoint)
            .await
            .map_err(|e| Teardown::Aborted(PluginError::Unmount(e)))?;

        match self.fs.remove_dir(mountpoint) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(volume = %name, "mount directory already gone");
                Ok(())
            }
            Err(source) => Err(Teardown::Incomplete(PluginError::MountDirRemoval {
                path: mountpoint.to_path_buf(),
                source,
            })),
        }
    }

    async fn unmount_locked(&self, ctx: &OpContext, name: &VolumeName) -> Result<(), PluginError> {
        let record = self
            .snapshot(name)
            .await
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if !record.is_mounted() {
            error!(volume = %name, "failed-mountpoint-not-assigned");
            return Err(PluginError::NotMounted);
        }

        let mut outcome = Ok(());
        if record.mount_count == 1 {
            match self.teardown(ctx, name, Path::new(&record.mountpoint)).await {
                Ok(()) => {}
                Err(Teardown::Aborted(e)) => return Err(e),
                Err(Teardown::Incomplete(e)) => outcome = Err(e),
            }
        }

        let mut entries = self.entries.write().await;
        let Some(current) = entries.get_mut(name.as_str()) else {
            return outcome;
        };
        current.mount_count = current.mount_count.saturating_sub(1);
        if current.mount_count == 0 {
            entries.remove(name.as_str());
            info!(volume = %name, "last reference released, volume removed");
        } else {
            debug!(volume = %name, mount_count = current.mount_count, "reference released");
        }

        match (self.persist(&entries), outcome) {
            (Ok(()), outcome) => outcome,
            (Err(source), Ok(())) => Err(PluginError::Persist {
                op: PersistOp::Unmounting,
                source,
            }),
            (Err(e), Err(teardown)) => {
                error!(volume = %name, error = %e, "failed to persist state when unmounting");
                Err(teardown)
            }
        }
    }

    async fn remove_locked(&self, ctx: &OpContext, name: &VolumeName) -> Result<(), PluginError> {
        let Some(record) = self.snapshot(name).await else {
            warn!(volume = %name, "warning-volume-removal: volume not found");
            return Ok(());
        };

        if record.is_mounted() {
            match self.teardown(ctx, name, Path::new(&record.mountpoint)).await {
                Ok(()) => {}
                Err(Teardown::Incomplete(e @ PluginError::MountpointMissing { .. })) => {
                    warn!(volume = %name, error = %e, "mount already gone, removing anyway");
                }
                Err(Teardown::Incomplete(e)) | Err(Teardown::Aborted(e)) => return Err(e),
            }
        }

        let mut entries = self.entries.write().await;
        entries.remove(name.as_str());
        info!(volume = %name, "removing-volume");
        self.persist(&entries)
            .map_err(|source| PluginError::Persist {
                op: PersistOp::Removing,
                source,
            })
    }
}

#[async_trait]
impl VolumeDriver for VolumeRegistry {
    async fn create(&self, name: &str, opts: DockerOptions) -> Result<(), PluginError> {
        let name = VolumeName::new(name)?;
        let source = opts
            .get(SOURCE_OPT)
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or(PluginError::MissingRequiredOpt(SOURCE_OPT))?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(name.as_str()) {
            info!(volume = %name, "volume already exists, keeping original options");
            return Ok(());
        }

        entries.insert(
            name.to_string(),
            VolumeRecord {
                name: name.to_string(),
                opts,
                source,
                ..Default::default()
            },
        );
        info!(volume = %name, "volume created");

        self.persist(&entries)
            .map_err(|source| PluginError::Persist {
                op: PersistOp::Creating,
                source,
            })
    }

    async fn remove(&self, ctx: &OpContext, name: &str) -> Result<(), PluginError> {
        let name = VolumeName::new(name)?;
        let lock = self.volume_lock(&name);
        let result = {
            let _held = lock.lock().await;
            self.remove_locked(ctx, &name).await
        };
        self.release_lock(&name, lock);
        result
    }

    async fn mount(&self, ctx: &OpContext, name: &str) -> Result<PathBuf, PluginError> {
        let name = VolumeName::new(name)?;
        let lock = self.volume_lock(&name);
        let held = Arc::clone(&lock).lock_owned().await;
        let result = self.mount_locked(ctx, &name, held).await;
        self.release_lock(&name, lock);
        result
    }

    async fn unmount(&self, ctx: &OpContext, name: &str) -> Result<(), PluginError> {
        let name = VolumeName::new(name)?;
        let lock = self.volume_lock(&name);
        let result = {
            let _held = lock.lock().await;
            self.unmount_locked(ctx, &name).await
        };
        self.release_lock(&name, lock);
        result
    }

    async fn path(&self, name: &str) -> Result<PathBuf, PluginError> {
        let name = VolumeName::new(name)?;
        let record = self
            .snapshot(&name)
            .await
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if record.mountpoint.is_empty() {
            error!(volume = %name, "failed-mountpoint-not-assigned");
            return Err(PluginError::NotMounted);
        }
        Ok(PathBuf::from(record.mountpoint))
    }

    async fn get(&self, name: &str) -> Result<VolumeInfo, PluginError> {
        let name = VolumeName::new(name)?;
        self.snapshot(&name)
            .await
            .map(|record| record.to_info())
            .ok_or(PluginError::UnknownVolume)
    }

    async fn list(&self) -> Vec<VolumeInfo> {
        let entries = self.entries.read().await;
        let mut volumes: Vec<_> = entries.values().map(VolumeRecord::to_info).collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volumes
    }

    async fn drain(&self, ctx: &OpContext) -> Result<(), PluginError> {
        let mounted: Vec<(String, String)> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|r| r.is_mounted())
                .map(|r| (r.name.clone(), r.mountpoint.clone()))
                .collect()
        };
        info!(volumes = mounted.len(), "draining mounts");

        for (name, mountpoint) in mounted {
            if let Err(e) = self.mounter.unmount(ctx, Path::new(&mountpoint)).await {
                error!(volume = %name, error = %e, "failed to unmount while draining");
            }
        }
        self.mounter.purge(ctx, &self.mount_root).await;
        Ok(())
    }
}

fn load_state(fs: &dyn FileSystem, path: &Path) -> HashMap<String, VolumeRecord> {
    let data = match fs.read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(state_file = %path.display(), "no state file");
            return HashMap::new();
        }
        Err(e) => {
            warn!(state_file = %path.display(), error = %e, "failed-to-read-state-file");
            return HashMap::new();
        }
    };
    match serde_json::from_slice(&data) {
        Ok(state) => state,
        Err(e) => {
            error!(state_file = %path.display(), error = %e, "failed-to-unmarshal-state");
            HashMap::new()
        }
    }
}

async fn record_mount(
    entries: Arc<RwLock<HashMap<String, VolumeRecord>>>,
    fs: Arc<dyn FileSystem>,
    state_file: AbsolutePath,
    name: VolumeName,
    target: AbsolutePath,
    _held: OwnedMutexGuard<()>,
) -> Result<PathBuf, PluginError> {
    let mut entries = entries.write().await;
    let record = entries
        .get_mut(name.as_str())
        .ok_or_else(|| PluginError::NotCreated(name.to_string()))?;
    record.mountpoint = target.to_string();
    record.mount_count += 1;
    info!(volume = %name, mount_count = record.mount_count, "volume mounted");

    write_state(fs.as_ref(), &state_file, &entries).map_err(|source| PluginError::Persist {
        op: PersistOp::Mounting,
        source,
    })?;
    Ok(target.into_inner())
}

fn write_state(fs: &dyn FileSystem, path: &Path, entries: &HashMap<String, VolumeRecord>) -> io::Result<()> {
    let ordered: BTreeMap<&String, &VolumeRecord> = entries.iter().collect();
    let data = serde_json::to_vec_pretty(&ordered).map_err(io::Error::other)?;
    fs.write(path, &data).inspect_err(|e| {
        error!(state_file = %path.display(), error = %e, "failed-to-write-state-file");
    })
}

/// Drops restored volumes whose mounts did not survive. Returns the kept
/// table and whether it differs from what was on disk.
fn reconcile(
    restored: HashMap<String, VolumeRecord>,
    checker: &dyn MountChecker,
) -> (HashMap<String, VolumeRecord>, bool) {
    let mut changed = false;
    let mut kept = HashMap::with_capacity(restored.len());

    for (key, mut record) in restored {
        if let Err(e) = VolumeName::new(key.as_str()) {
            warn!(volume = %key, error = %e, "dropping restored volume with invalid name");
            changed = true;
            continue;
        }
        if record.name != key {
            record.name = key.clone();
            changed = true;
        }
        changed |= record.normalize();

        if record.is_mounted() {
            match checker.exists(Path::new(&record.mountpoint)) {
                Ok(true) => {}
                Ok(false) => {
                    info!(volume = %key, mountpoint = %record.mountpoint, "unable to verify volume, dropping");
                    changed = true;
                    continue;
                }
                Err(e) => {
                    warn!(volume = %key, error = %e, "unable to verify volume, dropping");
                    changed = true;
                    continue;
                }
            }
        }
        kept.insert(key, record);
    }
    (kept, changed)
}

/// Logs mounts below the root that no volume accounts for.
fn report_orphans(checker: &dyn MountChecker, root: &AbsolutePath, entries: &HashMap<String, VolumeRecord>) {
    let pattern = format!("^{}/", regex::escape(&root.to_string()));
    let mounts = match checker.list(&pattern) {
        Ok(mounts) => mounts,
        Err(e) => {
            warn!(error = %e, "cannot list existing mounts");
            return;
        }
    };
    for mount in mounts {
        let known = entries
            .values()
            .any(|r| r.is_mounted() && Path::new(&r.mountpoint) == mount.as_path());
        if !known {
            warn!(mountpoint = %mount.display(), "found mount not tracked by any volume");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(mountpoint: &str, mount_count: u32) -> VolumeRecord {
        VolumeRecord {
            name: "vol".into(),
            mountpoint: mountpoint.into(),
            mount_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_enforces_invariant() {
        let mut r = record("", 2);
        assert!(r.normalize());
        assert_eq!((r.mount_count, r.mountpoint.as_str()), (0, ""));

        let mut r = record("/mnt/vol", 0);
        assert!(r.normalize());
        assert!(r.mountpoint.is_empty());

        assert!(!record("/mnt/vol", 1).normalize());
        assert!(!record("", 0).normalize());
    }

    #[test]
    fn test_state_omits_opts() {
        let mut r = record("/mnt/vol", 1);
        r.opts.insert("source".into(), "secret-host:/x".into());
        r.source = "secret-host:/x".into();
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("Opts").is_none());
        assert_eq!(json["MountCount"], 1);
        assert_eq!(json["Mountpoint"], "/mnt/vol");
    }

    #[test]
    fn test_mount_opts_include_source() {
        let mut r = record("", 0);
        r.source = "server:/export".into();
        assert_eq!(r.mount_opts().get("source").map(String::as_str), Some("server:/export"));

        r.opts.insert("source".into(), "explicit:/x".into());
        assert_eq!(r.mount_opts().get("source").map(String::as_str), Some("explicit:/x"));
    }
}
