//! NFS mount operations, performed by shelling out to `mount(8)`.

use crate::context::OpContext;
use crate::invoker::{InvokeError, Invoker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

pub const DEFAULT_FS_TYPE: &str = "nfs4";
pub const DEFAULT_MOUNT_OPTIONS: &str =
    "vers=4.0,rsize=1048576,wsize=1048576,hard,intr,timeo=600,retrans=2,actimeo=0";
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// An error whose description may be shown to the caller as-is.
///
/// Displays as its JSON encoding, which is the form the RPC caller expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SafeError {
    pub safe_description: String,
}

impl SafeError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            safe_description: description.into(),
        }
    }
}

impl std::fmt::Display for SafeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str(&self.safe_description),
        }
    }
}

impl std::error::Error for SafeError {}

#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Safe(#[from] SafeError),
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Attaches `source` at `target`. `opts` are the volume's creation options.
    async fn mount(
        &self,
        ctx: &OpContext,
        source: &str,
        target: &Path,
        opts: &HashMap<String, String>,
    ) -> Result<(), MountError>;

    async fn unmount(&self, ctx: &OpContext, target: &Path) -> Result<(), MountError>;

    /// Best-effort liveness check. Any failure reads as "not mounted".
    async fn check(&self, ctx: &OpContext, name: &str, mountpoint: &Path) -> bool;

    /// Cleanup hook for leftovers under `path`. Never fails.
    async fn purge(&self, ctx: &OpContext, path: &Path);
}

pub struct VolumeMounter {
    invoker: Arc<dyn Invoker>,
    fs_type: String,
    default_opts: String,
    check_timeout: Duration,
}

impl VolumeMounter {
    pub fn new(
        invoker: Arc<dyn Invoker>,
        fs_type: impl Into<String>,
        default_opts: impl Into<String>,
    ) -> Self {
        Self {
            invoker,
            fs_type: fs_type.into(),
            default_opts: default_opts.into(),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    async fn run(&self, ctx: &OpContext, executable: &str, args: Vec<String>) -> Result<(), InvokeError> {
        let handle = self.invoker.invoke(ctx, executable, &args, &[])?;
        handle.wait().await
    }
}

#[async_trait]
impl Mounter for VolumeMounter {
    async fn mount(
        &self,
        ctx: &OpContext,
        source: &str,
        target: &Path,
        _opts: &HashMap<String, String>,
    ) -> Result<(), MountError> {
        let args = vec![
            "-t".to_string(),
            self.fs_type.clone(),
            "-o".to_string(),
            self.default_opts.clone(),
            source.to_string(),
            target.to_string_lossy().into_owned(),
        ];
        self.run(ctx, "mount", args).await.map_err(|e| {
            error!(source, target = %target.display(), error = %e, "nfs-mount-failed");
            MountError::from(e)
        })
    }

    async fn unmount(&self, ctx: &OpContext, target: &Path) -> Result<(), MountError> {
        let args = vec![target.to_string_lossy().into_owned()];
        self.run(ctx, "umount", args).await.map_err(|e| {
            error!(target = %target.display(), error = %e, "nfs-unmount-failed");
            MountError::from(e)
        })
    }

    async fn check(&self, ctx: &OpContext, name: &str, mountpoint: &Path) -> bool {
        let ctx = ctx.with_timeout(self.check_timeout);
        let _guard = ctx.drop_guard();
        let args = vec!["-q".to_string(), mountpoint.to_string_lossy().into_owned()];
        match self.run(&ctx, "mountpoint", args).await {
            Ok(()) => true,
            Err(e) => {
                info!(volume = name, mountpoint = %mountpoint.display(), error = %e, "unable to verify volume");
                false
            }
        }
    }

    async fn purge(&self, _ctx: &OpContext, path: &Path) {
        debug!(path = %path.display(), "purge requested");
    }
}
