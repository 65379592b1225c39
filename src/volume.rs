//! The volume plugin server: a hyper HTTP/1 service on a Unix socket.

use crate::context::OpContext;
use crate::fs::{FileSystem, OsFileSystem};
use crate::invoker::{Invoker, ProcessGroupInvoker};
use crate::mountchecker::platform_checker;
use crate::mounter::VolumeMounter;
use crate::signal::ShutdownSignals;
use crate::{error::NfsVolError, path::AbsolutePath};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info};
pub mod api;
pub mod driver;
pub mod error;
pub mod registry;
pub mod service;
pub mod types;

use crate::cmd::PluginConfig;
use driver::VolumeDriver;
use registry::{RegistryParts, VolumeRegistry};
use service::DockerPluginService;

pub struct VolumePlugin {
    config: PluginConfig,
}

impl VolumePlugin {
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }

    fn registry(&self) -> Result<VolumeRegistry, NfsVolError> {
        let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
        let invoker: Arc<dyn Invoker> = Arc::new(ProcessGroupInvoker);
        let mounter = VolumeMounter::new(
            invoker,
            self.config.fs_type.clone(),
            self.config.mount_options.clone(),
        )
        .with_check_timeout(self.config.check_timeout.get());

        Ok(VolumeRegistry::new(RegistryParts {
            mount_root: self.config.mount_root.clone(),
            fs: fs.clone(),
            checker: platform_checker(fs),
            mounter: Arc::new(mounter),
            slow_mount_threshold: self.config.slow_mount_threshold.get(),
        })?)
    }

    pub async fn run(self) -> Result<(), NfsVolError> {
        let socket_path = &self.config.socket;
        let mut signals = ShutdownSignals::install()?;

        let driver = Arc::new(self.registry()?);

        self.ensure_socket_path(socket_path).await?;
        let listener = UnixListener::bind(socket_path).map_err(|source| NfsVolError::Socket {
            path: socket_path.to_path_buf(),
            source,
        })?;

        let service = DockerPluginService::new(driver.clone());

        info!(socket = %socket_path, mount_root = %driver.mount_root(), "volume plugin listening");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let io = TokioIo::new(stream);
                            let svc = service.clone();

                            tokio::task::spawn(async move {
                                if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                                    error!("error serving connection: {:?}", err);
                                }
                            });
                        }
                        Err(e) => error!("socket accept error: {}", e),
                    }
                }

                _ = signals.recv() => {
                    break;
                }
            }
        }

        drop(listener);
        if self.config.drain_on_exit {
            driver.drain(&OpContext::background()).await?;
        }

        Ok(())
    }

    async fn ensure_socket_path(&self, path: &AbsolutePath) -> Result<(), NfsVolError> {
        if path.exists() {
            info!("removing existing socket file: {}", path);
            tokio::fs::remove_file(path).await?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

impl Drop for VolumePlugin {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.config.socket);
    }
}
