use super::api::VolumeInfo;
use super::error::PluginError;
use super::types::DockerOptions;
use crate::context::OpContext;
use async_trait::async_trait;
use std::path::PathBuf;

/// The volume plugin operations. Names arrive unvalidated; each operation
/// rejects empty or unusable names itself.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create(&self, name: &str, opts: DockerOptions) -> Result<(), PluginError>;
    async fn remove(&self, ctx: &OpContext, name: &str) -> Result<(), PluginError>;
    async fn mount(&self, ctx: &OpContext, name: &str) -> Result<PathBuf, PluginError>;
    async fn unmount(&self, ctx: &OpContext, name: &str) -> Result<(), PluginError>;
    async fn path(&self, name: &str) -> Result<PathBuf, PluginError>;
    async fn get(&self, name: &str) -> Result<VolumeInfo, PluginError>;
    async fn list(&self) -> Vec<VolumeInfo>;

    /// Unmounts everything still mounted. Used at shutdown.
    async fn drain(&self, ctx: &OpContext) -> Result<(), PluginError>;
}
