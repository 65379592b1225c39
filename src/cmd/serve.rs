use crate::cmd::{PluginArgs, PluginConfig};
use crate::config::LayeredArgs;
use crate::error::NfsVolError;
use crate::volume::VolumePlugin;
use tracing::info;

pub async fn serve(args: LayeredArgs<PluginArgs>) -> Result<(), NfsVolError> {
    let config: PluginConfig = args.load()?;
    config.logger.init()?;
    info!("starting nfs volume plugin with config: {:#?}", config);
    VolumePlugin::new(config).run().await?;
    info!("volume plugin exited");
    Ok(())
}
