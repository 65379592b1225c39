use crate::config::LayeredArgs;
use clap::{Args, Parser, Subcommand};

pub mod config;
mod mounts;
mod serve;

pub use config::{PluginArgs, PluginConfig};
pub use mounts::mounts;
pub use serve::serve;

#[derive(Parser, Debug)]
#[command(name = "nfsvol")]
#[command(version, about = "NFS volume plugin for container runtimes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the volume plugin API on a Unix socket
    Serve(Box<LayeredArgs<PluginArgs>>),

    /// Print live mounts whose path matches a pattern
    Mounts(MountsArgs),
}

#[derive(Args, Debug)]
pub struct MountsArgs {
    /// Regular expression matched against each mount path
    #[arg(default_value = ".*")]
    pub pattern: String,
}
