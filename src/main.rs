use clap::Parser;
use nfsvol::cmd;
use nfsvol::cmd::{Cli, Command};
use std::process::{ExitCode, Termination};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.cmd {
        Command::Serve(args) => cmd::serve(*args).await,
        Command::Mounts(args) => cmd::mounts(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => e.report(),
    }
}
