use crate::{
    config::ConfigError, logging::LoggingError, mountchecker::MountCheckError,
    volume::error::PluginError,
};
use std::path::PathBuf;
use sysexits::ExitCode;
use thiserror::Error;

/// Failures that end the process. Request-level failures never get here;
/// they are answered over RPC instead.
#[derive(Debug, Error)]
pub enum NfsVolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    MountCheck(#[from] MountCheckError),

    #[error("cannot listen on {path:?}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl std::process::Termination for NfsVolError {
    fn report(self) -> std::process::ExitCode {
        let code = self.exit_code();
        if tracing::dispatcher::has_been_set() {
            tracing::error!(exit_code = code, "{}", self);
        } else {
            eprintln!("nfsvol: {}", self);
        }
        std::process::ExitCode::from(code)
    }
}

impl NfsVolError {
    pub fn exit_code(&self) -> u8 {
        match self {
            NfsVolError::Config(e) => match e {
                ConfigError::Io(_) => ExitCode::NoInput.into(),
                ConfigError::Parse(_) => ExitCode::Config.into(),
                ConfigError::Validation(_) => ExitCode::Usage.into(),
            },
            NfsVolError::Logging(_) => ExitCode::Software.into(),
            NfsVolError::Plugin(e) => match e {
                PluginError::Setup { .. } => ExitCode::CantCreat.into(),
                _ => ExitCode::Software.into(),
            },
            NfsVolError::MountCheck(e) => match e {
                MountCheckError::Pattern(_) => ExitCode::Usage.into(),
                _ => ExitCode::Unavailable.into(),
            },
            NfsVolError::Socket { .. } => ExitCode::OsErr.into(),
            NfsVolError::Io(_) => ExitCode::IoErr.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let bad_pattern = NfsVolError::from(MountCheckError::Pattern(
            regex::Regex::new("[").unwrap_err(),
        ));
        assert_eq!(bad_pattern.exit_code(), u8::from(ExitCode::Usage));

        let setup = NfsVolError::from(PluginError::Setup {
            path: "/nope".into(),
            source: std::io::Error::other("denied"),
        });
        assert_eq!(setup.exit_code(), u8::from(ExitCode::CantCreat));

        let missing = NfsVolError::from(ConfigError::Validation("x".into()));
        assert_eq!(missing.exit_code(), u8::from(ExitCode::Usage));
    }
}
