use crate::config::HumanDuration;
use crate::logging::{Logger, LoggerArgs};
use crate::mounter::{DEFAULT_CHECK_TIMEOUT, DEFAULT_FS_TYPE, DEFAULT_MOUNT_OPTIONS};
use crate::path::AbsolutePath;
use crate::volume::registry::DEFAULT_SLOW_MOUNT_THRESHOLD;
use clap::Args;
use nfsvol_derive::LayeredConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub socket: AbsolutePath,
    pub mount_root: AbsolutePath,
    pub fs_type: String,
    pub mount_options: String,
    pub drain_on_exit: bool,
    pub check_timeout: HumanDuration,
    pub slow_mount_threshold: HumanDuration,
    pub logger: Logger,
}

#[derive(Args, Debug, Clone, Default, Serialize, Deserialize, LayeredConfig)]
#[serde(rename_all = "kebab-case")]
#[layered(try_into = "PluginConfig")]
pub struct PluginArgs {
    /// Path to the listening socket.
    #[arg(long, env = "NFSVOL_SOCKET")]
    #[layered(default = "/run/docker/plugins/nfsvol.sock")]
    pub socket: Option<AbsolutePath>,

    /// Directory under which each volume is mounted.
    ///
    /// The driver state file lives here too, so volumes can be restored
    /// after a restart.
    #[arg(long, env = "NFSVOL_MOUNT_ROOT")]
    #[layered(default = "/var/lib/nfsvol/mounts")]
    pub mount_root: Option<AbsolutePath>,

    /// Filesystem type passed to `mount -t`.
    #[arg(long, env = "NFSVOL_FS_TYPE")]
    #[layered(default = DEFAULT_FS_TYPE)]
    pub fs_type: Option<String>,

    /// Options passed to `mount -o` for every volume.
    #[arg(long, env = "NFSVOL_MOUNT_OPTIONS")]
    #[layered(default = DEFAULT_MOUNT_OPTIONS)]
    pub mount_options: Option<String>,

    /// Unmount every volume when the plugin shuts down.
    #[arg(long, env = "NFSVOL_DRAIN_ON_EXIT")]
    #[layered(default = true)]
    pub drain_on_exit: Option<bool>,

    /// Deadline for checking whether an existing mount is still alive.
    #[arg(long, env = "NFSVOL_CHECK_TIMEOUT")]
    #[layered(default = DEFAULT_CHECK_TIMEOUT)]
    pub check_timeout: Option<HumanDuration>,

    /// Mounts slower than this are logged as warnings.
    #[arg(long, env = "NFSVOL_SLOW_MOUNT_THRESHOLD")]
    #[layered(default = DEFAULT_SLOW_MOUNT_THRESHOLD)]
    pub slow_mount_threshold: Option<HumanDuration>,

    #[command(flatten)]
    #[serde(flatten)]
    pub logger: LoggerArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overlay;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config: PluginConfig = PluginArgs::default().try_into().unwrap();
        assert_eq!(config.socket, std::path::PathBuf::from("/run/docker/plugins/nfsvol.sock"));
        assert_eq!(config.mount_root, std::path::PathBuf::from("/var/lib/nfsvol/mounts"));
        assert_eq!(config.fs_type, "nfs4");
        assert_eq!(config.mount_options, DEFAULT_MOUNT_OPTIONS);
        assert!(config.mount_options.starts_with("vers=4.0,"));
        assert!(config.drain_on_exit);
        assert_eq!(config.check_timeout.get(), Duration::from_secs(5));
        assert_eq!(config.slow_mount_threshold.get(), Duration::from_secs(8));
    }

    #[test]
    fn test_toml_layer_under_cli() {
        let file: PluginArgs = toml::from_str(
            r#"
            fs-type = "nfs"
            drain-on-exit = false
            slow-mount-threshold = "30s"
            log-level = "debug"
            "#,
        )
        .unwrap();
        let cli = PluginArgs {
            fs_type: Some("nfs4".into()),
            ..Default::default()
        };
        let config: PluginConfig = file.overlay(cli).try_into().unwrap();
        assert_eq!(config.fs_type, "nfs4");
        assert!(!config.drain_on_exit);
        assert_eq!(config.slow_mount_threshold.get(), Duration::from_secs(30));
        assert_eq!(config.logger.log_level, crate::logging::LogLevel::Debug);
    }

    #[test]
    fn test_load_from_file() {
        use crate::config::LayeredArgs;
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mount-root = \"/srv/volumes\"\ncheck-timeout = \"2s\"").unwrap();

        let args = LayeredArgs {
            config: Some(AbsolutePath::new(file.path())),
            inner: PluginArgs::default(),
        };
        let config: PluginConfig = args.load().unwrap();
        assert_eq!(config.mount_root, std::path::PathBuf::from("/srv/volumes"));
        assert_eq!(config.check_timeout.get(), Duration::from_secs(2));
        assert_eq!(config.fs_type, "nfs4");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        use crate::config::{ConfigError, LayeredArgs};
        use crate::error::NfsVolError;

        let args = LayeredArgs {
            config: Some(AbsolutePath::new("/nonexistent/nfsvol.toml")),
            inner: PluginArgs::default(),
        };
        let err = args.load::<PluginConfig>().unwrap_err();
        assert!(matches!(err, NfsVolError::Config(ConfigError::Io(_))));
    }
}
