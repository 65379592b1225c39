//! Layered configuration: CLI/env over a TOML file over built-in defaults.

use crate::error::NfsVolError;
use crate::path::AbsolutePath;
use clap::Args;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Validation(String),
}

/// Trait for merging two partial structs.
pub trait Overlay {
    /// self is the base layer, over is the top layer.
    fn overlay(self, over: Self) -> Self;
}

// If top layer exists, use it. Otherwise keep base.
impl<T> Overlay for Option<T> {
    fn overlay(self, over: Self) -> Self {
        over.or(self)
    }
}

/// Trait for applying configured default values to optional fields.
pub trait ApplyDefaults {
    fn apply_defaults(self) -> Self;
}

#[derive(Args, Debug, Clone)]
pub struct LayeredArgs<T: Args> {
    /// Path to a TOML configuration file
    #[arg(long, env = "NFSVOL_CONFIG")]
    pub config: Option<AbsolutePath>,

    #[command(flatten)]
    pub inner: T,
}

impl<T> LayeredArgs<T>
where
    T: Args,
{
    pub fn load<C>(self) -> Result<C, NfsVolError>
    where
        T: Layered<C>,
    {
        self.inner.resolve(self.config.as_deref())
    }
}

pub trait Layered<C>: Overlay + DeserializeOwned + Default + Sized {
    fn resolve(self, config_path: Option<&Path>) -> Result<C, NfsVolError>;
}

impl<T, C> Layered<C> for T
where
    T: Overlay + DeserializeOwned + Default,
    T: TryInto<C>,
    <T as TryInto<C>>::Error: Into<NfsVolError>,
{
    fn resolve(self, config_path: Option<&Path>) -> Result<C, NfsVolError> {
        let base = match config_path {
            Some(path) => {
                // An explicitly named file that is missing is a mistake.
                let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
                toml::from_str::<Self>(&content).map_err(ConfigError::Parse)?
            }
            None => Self::default(),
        };

        base.overlay(self).try_into().map_err(Into::into)
    }
}

/// A duration written the way a person would: `5s`, `1m 30s`, or a bare
/// number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HumanDuration(Duration);

impl HumanDuration {
    pub fn get(self) -> Duration {
        self.0
    }
}

impl FromStr for HumanDuration {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(secs) = s.trim().parse::<u64>() {
            return Ok(Self(Duration::from_secs(secs)));
        }
        humantime::parse_duration(s).map(Self)
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = humantime::DurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl From<HumanDuration> for String {
    fn from(d: HumanDuration) -> Self {
        d.to_string()
    }
}

impl From<HumanDuration> for Duration {
    fn from(d: HumanDuration) -> Self {
        d.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_top() {
        assert_eq!(Some(1).overlay(Some(2)), Some(2));
        assert_eq!(Some(1).overlay(None), Some(1));
        assert_eq!(None::<u8>.overlay(None), None);
    }

    #[test]
    fn test_human_duration_parsing() {
        assert_eq!("5".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(5));
        assert_eq!("8s".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(8));
        assert_eq!(
            "1m 30s".parse::<HumanDuration>().unwrap().get(),
            Duration::from_secs(90)
        );
        assert!("soon".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn test_human_duration_serde() {
        #[derive(Deserialize, Serialize)]
        struct Wrapper {
            timeout: HumanDuration,
        }
        let w: Wrapper = toml::from_str("timeout = \"250ms\"").unwrap();
        assert_eq!(w.timeout.get(), Duration::from_millis(250));
        assert_eq!(toml::to_string(&w).unwrap().trim(), "timeout = \"250ms\"");
    }
}
