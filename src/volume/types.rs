use super::error::PluginError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Creation options as sent by the runtime (`-o key=value`).
pub type DockerOptions = HashMap<String, String>;

/// Option key naming the remote export, e.g. `nfsserver:/export/dir`.
pub const SOURCE_OPT: &str = "source";

/// A volume name that is safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct VolumeName(String);

impl VolumeName {
    pub fn new<S: Into<String>>(name: S) -> Result<Self, PluginError> {
        let s = name.into();
        Self::validate(&s)?;
        Ok(Self(s))
    }

    fn validate(s: &str) -> Result<(), PluginError> {
        if s.is_empty() {
            return Err(PluginError::MissingName);
        }
        if s.contains('/') {
            return Err(PluginError::InvalidName(format!(
                "'{}' must not contain slashes",
                s
            )));
        }
        if s.contains('\0') {
            return Err(PluginError::InvalidName(
                "volume name must not contain null bytes".into(),
            ));
        }
        if s.starts_with('.') {
            return Err(PluginError::InvalidName(format!(
                "'{}' must not start with a dot",
                s
            )));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for VolumeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for VolumeName {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for VolumeName {
    type Error = PluginError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl FromStr for VolumeName {
    type Err = PluginError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert_eq!(VolumeName::new("data").unwrap().as_str(), "data");
        assert!(VolumeName::new("my-vol_1.2").is_ok());
    }

    #[test]
    fn test_empty_name_is_missing() {
        assert!(matches!(VolumeName::new(""), Err(PluginError::MissingName)));
    }

    #[test]
    fn test_rejects_path_like_names() {
        for bad in ["a/b", "..", ".hidden", "nul\0"] {
            assert!(
                matches!(VolumeName::new(bad), Err(PluginError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: VolumeName = serde_json::from_str("\"vol\"").unwrap();
        assert_eq!(ok.to_string(), "vol");
        assert!(serde_json::from_str::<VolumeName>("\"a/b\"").is_err());
    }
}
