//! Backend credentials and region.
//!
//! Loaded once at startup from an optional JSON file, then overridden by
//! environment variables. The resulting [`CloudConfig`] is immutable for the
//! process lifetime.

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_REGION: &str = "CSI_REGION";
pub const ENV_ACCESS_KEY_ID: &str = "CSI_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "CSI_SECRET_ACCESS_KEY";
pub const ENV_ROLE_ARN: &str = "CSI_ROLE_ARN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read cloud config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse cloud config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Credentials and region handed to the block agent with every request.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CloudConfig {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Role to assume instead of using static keys
    #[serde(default)]
    pub role_arn: Option<String>,
}

impl fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("role_arn", &self.role_arn)
            .finish()
    }
}

impl CloudConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from an optional file, apply environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`CloudConfig::load`] with overrides taken from `lookup`.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_json(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Overlay non-empty values returned by `lookup` for the `CSI_*` keys.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(region) = get(ENV_REGION) {
            self.region = region;
        }
        if let Some(key_id) = get(ENV_ACCESS_KEY_ID) {
            self.access_key_id = Some(key_id);
        }
        if let Some(secret) = get(ENV_SECRET_ACCESS_KEY) {
            self.secret_access_key = Some(secret);
        }
        if let Some(role) = get(ENV_ROLE_ARN) {
            self.role_arn = Some(role);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.is_empty() {
            return Err(ConfigError::Missing("region"));
        }
        // Static keys come in pairs
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(ConfigError::Missing(
                "accessKeyId and secretAccessKey must be set together",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_from_json() {
        let config = CloudConfig::from_json(
            r#"{"region": "eu-west-1", "accessKeyId": "AKID", "secretAccessKey": "s3cr3t"}"#,
        )
        .unwrap();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.access_key_id.as_deref(), Some("AKID"));
        assert!(config.role_arn.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = CloudConfig::from_json(r#"{"region": "x", "zone": "y"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overrides() {
        let mut config = CloudConfig::from_json(r#"{"region": "us-east-1"}"#).unwrap();
        let env = HashMap::from([
            (ENV_REGION, "us-west-2"),
            (ENV_ROLE_ARN, "arn:role/csi"),
            (ENV_ACCESS_KEY_ID, ""),
        ]);
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.region, "us-west-2");
        assert_eq!(config.role_arn.as_deref(), Some("arn:role/csi"));
        // Empty values do not override
        assert!(config.access_key_id.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            CloudConfig::default().validate(),
            Err(ConfigError::Missing("region"))
        ));

        let half_keys = CloudConfig {
            region: "r".into(),
            access_key_id: Some("AKID".into()),
            ..CloudConfig::default()
        };
        assert!(half_keys.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = CloudConfig {
            region: "r".into(),
            access_key_id: Some("AKID".into()),
            secret_access_key: Some("hunter2".into()),
            role_arn: None,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"region": "ap-south-1"}}"#).unwrap();

        let config = CloudConfig::load_with(Some(file.path()), |_| None).unwrap();
        assert_eq!(config.region, "ap-south-1");

        let config = CloudConfig::load_with(Some(file.path()), |key| {
            (key == ENV_REGION).then(|| "eu-west-1".to_string())
        })
        .unwrap();
        assert_eq!(config.region, "eu-west-1");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(CloudConfig::load_with(Some(&path), |_| None).is_err());
    }
}
