//! protocol version negotiation
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, ERR_DECODING_FAILURE, ERR_INCOMPATIBLE_VERSION};

/// versions this plugin can read configs for & write results in
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// a config with no `cniVersion` is treated as this version
pub const DEFAULT_CONFIG_VERSION: &str = "0.1.0";

/// output of the `VERSION` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// the version this document is written in
    pub cni_version: String,
    /// every version we support
    pub supported_versions: Vec<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: crate::types::IMPLEMENTED_SPEC_VERSION.to_owned(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// is `version` one of [`SUPPORTED_VERSIONS`]
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// parse `major[.minor[.patch]]`
pub fn parse(version: &str) -> Result<(u64, u64, u64), PluginError> {
    let invalid = || PluginError::new(ERR_INCOMPATIBLE_VERSION, format!("invalid version {version:?}"));
    let mut parts = version.split('.');
    let mut next = |required: bool| -> Result<u64, PluginError> {
        match parts.next() {
            Some(p) => p.parse::<u64>().map_err(|_| invalid()),
            None if required => Err(invalid()),
            None => Ok(0),
        }
    };
    let parsed = (next(true)?, next(false)?, next(false)?);
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(parsed)
}

/// `version >= other`
pub fn greater_than_or_equal(version: &str, other: &str) -> Result<bool, PluginError> {
    Ok(parse(version)? >= parse(other)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfVersion {
    #[serde(default)]
    cni_version: String,
}

/// pull only the `cniVersion` out of a network config
pub fn config_version(stdin: &[u8]) -> Result<String, PluginError> {
    let conf: ConfVersion = serde_json::from_slice(stdin).map_err(|err| {
        PluginError::new(
            ERR_DECODING_FAILURE,
            format!("decoding version from network config: {err}"),
        )
    })?;
    Ok(if conf.cni_version.is_empty() {
        DEFAULT_CONFIG_VERSION.to_owned()
    } else {
        conf.cni_version
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(parse("1.0.0").unwrap(), (1, 0, 0));
        assert_eq!(parse("0.3").unwrap(), (0, 3, 0));
        assert_eq!(parse("2").unwrap(), (2, 0, 0));
        assert!(parse("").is_err());
        assert!(parse("1.x").is_err());
        assert!(parse("1.0.0.1").is_err());
    }

    #[test]
    fn test_compare() {
        assert!(greater_than_or_equal("0.4.0", "0.4.0").unwrap());
        assert!(greater_than_or_equal("1.0.0", "0.4.0").unwrap());
        assert!(!greater_than_or_equal("0.3.1", "0.4.0").unwrap());
    }

    #[test]
    fn test_config_version() {
        let v = config_version(br#"{"cniVersion": "0.3.1", "name": "n"}"#).unwrap();
        assert_eq!(v, "0.3.1");
        let v = config_version(br#"{"name": "n"}"#).unwrap();
        assert_eq!(v, DEFAULT_CONFIG_VERSION);
        let err = config_version(b"not json").unwrap_err();
        assert_eq!(err.code, ERR_DECODING_FAILURE);
    }

    #[test]
    fn test_version_info() {
        let s = serde_json::to_value(VersionInfo::default()).unwrap();
        assert_eq!(s["cniVersion"], "1.0.0");
        assert_eq!(s["supportedVersions"].as_array().unwrap().len(), 6);
    }
}
