//! The error document every plugin in the family reports failures with.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Incompatible CNI version
pub const ERR_INCOMPATIBLE_VERSION: u32 = 1;
/// Container unknown or does not exist
pub const ERR_UNKNOWN_CONTAINER: u32 = 3;
/// Invalid necessary environment variables
pub const ERR_INVALID_ENV: u32 = 4;
/// I/O failure
pub const ERR_IO_FAILURE: u32 = 5;
/// Failed to decode content
pub const ERR_DECODING_FAILURE: u32 = 6;
/// Invalid network config
pub const ERR_INVALID_NETWORK_CONFIG: u32 = 7;
/// Anything that was not reported with a more specific code
pub const ERR_INTERNAL: u32 = 999;

/// A typed protocol error. Plugins may return this (wrapped in `anyhow`) to
/// pick the code reported to the runtime; every other error is reported as
/// [`ERR_INTERNAL`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{msg}")]
pub struct PluginError {
    /// numeric error code
    pub code: u32,
    /// short human readable message
    pub msg: String,
    /// longer description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl PluginError {
    /// new error with no details
    pub fn new(code: u32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            details: String::new(),
        }
    }

    /// attach details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// find a `PluginError` anywhere in the chain, or fall back to
    /// [`ERR_INTERNAL`] with the full cause chain as the message
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<PluginError>() {
            Some(err) => err.clone(),
            None => Self::new(ERR_INTERNAL, format!("{err:#}")),
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ERR_DECODING_FAILURE, err.to_string())
    }
}
