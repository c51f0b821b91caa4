//! cni-core prelude

pub use crate::{
    anyhow::{self, anyhow, bail, Context, Result},
    async_trait,
    error::PluginError,
    skel::{CmdArgs, Plugin},
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
    types::{CniResult, Dns, IpConfig, Route},
};
