//! # cni-core
//!
//! Shared plumbing for exec-invoked CNI plugins: reading the invocation from
//! the environment & stdin, version negotiation, and the versioned result and
//! error documents written back to the runtime.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use ipnet;
pub use serde_json;
pub use tokio;
pub use tracing;

pub use crate::{
    error::PluginError,
    skel::{CmdArgs, Command, Plugin},
    types::{CniResult, Dns, IpConfig, Route},
};

pub mod config;
pub mod error;
pub mod prelude;
pub mod skel;
pub mod types;
pub mod version;
