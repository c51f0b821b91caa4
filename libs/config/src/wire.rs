//! the network config as it arrives on stdin
use std::{net::IpAddr, path::PathBuf};

use cni_core::Route;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// top-level network config, only the keys an IPAM plugin reads
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    pub ipam: Option<Ipam>,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
    pub args: Option<Args>,
}

/// capabilities passed by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Args {
    pub cni: Option<IpamArgs>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpamArgs {
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipam {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// older configs put a single range directly on the ipam object
    #[serde(flatten)]
    pub range: Range,
    #[serde(default)]
    pub ranges: Vec<Vec<Range>>,
    #[serde(default)]
    pub routes: Vec<Route>,
    pub data_dir: Option<PathBuf>,
    pub resolv_conf: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub subnet: Option<IpNet>,
    pub range_start: Option<IpAddr>,
    pub range_end: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
}
