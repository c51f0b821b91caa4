//! # config
//!
//! Decodes the network config handed to an IPAM plugin into an
//! [`IpamConfig`]: the ordered range sets to allocate from, statically
//! requested addresses, routes, & where the lease store lives.
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use cni_core::{
    error::{ERR_DECODING_FAILURE, ERR_INVALID_NETWORK_CONFIG},
    version, PluginError, Route,
};
use thiserror::Error;
use tracing::debug;

pub mod range;
pub mod wire;

pub use range::{Range, RangeError, RangeSet};

/// where leases are kept when `dataDir` is not set
pub static DEFAULT_DATA_DIR: &str = "/var/lib/cni/networks";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Args(#[from] cni_args::ArgsError),
    #[error("IPAM config missing 'ipam' key")]
    MissingIpam,
    #[error("no IP ranges specified")]
    NoRanges,
    #[error("invalid range set {index}: {source}")]
    RangeSet { index: usize, source: RangeError },
    #[error("range set {0} overlaps with {1}")]
    Overlap(usize, usize),
    #[error("CNI version {0} does not support more than 1 address per family")]
    TooManyRanges(String),
}

impl From<ConfigError> for PluginError {
    fn from(err: ConfigError) -> Self {
        let code = match err {
            ConfigError::Decode(_) => ERR_DECODING_FAILURE,
            _ => ERR_INVALID_NETWORK_CONFIG,
        };
        PluginError::new(code, err.to_string())
    }
}

/// IPAM config, validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamConfig {
    name: String,
    data_dir: PathBuf,
    ranges: Vec<RangeSet>,
    ip_args: Vec<IpAddr>,
    resolv_conf: Option<PathBuf>,
    routes: Vec<Route>,
}

impl IpamConfig {
    /// Decode a network config plus `CNI_ARGS`. Returns the config & the
    /// `cniVersion` it was written for.
    pub fn load(bytes: &[u8], env_args: &str) -> Result<(Self, String), ConfigError> {
        let conf: wire::NetConf = serde_json::from_slice(bytes)?;
        let ipam = conf.ipam.ok_or(ConfigError::MissingIpam)?;

        // requested IPs: CNI_ARGS, then args in the config, then runtime capabilities
        let mut ip_args = cni_args::IpamEnvArgs::parse(env_args)?.ips;
        for ip in conf
            .args
            .and_then(|args| args.cni)
            .map(|cni| cni.ips)
            .unwrap_or_default()
            .iter()
            .chain(conf.runtime_config.ips.iter())
        {
            ip_args.push(cni_args::parse_ip(ip)?);
        }
        let ip_args = ip_args.into_iter().map(|ip| ip.to_canonical()).collect();

        // a single range on the ipam object comes first
        let mut sets = Vec::with_capacity(ipam.ranges.len() + 1);
        if ipam.range.subnet.is_some() {
            sets.push(vec![ipam.range]);
        }
        sets.extend(ipam.ranges);
        if sets.is_empty() {
            return Err(ConfigError::NoRanges);
        }

        let ranges = sets
            .into_iter()
            .enumerate()
            .map(|(index, set)| {
                set.into_iter()
                    .map(Range::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .and_then(RangeSet::new)
                    .map_err(|source| ConfigError::RangeSet { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // versions before 0.3.0 only had room for one address per family
        let num_v4 = ranges.iter().filter(|set| set.is_ipv4()).count();
        let num_v6 = ranges.len() - num_v4;
        if (num_v4 > 1 || num_v6 > 1)
            && !version::greater_than_or_equal(&conf.cni_version, "0.3.0").unwrap_or(false)
        {
            return Err(ConfigError::TooManyRanges(conf.cni_version));
        }

        for (i, a) in ranges.iter().enumerate() {
            if let Some(j) = ranges[i + 1..].iter().position(|b| a.overlaps(b)) {
                return Err(ConfigError::Overlap(i, i + j + 1));
            }
        }

        let config = Self {
            name: conf.name,
            data_dir: ipam
                .data_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            ranges,
            ip_args,
            resolv_conf: ipam.resolv_conf,
            routes: ipam.routes,
        };
        debug!(?config);
        Ok((config, conf.cni_version))
    }

    /// network name, the store is partitioned by it
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
    /// range sets in allocation order, index is the range id
    pub fn ranges(&self) -> &[RangeSet] {
        &self.ranges
    }
    /// statically requested addresses
    pub fn ip_args(&self) -> &[IpAddr] {
        &self.ip_args
    }
    pub fn resolv_conf(&self) -> Option<&Path> {
        self.resolv_conf.as_deref()
    }
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
