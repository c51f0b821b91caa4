//! convenience fns for parsing `CNI_ARGS`, the `key=value;key=value` string a
//! runtime passes to every plugin invocation
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
use std::net::IpAddr;

use thiserror::Error;

/// key kubernetes puts the pod namespace under
pub const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
/// key kubernetes puts the pod name under
pub const K8S_POD_NAME: &str = "K8S_POD_NAME";
/// key carrying requested static IPs
pub const IP: &str = "IP";
/// when true, keys a parser does not know are skipped instead of rejected
pub const IGNORE_UNKNOWN: &str = "IgnoreUnknown";

/// namespace + name must fit in the lease store's lookup key
pub const MAX_POD_IDENTITY_LEN: usize = 230;

/// Errors from parsing `CNI_ARGS`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgsError {
    /// a pair without `=`
    #[error("ARGS: invalid pair {0:?}")]
    InvalidPair(String),
    /// namespace + name too long
    #[error("ARGS: length of pod ns and name exceed the length limit")]
    TooLong,
    /// keys we don't know and `IgnoreUnknown` was not set
    #[error("ARGS: unknown args {0:?}")]
    Unknown(Vec<String>),
    /// an `IP` value that is not an address
    #[error("ARGS: invalid IP {0:?}")]
    InvalidIp(String),
    /// a boolean that isn't one
    #[error("ARGS: invalid boolean value {0:?} for {1}")]
    InvalidBool(String, String),
}

/// Splits `args` on `;`, then each pair on the first `=`. An empty string has no pairs.
/// # Examples
/// ```
/// let pairs = cni_args::parse_pairs("A=1;B=x=y").unwrap();
/// assert_eq!(pairs, vec![("A", "1"), ("B", "x=y")]);
///
/// assert!(cni_args::parse_pairs("").unwrap().is_empty());
/// assert!(cni_args::parse_pairs("A=1;B").is_err());
/// ```
pub fn parse_pairs(args: &str) -> Result<Vec<(&str, &str)>, ArgsError> {
    if args.is_empty() {
        return Ok(Vec::new());
    }
    args.split(';')
        .map(|pair| {
            pair.split_once('=')
                .ok_or_else(|| ArgsError::InvalidPair(pair.to_owned()))
        })
        .collect()
}

/// parses `1`/`0`/`true`/`false` (any case)
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ArgsError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ArgsError::InvalidBool(value.to_owned(), key.to_owned())),
    }
}

/// The pod a container belongs to, empty when the runtime didn't say
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodIdentity {
    /// pod namespace
    pub namespace: String,
    /// pod name
    pub name: String,
}

impl PodIdentity {
    /// both namespace & name are known
    pub fn is_known(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty()
    }
}

/// Pull the pod namespace & name out of `CNI_ARGS`. Other keys are ignored.
/// # Examples
/// ```
/// let pod = cni_args::resolve_pod_identity("IgnoreUnknown=1;K8S_POD_NAMESPACE=ns1;K8S_POD_NAME=pod1").unwrap();
/// assert_eq!(pod.namespace, "ns1");
/// assert_eq!(pod.name, "pod1");
///
/// let pod = cni_args::resolve_pod_identity("").unwrap();
/// assert!(!pod.is_known());
/// ```
pub fn resolve_pod_identity(args: &str) -> Result<PodIdentity, ArgsError> {
    let mut pod = PodIdentity::default();
    for (key, value) in parse_pairs(args)? {
        match key {
            K8S_POD_NAMESPACE => pod.namespace = value.to_owned(),
            K8S_POD_NAME => pod.name = value.to_owned(),
            _ => {}
        }
    }
    if pod.namespace.len() + pod.name.len() > MAX_POD_IDENTITY_LEN {
        return Err(ArgsError::TooLong);
    }
    Ok(pod)
}

/// The args an IPAM plugin understands. Unknown keys are an error unless
/// `IgnoreUnknown` is true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpamEnvArgs {
    /// `IgnoreUnknown`
    pub ignore_unknown: bool,
    /// `IP=a[,b]`, prefixes are dropped
    pub ips: Vec<IpAddr>,
}

impl IpamEnvArgs {
    /// parse `CNI_ARGS`
    /// # Examples
    /// ```
    /// let args = cni_args::IpamEnvArgs::parse("IgnoreUnknown=1;IP=10.0.0.5/24,10.1.0.5;FOO=bar").unwrap();
    /// assert_eq!(args.ips.len(), 2);
    ///
    /// assert!(cni_args::IpamEnvArgs::parse("FOO=bar").is_err());
    /// ```
    pub fn parse(args: &str) -> Result<Self, ArgsError> {
        let pairs = parse_pairs(args)?;
        let mut out = IpamEnvArgs::default();
        // IgnoreUnknown may come after the keys it applies to
        for (key, value) in &pairs {
            if *key == IGNORE_UNKNOWN {
                out.ignore_unknown = parse_bool(key, value)?;
            }
        }
        let mut unknown = Vec::new();
        for (key, value) in pairs {
            match key {
                IGNORE_UNKNOWN => {}
                IP => {
                    for ip in value.split(',').filter(|ip| !ip.is_empty()) {
                        out.ips.push(parse_ip(ip)?);
                    }
                }
                other if !out.ignore_unknown => unknown.push(other.to_owned()),
                _ => {}
            }
        }
        if !unknown.is_empty() {
            return Err(ArgsError::Unknown(unknown));
        }
        Ok(out)
    }
}

/// an address, optionally followed by `/prefix` which is discarded
pub fn parse_ip(s: &str) -> Result<IpAddr, ArgsError> {
    let addr = s.split_once('/').map_or(s, |(addr, _prefix)| addr);
    addr.trim()
        .parse::<IpAddr>()
        .map_err(|_| ArgsError::InvalidIp(s.to_owned()))
}
