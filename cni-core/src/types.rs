//! Result types shared by the plugin family, and their encoding for each
//! supported protocol version.
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, ERR_INCOMPATIBLE_VERSION};

/// results are built at this version, then converted to what the runtime asked for
pub const IMPLEMENTED_SPEC_VERSION: &str = "1.0.0";

/// a static route handed back to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    /// destination prefix
    pub dst: IpNet,
    /// next hop, the runtime picks the default gateway when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// resolver settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    /// nameserver addresses, in priority order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    /// local domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// search list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    /// resolver options
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    /// true when nothing is set
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// one allocated address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// the address with the prefix length of the subnet it came from
    pub address: IpNet,
    /// gateway of that subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

/// the result of a successful ADD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniResult {
    /// version the result was built at
    pub cni_version: String,
    /// allocated addresses
    pub ips: Vec<IpConfig>,
    /// routes
    pub routes: Vec<Route>,
    /// resolver settings
    pub dns: Option<Dns>,
}

impl Default for CniResult {
    fn default() -> Self {
        Self {
            cni_version: IMPLEMENTED_SPEC_VERSION.to_owned(),
            ips: Vec::new(),
            routes: Vec::new(),
            dns: None,
        }
    }
}

impl CniResult {
    /// encode for `version`. Fails if the version is not one we can write.
    pub fn encode(&self, version: &str) -> Result<serde_json::Value, PluginError> {
        let dns = self.dns.as_ref().filter(|dns| !dns.is_empty());
        let doc = match version {
            "1.0.0" => serde_json::to_value(Current {
                cni_version: version,
                ips: self.ips.iter().map(|ip| CurrentIp { version: None, ip }).collect(),
                routes: &self.routes,
                dns,
            })?,
            "0.3.0" | "0.3.1" | "0.4.0" => serde_json::to_value(Current {
                cni_version: version,
                ips: self
                    .ips
                    .iter()
                    .map(|ip| CurrentIp {
                        version: Some(family(ip.address.addr())),
                        ip,
                    })
                    .collect(),
                routes: &self.routes,
                dns,
            })?,
            "0.1.0" | "0.2.0" => serde_json::to_value(Legacy {
                cni_version: version,
                ip4: self.legacy_ip(|ip| ip.is_ipv4()),
                ip6: self.legacy_ip(|ip| ip.is_ipv6()),
                dns,
            })?,
            other => {
                return Err(PluginError::new(
                    ERR_INCOMPATIBLE_VERSION,
                    format!("cannot convert result to version {other:?}"),
                ))
            }
        };
        Ok(doc)
    }

    /// legacy results carry the first address of a family, with that
    /// family's routes nested in it
    fn legacy_ip(&self, is_family: impl Fn(&IpAddr) -> bool) -> Option<LegacyIp<'_>> {
        let ip = self.ips.iter().find(|ip| is_family(&ip.address.addr()))?;
        Some(LegacyIp {
            ip: ip.address,
            gateway: ip.gateway,
            routes: self
                .routes
                .iter()
                .filter(|r| is_family(&r.dst.addr()))
                .collect(),
        })
    }
}

fn family(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "4",
        IpAddr::V6(_) => "6",
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Current<'a> {
    cni_version: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ips: Vec<CurrentIp<'a>>,
    #[serde(skip_serializing_if = "<[Route]>::is_empty")]
    routes: &'a [Route],
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<&'a Dns>,
}

#[derive(Serialize)]
struct CurrentIp<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'static str>,
    #[serde(flatten)]
    ip: &'a IpConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Legacy<'a> {
    cni_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip4: Option<LegacyIp<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip6: Option<LegacyIp<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<&'a Dns>,
}

#[derive(Serialize)]
struct LegacyIp<'a> {
    ip: IpNet,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<IpAddr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<&'a Route>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> CniResult {
        CniResult {
            ips: vec![
                IpConfig {
                    address: "10.1.2.2/24".parse().unwrap(),
                    gateway: Some("10.1.2.1".parse().unwrap()),
                },
                IpConfig {
                    address: "2001:db8:1::2/64".parse().unwrap(),
                    gateway: Some("2001:db8:1::1".parse().unwrap()),
                },
            ],
            routes: vec![
                Route {
                    dst: "0.0.0.0/0".parse().unwrap(),
                    gw: None,
                },
                Route {
                    dst: "::/0".parse().unwrap(),
                    gw: Some("2001:db8:1::1".parse().unwrap()),
                },
            ],
            dns: Some(Dns {
                nameservers: vec!["8.8.8.8".into()],
                ..Dns::default()
            }),
            ..CniResult::default()
        }
    }

    #[test]
    fn test_encode_current() {
        let doc = sample().encode("1.0.0").unwrap();
        assert_eq!(
            doc,
            json!({
                "cniVersion": "1.0.0",
                "ips": [
                    {"address": "10.1.2.2/24", "gateway": "10.1.2.1"},
                    {"address": "2001:db8:1::2/64", "gateway": "2001:db8:1::1"}
                ],
                "routes": [
                    {"dst": "0.0.0.0/0"},
                    {"dst": "::/0", "gw": "2001:db8:1::1"}
                ],
                "dns": {"nameservers": ["8.8.8.8"]}
            })
        );
    }

    #[test]
    fn test_encode_versioned_ips() {
        let doc = sample().encode("0.4.0").unwrap();
        assert_eq!(doc["cniVersion"], "0.4.0");
        assert_eq!(doc["ips"][0]["version"], "4");
        assert_eq!(doc["ips"][1]["version"], "6");
        assert_eq!(doc["ips"][1]["address"], "2001:db8:1::2/64");
    }

    #[test]
    fn test_encode_legacy() {
        let doc = sample().encode("0.2.0").unwrap();
        assert_eq!(
            doc,
            json!({
                "cniVersion": "0.2.0",
                "ip4": {
                    "ip": "10.1.2.2/24",
                    "gateway": "10.1.2.1",
                    "routes": [{"dst": "0.0.0.0/0"}]
                },
                "ip6": {
                    "ip": "2001:db8:1::2/64",
                    "gateway": "2001:db8:1::1",
                    "routes": [{"dst": "::/0", "gw": "2001:db8:1::1"}]
                },
                "dns": {"nameservers": ["8.8.8.8"]}
            })
        );
    }

    #[test]
    fn test_empty_dns_omitted() {
        let mut res = sample();
        res.dns = Some(Dns::default());
        let doc = res.encode("1.0.0").unwrap();
        assert!(doc.get("dns").is_none());
    }

    #[test]
    fn test_encode_unknown_version() {
        let err = sample().encode("9.9.9").unwrap_err();
        assert_eq!(err.code, ERR_INCOMPATIBLE_VERSION);
    }
}
