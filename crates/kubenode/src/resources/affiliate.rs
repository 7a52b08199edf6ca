use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use kubenode_state::Spec;

use super::CLUSTER_NAMESPACE;

/// Role of a machine in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Not known yet.
    Unknown,
    /// The control plane node which bootstrapped the cluster.
    Init,
    /// A control plane node.
    #[serde(alias = "control-plane")]
    ControlPlane,
    /// A worker node.
    Worker,
}

impl MachineType {
    /// Whether the machine runs the Kubernetes control plane.
    pub fn is_control_plane(&self) -> bool {
        matches!(self, MachineType::Init | MachineType::ControlPlane)
    }
}

impl Default for MachineType {
    fn default() -> Self {
        MachineType::Unknown
    }
}

/// Identity record of a cluster member, either this node or a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateSpec {
    /// Opaque, cluster-unique node identifier.
    pub node_id: String,
    /// DNS hostname as reported by the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Name the kubelet registers the node under.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nodename: String,
    /// Role of the node.
    #[serde(default)]
    pub machine_type: MachineType,
    /// Addresses advertised by the node, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<IpAddr>,
    /// Free-form OS descriptor.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operating_system: String,
    /// KubeSpan identity, when the node takes part in the overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubespan: Option<KubeSpanAffiliateSpec>,
    /// Set on control plane nodes running an API server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlane>,
}

impl Spec for AffiliateSpec {
    const NAMESPACE: &'static str = CLUSTER_NAMESPACE;
    const TYPE: &'static str = "Affiliates";
}

/// KubeSpan overlay identity of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeSpanAffiliateSpec {
    /// WireGuard public key, base64.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    /// Overlay address of the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    /// Prefixes routed to the node over the overlay.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_addresses: Vec<IpPrefix>,
    /// WireGuard endpoints of the node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<SocketAddr>,
    /// Networks which peers should not route over the overlay.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_advertised_networks: Vec<IpPrefix>,
}

impl KubeSpanAffiliateSpec {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self == &KubeSpanAffiliateSpec::default()
    }
}

/// Control plane details of a control plane affiliate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlane {
    /// Port the API server listens on.
    pub api_server_port: u16,
}

/// An IP network in CIDR notation, e.g. `10.244.3.1/24`.
///
/// The address part keeps host bits, as assigned prefixes carry the address of
/// the node within the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

/// Error returned when parsing an [`IpPrefix`] fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid IP prefix {0:?}")]
pub struct ParseIpPrefixError(String);

impl IpPrefix {
    /// Creates a prefix, checking the length against the address family.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, ParseIpPrefixError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(ParseIpPrefixError(format!("{}/{}", addr, len)));
        }
        Ok(IpPrefix { addr, len })
    }

    /// Address part of the prefix.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.len
    }
}

impl FromStr for IpPrefix {
    type Err = ParseIpPrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIpPrefixError(s.to_string());
        let (addr, len) = s.split_once('/').ok_or_else(err)?;
        let addr: IpAddr = addr.parse().map_err(|_| err())?;
        // Leading '+' and the like are accepted by u8::from_str, but not by CIDR.
        if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let len: u8 = len.parse().map_err(|_| err())?;
        IpPrefix::new(addr, len)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
