//! Mapping between [`AffiliateSpec`] and Kubernetes `Node` annotations.
//!
//! The annotation keys are the wire format of cluster discovery and must stay
//! byte compatible across nodes.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Node;

use crate::resources::{AffiliateSpec, ControlPlane, KubeSpanAffiliateSpec, MachineType};

/// Node ID of the affiliate.
pub const NODE_ID: &str = "cluster.talos.dev/node-id";
/// Comma separated addresses of the node.
pub const SELF_IPS: &str = "networking.talos.dev/self-ips";
/// API server port of a control plane node.
pub const API_SERVER_PORT: &str = "networking.talos.dev/api-server-port";
/// KubeSpan overlay address.
pub const KUBESPAN_IP: &str = "networking.talos.dev/kubespan-ip";
/// KubeSpan WireGuard public key.
pub const KUBESPAN_PUBLIC_KEY: &str = "networking.talos.dev/kubespan-public-key";
/// Comma separated prefixes routed to the node over KubeSpan.
pub const KUBESPAN_ASSIGNED_PREFIXES: &str = "networking.talos.dev/assigned-prefixes";
/// Comma separated `ip:port` WireGuard endpoints.
pub const KUBESPAN_KNOWN_ENDPOINTS: &str = "networking.talos.dev/kubespan-known-endpoints";
/// Comma separated prefixes peers must not route over KubeSpan.
pub const KUBESPAN_EXCLUDE_ADVERTISED_NETWORKS: &str =
    "networking.talos.dev/kubespan-exclude-advertised-networks";

/// Every annotation key owned by discovery.
pub const ALL: &[&str] = &[
    NODE_ID,
    SELF_IPS,
    API_SERVER_PORT,
    KUBESPAN_IP,
    KUBESPAN_PUBLIC_KEY,
    KUBESPAN_ASSIGNED_PREFIXES,
    KUBESPAN_KNOWN_ENDPOINTS,
    KUBESPAN_EXCLUDE_ADVERTISED_NETWORKS,
];

/// Label marking control plane nodes.
pub const LABEL_NODE_ROLE_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
/// Legacy spelling of [`LABEL_NODE_ROLE_CONTROL_PLANE`].
pub const LABEL_NODE_ROLE_MASTER: &str = "node-role.kubernetes.io/master";

const NODE_ADDRESS_HOSTNAME: &str = "Hostname";

/// Renders the annotations describing `affiliate`.
///
/// Every discovery key is present; an empty value means the annotation has to
/// be removed from the node.
pub fn annotations_from_affiliate(affiliate: &AffiliateSpec) -> BTreeMap<String, String> {
    let kubespan = affiliate.kubespan.clone().unwrap_or_default();

    let values = [
        (NODE_ID, affiliate.node_id.clone()),
        (SELF_IPS, join(&affiliate.addresses)),
        (
            API_SERVER_PORT,
            affiliate
                .control_plane
                .as_ref()
                .map(|cp| cp.api_server_port.to_string())
                .unwrap_or_default(),
        ),
        (
            KUBESPAN_IP,
            kubespan.address.map(|a| a.to_string()).unwrap_or_default(),
        ),
        (KUBESPAN_PUBLIC_KEY, kubespan.public_key.clone()),
        (KUBESPAN_ASSIGNED_PREFIXES, join(&kubespan.additional_addresses)),
        (KUBESPAN_KNOWN_ENDPOINTS, join(&kubespan.endpoints)),
        (
            KUBESPAN_EXCLUDE_ADVERTISED_NETWORKS,
            join(&kubespan.exclude_advertised_networks),
        ),
    ];

    values
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Rebuilds an affiliate from a node.
///
/// Nodes without a node ID annotation haven't joined discovery and yield
/// `None`. Malformed list elements are dropped.
pub fn affiliate_from_node(node: &Node) -> Option<AffiliateSpec> {
    let empty = BTreeMap::new();
    let annotations = node.metadata.annotations.as_ref().unwrap_or(&empty);
    let annotation = |key: &str| annotations.get(key).map(String::as_str);

    let node_id = annotation(NODE_ID).filter(|id| !id.is_empty())?;

    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    let control_plane = labels.contains_key(LABEL_NODE_ROLE_CONTROL_PLANE)
        || labels.contains_key(LABEL_NODE_ROLE_MASTER);

    let status = node.status.as_ref();
    let hostname = status
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|a| a.type_ == NODE_ADDRESS_HOSTNAME)
                .map(|a| a.address.clone())
        })
        .unwrap_or_default();
    let operating_system = status
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.os_image.clone())
        .unwrap_or_default();

    let kubespan = KubeSpanAffiliateSpec {
        public_key: annotation(KUBESPAN_PUBLIC_KEY).unwrap_or_default().to_string(),
        address: annotation(KUBESPAN_IP).and_then(|ip| ip.trim().parse().ok()),
        additional_addresses: parse_list(annotation(KUBESPAN_ASSIGNED_PREFIXES)),
        endpoints: parse_list(annotation(KUBESPAN_KNOWN_ENDPOINTS)),
        exclude_advertised_networks: parse_list(annotation(KUBESPAN_EXCLUDE_ADVERTISED_NETWORKS)),
    };

    Some(AffiliateSpec {
        node_id: node_id.to_string(),
        hostname,
        nodename: node.metadata.name.clone().unwrap_or_default(),
        machine_type: if control_plane {
            MachineType::ControlPlane
        } else {
            MachineType::Worker
        },
        addresses: parse_list(annotation(SELF_IPS)),
        operating_system,
        kubespan: if kubespan.is_empty() {
            None
        } else {
            Some(kubespan)
        },
        control_plane: annotation(API_SERVER_PORT)
            .and_then(|port| port.trim().parse().ok())
            .map(|api_server_port| ControlPlane { api_server_port }),
    })
}

fn join<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a comma separated list, silently skipping elements which don't
/// parse.
fn parse_list<T: FromStr>(value: Option<&str>) -> Vec<T> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}
