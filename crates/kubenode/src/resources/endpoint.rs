use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use kubenode_state::Spec;

use super::CONTROLPLANE_NAMESPACE;

/// ID of the singleton control plane [`EndpointSpec`].
pub const CONTROLPLANE_ENDPOINT_ID: &str = "controlplane";

/// Addresses through which the API server can be reached.
///
/// Always sorted and free of duplicates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Sorted, unique addresses.
    pub addresses: Vec<IpAddr>,
}

impl EndpointSpec {
    /// Builds a normalized spec from any collection of addresses.
    pub fn from_addresses(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        let set: BTreeSet<IpAddr> = addresses.into_iter().collect();
        EndpointSpec {
            addresses: set.into_iter().collect(),
        }
    }
}

impl Spec for EndpointSpec {
    const NAMESPACE: &'static str = CONTROLPLANE_NAMESPACE;
    const TYPE: &'static str = "Endpoints";
}
