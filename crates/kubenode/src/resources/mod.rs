//! Typed resources shared between the node controllers through the
//! [`State`](kubenode_state::State).
mod affiliate;
mod endpoint;
mod manifest;
mod secrets;
mod static_pod;

pub use affiliate::{
    AffiliateSpec, ControlPlane, IpPrefix, KubeSpanAffiliateSpec, MachineType,
    ParseIpPrefixError,
};
pub use endpoint::{EndpointSpec, CONTROLPLANE_ENDPOINT_ID};
pub use manifest::{ManifestSpec, ManifestStatusSpec, MANIFEST_STATUS_ID};
pub use secrets::{SecretsStatusSpec, KUBERNETES_CLIENT_SECRETS, STATIC_POD_SECRETS};
pub use static_pod::{StaticPodSpec, StaticPodStatusSpec};

/// Namespace of resources driving the local control plane.
pub const CONTROLPLANE_NAMESPACE: &str = "controlplane";
/// Namespace of cluster membership resources.
pub const CLUSTER_NAMESPACE: &str = "cluster";
