use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use kubenode_state::Spec;

use super::CONTROLPLANE_NAMESPACE;

/// A pod the kubelet should run from its manifest directory.
///
/// The pod is kept schema-less; see [`crate::static_pod::codec`] for the typed
/// projection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticPodSpec {
    /// The pod object, as it would appear in a manifest file.
    pub pod: Map<String, Value>,
}

impl Spec for StaticPodSpec {
    const NAMESPACE: &'static str = CONTROLPLANE_NAMESPACE;
    const TYPE: &'static str = "StaticPods";
}

/// Pod status reported by the kubelet for a [`StaticPodSpec`] with the same ID.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticPodStatusSpec {
    /// The pod `status` object.
    pub pod_status: Map<String, Value>,
}

impl Spec for StaticPodStatusSpec {
    const NAMESPACE: &'static str = CONTROLPLANE_NAMESPACE;
    const TYPE: &'static str = "StaticPodStatuses";
}
