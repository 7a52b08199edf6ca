use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use kubenode_state::Spec;

use super::CONTROLPLANE_NAMESPACE;

/// ID of the singleton [`ManifestStatusSpec`] resource.
pub const MANIFEST_STATUS_ID: &str = "manifests";

/// A bundle of cluster objects, kept as untyped trees in document order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    /// Objects to apply, in order.
    pub items: Vec<Map<String, Value>>,
}

impl Spec for ManifestSpec {
    const NAMESPACE: &'static str = CONTROLPLANE_NAMESPACE;
    const TYPE: &'static str = "Manifests";
}

/// What the manifest reconciler managed to apply during its last pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStatusSpec {
    /// Identities (`apiVersion/Kind/namespace/name`) of applied objects.
    pub manifests_applied: Vec<String>,
    /// `"<identity>: <message>"` for every object which failed permanently.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Spec for ManifestStatusSpec {
    const NAMESPACE: &'static str = CONTROLPLANE_NAMESPACE;
    const TYPE: &'static str = "ManifestStatuses";
}
