use serde::{Deserialize, Serialize};

use kubenode_state::Spec;

use super::CONTROLPLANE_NAMESPACE;

/// Consumer ID for the admin client credentials used against the API server.
pub const KUBERNETES_CLIENT_SECRETS: &str = "kubernetes-client";
/// Consumer ID for the secrets mounted by control plane static pods.
pub const STATIC_POD_SECRETS: &str = "static-pods";

/// Whether rendered secrets for a consumer are on disk, and which version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsStatusSpec {
    /// Every secret file is present.
    pub ready: bool,
    /// Digest of the secret contents, changes on rotation.
    pub version: String,
}

impl Spec for SecretsStatusSpec {
    const NAMESPACE: &'static str = CONTROLPLANE_NAMESPACE;
    const TYPE: &'static str = "SecretStatuses";
}
