//! Pod status as seen by the local kubelet.
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use url::Url;

use crate::error::ApiError;

/// Source of the pods the kubelet is running.
#[async_trait]
pub trait KubeletPods: Send + Sync + 'static {
    /// Lists every pod known to the kubelet, mirror pods included.
    async fn pods(&self) -> Result<Vec<Pod>, ApiError>;
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// Reads pods from the kubelet's read-only HTTP endpoint.
#[derive(Clone)]
pub struct KubeletClient {
    client: reqwest::Client,
    pods_url: Url,
}

impl KubeletClient {
    /// `base` is the kubelet endpoint, e.g. `http://127.0.0.1:10255`.
    pub fn new(base: &Url) -> anyhow::Result<Self> {
        Ok(KubeletClient {
            client: reqwest::Client::new(),
            pods_url: base.join("pods")?,
        })
    }
}

#[async_trait]
impl KubeletPods for KubeletClient {
    async fn pods(&self) -> Result<Vec<Pod>, ApiError> {
        let list: PodList = self
            .client
            .get(self.pods_url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.items)
    }
}

/// Whether the kubelet created the pod from a manifest file. Pods created
/// through the API server carry owner references.
pub fn is_static(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.is_empty())
        .unwrap_or(true)
}

/// Whether `pod` is the kubelet's instance of the static pod declared as
/// `namespace/name` on node `node_name`. The kubelet suffixes mirror pods with
/// the node name.
pub fn is_instance_of(pod: &Pod, namespace: &str, name: &str, node_name: &str) -> bool {
    let pod_namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    pod_namespace == namespace
        && (pod_name == name
            || pod_name
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('-'))
                .map(|suffix| suffix == node_name)
                .unwrap_or(false))
}
