//! Conversion between typed pods and the schema-less maps carried by
//! `StaticPod` and `StaticPodStatus` resources.
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::resources::{StaticPodSpec, StaticPodStatusSpec};

/// A pod or status which doesn't fit its representation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode {what}: {message}")]
    Encode { what: &'static str, message: String },
    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },
}

fn to_map<T: Serialize>(value: &T, what: &'static str) -> Result<Map<String, Value>, CodecError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CodecError::Encode {
            what,
            message: format!("expected an object, got {}", other),
        }),
        Err(e) => Err(CodecError::Encode {
            what,
            message: e.to_string(),
        }),
    }
}

fn from_map<T: DeserializeOwned>(map: &Map<String, Value>, what: &'static str) -> Result<T, CodecError> {
    serde_json::from_value(Value::Object(map.clone())).map_err(|e| CodecError::Decode {
        what,
        message: e.to_string(),
    })
}

/// Encodes a pod into a `StaticPod` spec.
pub fn encode_pod(pod: &Pod) -> Result<StaticPodSpec, CodecError> {
    Ok(StaticPodSpec {
        pod: to_map(pod, "pod")?,
    })
}

/// Decodes a `StaticPod` spec into a typed pod.
pub fn decode_pod(spec: &StaticPodSpec) -> Result<Pod, CodecError> {
    from_map(&spec.pod, "pod")
}

/// Encodes a pod status into a `StaticPodStatus` spec.
pub fn encode_status(status: &PodStatus) -> Result<StaticPodStatusSpec, CodecError> {
    Ok(StaticPodStatusSpec {
        pod_status: to_map(status, "pod status")?,
    })
}

/// Decodes a `StaticPodStatus` spec into a typed pod status.
pub fn decode_status(spec: &StaticPodStatusSpec) -> Result<PodStatus, CodecError> {
    from_map(&spec.pod_status, "pod status")
}

/// Renders the on-disk manifest the kubelet reads.
///
/// The pod has to decode as a pod, but the schema-less form is what gets
/// written so that fields unknown to this build survive.
pub fn render_manifest(spec: &StaticPodSpec) -> Result<Vec<u8>, CodecError> {
    decode_pod(spec)?;

    let mut pod = spec.pod.clone();
    pod.entry("apiVersion")
        .or_insert_with(|| Value::String("v1".to_string()));
    pod.entry("kind")
        .or_insert_with(|| Value::String("Pod".to_string()));

    serde_yaml::to_vec(&pod).map_err(|e| CodecError::Encode {
        what: "pod manifest",
        message: e.to_string(),
    })
}

/// Namespace and name a pod declares, `default` namespace if unset.
pub fn pod_identity(spec: &StaticPodSpec) -> (String, String) {
    let metadata = spec.pod.get("metadata").and_then(Value::as_object);
    let field = |name: &str| {
        metadata
            .and_then(|m| m.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let namespace = field("namespace");
    let namespace = if namespace.is_empty() {
        "default".to_string()
    } else {
        namespace
    };
    (namespace, field("name"))
}
