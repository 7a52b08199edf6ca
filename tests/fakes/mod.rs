use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kubenode::discovery::annotations::{affiliate_from_node, annotations_from_affiliate};
use kubenode::discovery::Registry;
use kubenode::error::ApiError;
use kubenode::manifest::{ObjectClient, ObjectRef};
use kubenode::resources::AffiliateSpec;
use kubenode::shutdown::Shutdown;
use kubenode::static_pod::KubeletPods;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// An API server holding arbitrary objects in memory.
#[derive(Default)]
pub struct FakeApi {
    pub objects: Mutex<BTreeMap<ObjectRef, Value>>,
    pub cluster_scoped: Vec<&'static str>,
}

impl FakeApi {
    pub fn with_cluster_scoped(kinds: &[&'static str]) -> Self {
        FakeApi {
            cluster_scoped: kinds.to_vec(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectClient for FakeApi {
    async fn resolve(&self, mut object: ObjectRef) -> Result<ObjectRef, ApiError> {
        if self.cluster_scoped.contains(&object.kind.as_str()) {
            object.namespace = None;
        } else if object.namespace.is_none() {
            object.namespace = Some("default".to_string());
        }
        Ok(object)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Value, ApiError> {
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn create(&self, object: &ObjectRef, body: &Value) -> Result<(), ApiError> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(object) {
            return Err(ApiError::AlreadyExists);
        }
        objects.insert(object.clone(), body.clone());
        Ok(())
    }

    async fn patch(&self, object: &ObjectRef, patch: &Value) -> Result<(), ApiError> {
        let mut objects = self.objects.lock().unwrap();
        let live = objects.get_mut(object).ok_or(ApiError::NotFound)?;
        merge(live, patch);
        Ok(())
    }
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// A set of `Node` objects shared by every [`FakeRegistry`] of a test.
#[derive(Default)]
pub struct FakeCluster {
    pub nodes: Mutex<BTreeMap<String, Node>>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl FakeCluster {
    pub fn add_node(&self, name: &str, labels: &[&str]) {
        let node: Node = serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "labels": labels.iter().map(|l| (l.to_string(), "")).collect::<HashMap<_, _>>(),
            },
            "status": {
                "addresses": [{"type": "Hostname", "address": format!("{}.example", name)}],
                "nodeInfo": {
                    "osImage": "Talos (v1.0.0)",
                    "architecture": "amd64",
                    "bootID": "",
                    "containerRuntimeVersion": "",
                    "kernelVersion": "",
                    "kubeProxyVersion": "",
                    "kubeletVersion": "",
                    "machineID": "",
                    "operatingSystem": "linux",
                    "systemUUID": "",
                },
            },
        }))
        .unwrap();
        self.nodes.lock().unwrap().insert(name.to_string(), node);
        self.notify();
    }

    pub fn annotations(&self, name: &str) -> BTreeMap<String, String> {
        self.nodes.lock().unwrap()[name]
            .metadata
            .annotations
            .clone()
            .unwrap_or_default()
    }

    fn notify(&self) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            let _ = subscriber.try_send(());
        }
    }
}

/// One node's view of a [`FakeCluster`].
pub struct FakeRegistry(pub Arc<FakeCluster>);

#[async_trait]
impl Registry for FakeRegistry {
    async fn push(&self, affiliate: &AffiliateSpec) -> Result<(), ApiError> {
        {
            let mut nodes = self.0.nodes.lock().unwrap();
            let node = nodes
                .get_mut(&affiliate.nodename)
                .ok_or(ApiError::NotFound)?;
            let annotations = node.metadata.annotations.get_or_insert_with(Default::default);
            for (key, value) in annotations_from_affiliate(affiliate) {
                if value.is_empty() {
                    annotations.remove(&key);
                } else {
                    annotations.insert(key, value);
                }
            }
        }
        self.0.notify();
        Ok(())
    }

    async fn watch(&self, _shutdown: Shutdown) -> Result<mpsc::Receiver<()>, ApiError> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(());
        self.0.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn list(&self, local_nodename: &str) -> Result<Vec<AffiliateSpec>, ApiError> {
        Ok(self
            .0
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|node| node.metadata.name.as_deref() != Some(local_nodename))
            .filter_map(affiliate_from_node)
            .collect())
    }
}

/// The pods a kubelet reports, set by the test.
#[derive(Default)]
pub struct FakeKubelet {
    pub pods: Mutex<Vec<Pod>>,
}

#[async_trait]
impl KubeletPods for FakeKubelet {
    async fn pods(&self) -> Result<Vec<Pod>, ApiError> {
        Ok(self.pods.lock().unwrap().clone())
    }
}
