//! Discovery registries: where affiliates are published and read from.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube_runtime::watcher::{watcher, Event};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::annotations::{affiliate_from_node, annotations_from_affiliate};
use crate::backoff::{wait_or_shutdown, BackoffStrategy, ExponentialBackoffStrategy};
use crate::error::ApiError;
use crate::kubeconfig::ClientCache;
use crate::resources::AffiliateSpec;
use crate::shutdown::Shutdown;

/// How often the Kubernetes registry signals subscribers without a change.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// A place where nodes publish their affiliate and discover peers.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Called with the version of the Kubernetes client secrets before
    /// pushing or watching. Registries with fixed credentials have nothing to
    /// do.
    async fn connect(&self, _secrets_version: &str) -> Result<(), ApiError> {
        Ok(())
    }

    /// Publishes the local affiliate.
    async fn push(&self, affiliate: &AffiliateSpec) -> Result<(), ApiError>;

    /// Starts watching the registry. The receiver gets a message whenever the
    /// peer list may have changed, and closes after shutdown. Dropping the
    /// receiver stops the watch.
    async fn watch(&self, shutdown: Shutdown) -> Result<mpsc::Receiver<()>, ApiError>;

    /// Lists affiliates of every peer except `local_nodename`.
    async fn list(&self, local_nodename: &str) -> Result<Vec<AffiliateSpec>, ApiError>;
}

/// A registry backed by annotations on Kubernetes `Node` objects.
pub struct KubernetesRegistry {
    clients: ClientCache,
    nodes: Arc<RwLock<BTreeMap<String, Node>>>,
}

impl KubernetesRegistry {
    /// Create a registry taking its client from `clients`.
    pub fn new(clients: ClientCache) -> Self {
        KubernetesRegistry {
            clients,
            nodes: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    async fn api(&self) -> Result<Api<Node>, ApiError> {
        Ok(Api::all(self.clients.client().await?))
    }
}

#[async_trait]
impl Registry for KubernetesRegistry {
    async fn connect(&self, secrets_version: &str) -> Result<(), ApiError> {
        self.clients.connect(secrets_version).await.map(|_| ())
    }

    async fn push(&self, affiliate: &AffiliateSpec) -> Result<(), ApiError> {
        if affiliate.nodename.is_empty() {
            return Err(ApiError::Permanent(
                "affiliate has no node name to publish to".to_string(),
            ));
        }

        let api = self.api().await?;
        let node = api.get(&affiliate.nodename).await?;
        let patch = annotations_patch(
            node.metadata.annotations.as_ref(),
            &annotations_from_affiliate(affiliate),
        );

        let patch = match patch {
            Some(patch) => patch,
            None => {
                debug!(node = %affiliate.nodename, "Node annotations up to date");
                return Ok(());
            }
        };

        api.patch(
            &affiliate.nodename,
            &PatchParams::default(),
            &Patch::Strategic(patch),
        )
        .await?;
        info!(node = %affiliate.nodename, "Updated node discovery annotations");
        Ok(())
    }

    async fn watch(&self, mut shutdown: Shutdown) -> Result<mpsc::Receiver<()>, ApiError> {
        let (tx, rx) = mpsc::channel(1);
        let nodes = self.nodes.clone();
        let mut events = watcher(self.api().await?, ListParams::default()).boxed();

        tokio::spawn(async move {
            let mut resync = tokio::time::interval(RESYNC_PERIOD);
            let mut backoff = ExponentialBackoffStrategy::default();
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tx.closed() => break,
                    _ = resync.tick() => {}
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            backoff.reset();
                            apply_event(&nodes, event).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Node watch failed");
                            if !wait_or_shutdown(&mut backoff, &mut shutdown).await {
                                break;
                            }
                            continue;
                        }
                        None => break,
                    },
                }
                // A pending notification already covers this change.
                let _ = tx.try_send(());
            }
            debug!("Node watch stopped");
        });

        Ok(rx)
    }

    async fn list(&self, local_nodename: &str) -> Result<Vec<AffiliateSpec>, ApiError> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .iter()
            .filter(|(name, _)| name.as_str() != local_nodename)
            .filter_map(|(_, node)| affiliate_from_node(node))
            .collect())
    }
}

async fn apply_event(nodes: &RwLock<BTreeMap<String, Node>>, event: Event<Node>) {
    let mut nodes = nodes.write().await;
    match event {
        Event::Applied(node) => {
            if let Some(name) = node.metadata.name.clone() {
                nodes.insert(name, node);
            }
        }
        Event::Deleted(node) => {
            if let Some(name) = &node.metadata.name {
                nodes.remove(name);
            }
        }
        Event::Restarted(list) => {
            *nodes = list
                .into_iter()
                .filter_map(|node| node.metadata.name.clone().map(|name| (name, node)))
                .collect();
        }
    }
}

/// Builds a strategic merge patch moving `current` annotations to `desired`.
///
/// Empty desired values delete the annotation. Returns `None` when nothing
/// would change.
fn annotations_patch(
    current: Option<&BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) -> Option<Value> {
    let empty = BTreeMap::new();
    let current = current.unwrap_or(&empty);
    let mut changes = Map::new();

    for (key, value) in desired {
        match (current.get(key), value.is_empty()) {
            (Some(_), true) => {
                changes.insert(key.clone(), Value::Null);
            }
            (None, true) => {}
            (Some(existing), false) if existing == value => {}
            (_, false) => {
                changes.insert(key.clone(), Value::String(value.clone()));
            }
        }
    }

    if changes.is_empty() {
        None
    } else {
        Some(json!({ "metadata": { "annotations": changes } }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::discovery::annotations::{NODE_ID, SELF_IPS, KUBESPAN_PUBLIC_KEY};
    use futures::pin_mut;
    use http::{Request as HttpRequest, Response as HttpResponse};
    use hyper::Body;
    use tower_test::mock;

    fn registry(service: mock::Mock<HttpRequest<Body>, HttpResponse<Body>>) -> KubernetesRegistry {
        KubernetesRegistry::new(ClientCache::with_client(
            kube::Client::new(service, "default"),
            "1",
        ))
    }

    fn node_json(name: &str, annotations: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {
                "name": name,
                "annotations": annotations,
            },
        })
    }

    fn affiliate() -> AffiliateSpec {
        AffiliateSpec {
            node_id: "abc".to_string(),
            nodename: "bar".to_string(),
            addresses: vec!["10.0.0.2".parse().unwrap()],
            ..Default::default()
        }
    }

    #[test]
    fn patch_only_touches_changed_keys() {
        let current: BTreeMap<String, String> = vec![
            (NODE_ID.to_string(), "abc".to_string()),
            (KUBESPAN_PUBLIC_KEY.to_string(), "old".to_string()),
            ("unrelated".to_string(), "kept".to_string()),
        ]
        .into_iter()
        .collect();

        let patch = annotations_patch(Some(&current), &annotations_from_affiliate(&affiliate()));
        assert_eq!(
            patch,
            Some(json!({
                "metadata": {
                    "annotations": {
                        KUBESPAN_PUBLIC_KEY: null,
                        SELF_IPS: "10.0.0.2",
                    }
                }
            }))
        );
    }

    #[test]
    fn no_patch_when_in_sync() {
        let desired = annotations_from_affiliate(&affiliate());
        let current: BTreeMap<String, String> = desired
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(annotations_patch(Some(&current), &desired), None);
        assert!(annotations_patch(None, &annotations_from_affiliate(&AffiliateSpec::default()))
            .is_none());
    }

    #[tokio::test]
    async fn push_patches_node_annotations() {
        let (mock_service, handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
        let server = tokio::spawn(async move {
            pin_mut!(handle);

            let (request, send) = handle.next_request().await.expect("get node");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(request.uri().path(), "/api/v1/nodes/bar");
            let node = node_json("bar", json!({ KUBESPAN_PUBLIC_KEY: "old" }));
            send.send_response(
                HttpResponse::builder()
                    .body(Body::from(serde_json::to_vec(&node).unwrap()))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("patch node");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(request.uri().path(), "/api/v1/nodes/bar");
            assert_eq!(
                request.headers().get(http::header::CONTENT_TYPE).unwrap(),
                "application/strategic-merge-patch+json"
            );
            let body = hyper::body::to_bytes(request.into_body()).await.unwrap();
            let patch: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(
                patch,
                json!({
                    "metadata": {
                        "annotations": {
                            NODE_ID: "abc",
                            KUBESPAN_PUBLIC_KEY: null,
                            SELF_IPS: "10.0.0.2",
                        }
                    }
                })
            );
            send.send_response(
                HttpResponse::builder()
                    .body(Body::from(serde_json::to_vec(&node).unwrap()))
                    .unwrap(),
            );
        });

        let registry = registry(mock_service);
        registry.push(&affiliate()).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn push_without_nodename_is_permanent() {
        let (mock_service, _handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
        let registry = registry(mock_service);
        let err = registry
            .push(&AffiliateSpec {
                node_id: "abc".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn list_skips_local_and_unannotated_nodes() {
        let (mock_service, _handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
        let registry = registry(mock_service);

        let node = |name: &str, annotations: Value| -> Node {
            serde_json::from_value(node_json(name, annotations)).unwrap()
        };
        apply_event(
            &registry.nodes,
            Event::Restarted(vec![
                node("local", json!({ NODE_ID: "self" })),
                node("peer", json!({ NODE_ID: "peer-id" })),
                node("plain", json!({})),
            ]),
        )
        .await;

        let peers = registry.list("local").await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "peer-id");
        assert_eq!(peers[0].nodename, "peer");

        apply_event(&registry.nodes, Event::Deleted(node("peer", json!({})))).await;
        assert!(registry.list("local").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nothing_is_sent_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let registry = KubernetesRegistry::new(ClientCache::new(dir.path().join("admin.conf")));

        assert!(registry.push(&affiliate()).await.unwrap_err().is_transient());
        let (_trigger, shutdown) = crate::shutdown::channel();
        assert!(registry.watch(shutdown).await.unwrap_err().is_transient());
        assert!(registry.connect("1").await.unwrap_err().is_transient());
    }
}
