//! Schema-agnostic access to arbitrary API objects.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ApiError;
use crate::kubeconfig::ClientCache;

/// Namespace objects of namespaced kinds land in when they don't name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Server-side identity of an object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// `group/version`, or just `version` for the core group
    pub api_version: String,
    /// Object kind
    pub kind: String,
    /// `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name, possibly empty
    pub name: String,
}

impl ObjectRef {
    /// Reads the identity of an untyped object.
    ///
    /// `apiVersion` and `kind` are required, name and namespace may be empty.
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, ApiError> {
        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ApiError::Permanent(format!("object is missing {}", name)))
        };
        let metadata = object.get("metadata").and_then(Value::as_object);
        let meta_field = |name: &str| {
            metadata
                .and_then(|m| m.get(name))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(ObjectRef {
            api_version: field("apiVersion")?,
            kind: field("kind")?,
            namespace: meta_field("namespace"),
            name: meta_field("name").unwrap_or_default(),
        })
    }

    /// Splits `apiVersion` into group and version.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ObjectRef {
    /// `apiVersion/Kind/namespace/name`, empty segments kept.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.api_version,
            self.kind,
            self.namespace.as_deref().unwrap_or_default(),
            self.name
        )
    }
}

/// Operations the manifest reconciler needs from the API server.
#[async_trait]
pub trait ObjectClient: Send + Sync + 'static {
    /// Called before every pass with the version of the Kubernetes client
    /// secrets. Clients with fixed credentials have nothing to do.
    async fn connect(&self, _secrets_version: &str) -> Result<(), ApiError> {
        Ok(())
    }

    /// Completes an identity: namespaced kinds without a namespace get
    /// [`DEFAULT_NAMESPACE`], cluster-scoped kinds lose any namespace.
    async fn resolve(&self, object: ObjectRef) -> Result<ObjectRef, ApiError>;

    /// Fetches the live object, [`ApiError::NotFound`] if there is none.
    async fn get(&self, object: &ObjectRef) -> Result<Value, ApiError>;

    /// Creates the object from `body`.
    async fn create(&self, object: &ObjectRef, body: &Value) -> Result<(), ApiError>;

    /// Applies a JSON merge patch to the live object.
    async fn patch(&self, object: &ObjectRef, patch: &Value) -> Result<(), ApiError>;
}

/// [`ObjectClient`] backed by a Kubernetes client and API discovery.
pub struct KubeObjectClient {
    clients: ClientCache,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeObjectClient {
    /// Wraps a client cache. Discovery runs lazily on first use.
    pub fn new(clients: ClientCache) -> Self {
        KubeObjectClient {
            clients,
            discovery: RwLock::new(None),
        }
    }

    async fn run_discovery(&self) -> Result<Arc<Discovery>, ApiError> {
        let client = self.clients.client().await?;
        let discovery = Arc::new(Discovery::new(client).run().await?);
        *self.discovery.write().await = Some(discovery.clone());
        Ok(discovery)
    }

    /// Finds the API resource for an object. Kinds unknown to the cached
    /// discovery trigger one refresh, since earlier manifests may have just
    /// registered them.
    async fn api_resource(&self, object: &ObjectRef) -> Result<(ApiResource, Scope), ApiError> {
        let (group, version) = object.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &object.kind);

        let cached = self.discovery.read().await.clone();
        let discovery = match cached {
            Some(discovery) => discovery,
            None => self.run_discovery().await?,
        };
        if let Some((resource, caps)) = discovery.resolve_gvk(&gvk) {
            return Ok((resource, caps.scope));
        }

        debug!(kind = %object.kind, api_version = %object.api_version, "Refreshing API discovery");
        let discovery = self.run_discovery().await?;
        discovery
            .resolve_gvk(&gvk)
            .map(|(resource, caps)| (resource, caps.scope))
            .ok_or_else(|| {
                ApiError::Permanent(format!(
                    "{} {} is not served by the API server",
                    object.api_version, object.kind
                ))
            })
    }

    async fn api(&self, object: &ObjectRef) -> Result<Api<DynamicObject>, ApiError> {
        let (resource, scope) = self.api_resource(object).await?;
        let client = self.clients.client().await?;
        Ok(match (scope, object.namespace.as_deref()) {
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(client, namespace, &resource)
            }
            (Scope::Namespaced, None) => Api::namespaced_with(client, DEFAULT_NAMESPACE, &resource),
            (Scope::Cluster, _) => Api::all_with(client, &resource),
        })
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn connect(&self, secrets_version: &str) -> Result<(), ApiError> {
        if self.clients.connect(secrets_version).await? {
            // Served kinds are looked up again with the new credentials.
            *self.discovery.write().await = None;
        }
        Ok(())
    }

    async fn resolve(&self, mut object: ObjectRef) -> Result<ObjectRef, ApiError> {
        let (_, scope) = self.api_resource(&object).await?;
        match scope {
            Scope::Namespaced => {
                if object.namespace.is_none() {
                    object.namespace = Some(DEFAULT_NAMESPACE.to_string());
                }
            }
            Scope::Cluster => object.namespace = None,
        }
        Ok(object)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Value, ApiError> {
        let live = self.api(object).await?.get(&object.name).await?;
        serde_json::to_value(&live).map_err(|e| ApiError::Permanent(e.to_string()))
    }

    async fn create(&self, object: &ObjectRef, body: &Value) -> Result<(), ApiError> {
        let body: DynamicObject = serde_json::from_value(body.clone())
            .map_err(|e| ApiError::Permanent(format!("object doesn't decode: {}", e)))?;
        self.api(object)
            .await?
            .create(&PostParams::default(), &body)
            .await?;
        Ok(())
    }

    async fn patch(&self, object: &ObjectRef, patch: &Value) -> Result<(), ApiError> {
        self.api(object)
            .await?
            .patch(&object.name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

/// Computes the merge patch which brings `live` in line with `desired`.
///
/// Only fields present in `desired` are compared, so fields defaulted or
/// managed by the server don't count as drift. Returns `None` when there is
/// nothing to change.
pub fn drift_patch(live: &Value, desired: &Value) -> Option<Value> {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, want) in desired {
                match live.get(key) {
                    Some(have) => {
                        if let Some(change) = drift_patch(have, want) {
                            patch.insert(key.clone(), change);
                        }
                    }
                    None if want.is_null() => {}
                    None => {
                        patch.insert(key.clone(), want.clone());
                    }
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        // Merge patches replace arrays wholesale, but a live array only drifted
        // if one of its elements did.
        (Value::Array(have), Value::Array(want)) if have.len() == want.len() => {
            let drifted = have
                .iter()
                .zip(want.iter())
                .any(|(have, want)| drift_patch(have, want).is_some());
            if drifted {
                Some(desired.clone())
            } else {
                None
            }
        }
        _ if live == desired => None,
        _ => Some(desired.clone()),
    }
}
