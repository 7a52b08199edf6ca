use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kubenode_state::{State, Version};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::client::{drift_patch, ObjectClient, ObjectRef};
use crate::backoff::{full_jitter, sleep_until, tick, BackoffStrategy, ExponentialBackoffStrategy};
use crate::error::{with_deadline, ApiError};
use crate::resources::{
    ManifestSpec, ManifestStatusSpec, KUBERNETES_CLIENT_SECRETS, MANIFEST_STATUS_ID,
};
use crate::secrets::SecretsGate;
use crate::shutdown::Shutdown;

/// Owner of the `ManifestStatus` resource.
pub const OWNER: &str = "manifest-apply";

/// A pass stopped early on a failure worth retrying.
#[derive(Debug, Error)]
#[error("applying {object} failed: {error}")]
pub struct PassError {
    object: String,
    #[source]
    error: ApiError,
}

/// An object which failed permanently, remembered until its manifest changes.
#[derive(Debug, Clone)]
struct Failure {
    manifest_version: Version,
    message: String,
}

/// Applies every object of every `Manifest` to the API server.
///
/// Objects are created when missing and patched when they drifted from their
/// declaration. Nothing is ever deleted.
pub struct ManifestReconciler<C> {
    state: State,
    client: Arc<C>,
    operation_timeout: Duration,
    sweep_interval: Option<Duration>,
    failures: HashMap<(String, usize), Failure>,
}

impl<C: ObjectClient> ManifestReconciler<C> {
    /// `sweep_interval` of `None` disables periodic drift correction.
    pub fn new(
        state: State,
        client: Arc<C>,
        operation_timeout: Duration,
        sweep_interval: Option<Duration>,
    ) -> Self {
        ManifestReconciler {
            state,
            client,
            operation_timeout,
            sweep_interval,
            failures: HashMap::new(),
        }
    }

    /// Reconciles until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut gate = SecretsGate::new(self.state.clone(), KUBERNETES_CLIENT_SECRETS).await;
        let mut manifests = self.state.watch::<ManifestSpec>(None).await;
        let mut sweep = self.sweep_interval.map(tokio::time::interval);
        let mut backoff = ExponentialBackoffStrategy::default();
        let mut retry_at: Option<Instant> = None;

        loop {
            let mut dirty = false;
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Manifest reconciler stopping");
                    return Ok(());
                }
                _ = gate.changed() => dirty = true,
                event = manifests.next() => {
                    dirty = true;
                    match event {
                        Some(Ok(event)) => debug!(id = %event.resource.id(), "Manifest changed"),
                        Some(Err(e)) => {
                            warn!(error = %e, "Manifest watch failed, restarting");
                            manifests = self.state.watch::<ManifestSpec>(None).await;
                        }
                        None => manifests = self.state.watch::<ManifestSpec>(None).await,
                    }
                }
                _ = tick(&mut sweep) => dirty = true,
                _ = sleep_until(retry_at) => {
                    retry_at = None;
                    dirty = true;
                }
            }

            if !dirty || retry_at.is_some() {
                continue;
            }
            if !gate.is_ready() {
                debug!("Kubernetes client secrets not ready yet");
                continue;
            }

            let version = gate.version().unwrap_or_default().to_string();
            let pass = match self.client.connect(&version).await {
                Ok(()) => self.reconcile().await,
                Err(error) => Err(PassError {
                    object: "kubeconfig".to_string(),
                    error,
                }),
            };
            match pass {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    let delay = full_jitter(backoff.next_duration());
                    warn!(error = %e, retry_in = ?delay, "Manifest apply pass failed");
                    retry_at = Some(Instant::now() + delay);
                }
            }
        }
    }

    /// Runs a single pass over all manifests and publishes `ManifestStatus`.
    ///
    /// Permanent failures are recorded and skipped; the first transient one
    /// aborts the pass.
    #[instrument(level = "debug", skip(self))]
    pub async fn reconcile(&mut self) -> Result<(), PassError> {
        let manifests = self
            .state
            .list::<ManifestSpec>()
            .await
            .map_err(|e| PassError {
                object: "manifests".to_string(),
                error: ApiError::Transient(e.to_string()),
            })?;

        let current: HashMap<&str, Version> = manifests
            .iter()
            .map(|m| (m.id(), m.metadata().version()))
            .collect();
        self.failures.retain(|(id, _), failure| {
            current.get(id.as_str()) == Some(&failure.manifest_version)
        });

        let mut applied = Vec::new();
        let mut errors = Vec::new();

        for manifest in &manifests {
            let version = manifest.metadata().version();
            for (index, object) in manifest.spec().items.iter().enumerate() {
                let key = (manifest.id().to_string(), index);
                if let Some(failure) = self.failures.get(&key) {
                    errors.push(failure.message.clone());
                    continue;
                }

                match self.apply(object).await {
                    Ok(identity) => applied.push(identity),
                    Err((identity, error)) if error.is_transient() => {
                        return Err(PassError {
                            object: identity,
                            error,
                        });
                    }
                    Err((identity, error)) => {
                        warn!(manifest = %manifest.id(), object = %identity, error = %error, "Object rejected, skipping until its manifest changes");
                        let message = format!("{}: {}", identity, error);
                        errors.push(message.clone());
                        self.failures.insert(
                            key,
                            Failure {
                                manifest_version: version,
                                message,
                            },
                        );
                    }
                }
            }
        }

        self.state
            .modify::<ManifestStatusSpec, _>(MANIFEST_STATUS_ID, OWNER, |status| {
                status.manifests_applied = applied.clone();
                status.errors = errors.clone();
            })
            .await
            .map_err(|e| PassError {
                object: MANIFEST_STATUS_ID.to_string(),
                error: ApiError::Transient(e.to_string()),
            })?;
        Ok(())
    }

    /// Ensures one object exists and matches its declaration. Returns its
    /// identity string.
    async fn apply(&self, object: &Map<String, Value>) -> Result<String, (String, ApiError)> {
        let declared = ObjectRef::from_object(object).map_err(|e| (describe(object), e))?;
        let fallback = declared.to_string();
        let reference = self
            .call(self.client.resolve(declared))
            .await
            .map_err(|e| (fallback, e))?;
        let identity = reference.to_string();
        let desired = desired_body(object, &reference);

        match self.call(self.client.get(&reference)).await {
            Ok(live) => {
                if let Some(patch) = drift_patch(&live, &desired) {
                    self.call(self.client.patch(&reference, &patch))
                        .await
                        .map_err(|e| (identity.clone(), e))?;
                    info!(object = %identity, "Patched drifted object");
                }
            }
            Err(ApiError::NotFound) => {
                match self.call(self.client.create(&reference, &desired)).await {
                    Ok(()) => info!(object = %identity, "Created object"),
                    // Someone beat us to it; the next pass compares it instead.
                    Err(ApiError::AlreadyExists) => {
                        debug!(object = %identity, "Object appeared concurrently")
                    }
                    Err(e) => return Err((identity, e)),
                }
            }
            Err(e) => return Err((identity, e)),
        }
        Ok(identity)
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, ApiError>
    where
        F: std::future::Future<Output = Result<T, ApiError>>,
    {
        with_deadline(self.operation_timeout, fut).await
    }
}

/// The declared object with the resolved namespace filled in.
fn desired_body(object: &Map<String, Value>, reference: &ObjectRef) -> Value {
    let mut body = object.clone();
    if let Some(namespace) = &reference.namespace {
        let metadata = body
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
        }
    }
    Value::Object(body)
}

fn describe(object: &Map<String, Value>) -> String {
    let field = |name: &str| object.get(name).and_then(Value::as_str).unwrap_or_default();
    format!("{}/{}", field("apiVersion"), field("kind"))
}
