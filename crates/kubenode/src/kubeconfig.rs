//! Loading the kubeconfig used to reach the API server, and the clients built
//! from it.
use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ApiError;

/// Loads the client configuration from a kubeconfig file.
pub async fn load(path: &Path) -> anyhow::Result<kube::Config> {
    debug!(path = %path.display(), "Loading kubeconfig");
    let kubeconfig = Kubeconfig::read_from(path)?;
    Ok(kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
}

struct Connection {
    secrets_version: String,
    client: kube::Client,
}

/// A Kubernetes client built from a kubeconfig which only becomes usable once
/// the `kubernetes-client` secrets are ready.
///
/// The kubeconfig is read again whenever the secrets version moves on, so
/// rotated credentials reach the client.
pub struct ClientCache {
    kubeconfig: PathBuf,
    current: RwLock<Option<Connection>>,
}

impl ClientCache {
    /// Nothing is loaded until [`ClientCache::connect`].
    pub fn new(kubeconfig: PathBuf) -> Self {
        ClientCache {
            kubeconfig,
            current: RwLock::new(None),
        }
    }

    /// A cache already holding `client`, as if connected at `secrets_version`.
    pub fn with_client(client: kube::Client, secrets_version: &str) -> Self {
        ClientCache {
            kubeconfig: PathBuf::new(),
            current: RwLock::new(Some(Connection {
                secrets_version: secrets_version.to_string(),
                client,
            })),
        }
    }

    /// Makes sure the client matches `secrets_version`, rebuilding it from the
    /// kubeconfig otherwise. Returns whether a new client was built.
    pub async fn connect(&self, secrets_version: &str) -> Result<bool, ApiError> {
        let mut current = self.current.write().await;
        if let Some(connection) = current.as_ref() {
            if connection.secrets_version == secrets_version {
                return Ok(false);
            }
        }

        // The secrets may be mid-rotation, a later version can fix a bad file.
        let config = load(&self.kubeconfig)
            .await
            .map_err(|e| ApiError::Transient(format!("loading kubeconfig: {}", e)))?;
        let client = kube::Client::try_from(config)
            .map_err(|e| ApiError::Transient(format!("building client: {}", e)))?;
        info!(
            kubeconfig = %self.kubeconfig.display(),
            secrets_version,
            "Built Kubernetes client"
        );
        *current = Some(Connection {
            secrets_version: secrets_version.to_string(),
            client,
        });
        Ok(true)
    }

    /// The client of the last successful [`ClientCache::connect`].
    pub async fn client(&self) -> Result<kube::Client, ApiError> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or_else(|| ApiError::Transient("no Kubernetes client yet".to_string()))
    }
}
