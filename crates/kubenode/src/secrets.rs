//! Secrets readiness: publishing `SecretsStatus` from rendered files and
//! gating consumers on it.
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use kubenode_state::{EventType, State, WatchStream};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::resources::SecretsStatusSpec;
use crate::shutdown::Shutdown;

/// Owner of every `SecretsStatus` resource written by this node.
pub const OWNER: &str = "secrets-status";

/// Files whose presence makes one consumer's secrets ready.
#[derive(Clone, Debug)]
pub struct SecretSet {
    /// ID of the `SecretsStatus` resource.
    pub consumer: String,
    /// Files or directories which have to exist.
    pub paths: Vec<PathBuf>,
}

/// Polls secret files and keeps a `SecretsStatus` per consumer up to date.
pub struct SecretsStatusPublisher {
    state: State,
    sets: Vec<SecretSet>,
    poll_interval: Duration,
}

impl SecretsStatusPublisher {
    /// Create a publisher for `sets`.
    pub fn new(state: State, sets: Vec<SecretSet>, poll_interval: Duration) -> Self {
        SecretsStatusPublisher {
            state,
            sets,
            poll_interval,
        }
    }

    /// Publishes until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                _ = interval.tick() => {}
            }
            for set in &self.sets {
                if let Err(e) = self.publish(set).await {
                    warn!(consumer = %set.consumer, error = %e, "Failed to publish secrets status");
                }
            }
        }
    }

    /// Computes and stores the status of one consumer.
    pub async fn publish(&self, set: &SecretSet) -> anyhow::Result<SecretsStatusSpec> {
        let status = compute_status(&set.paths).await?;
        let stored = self
            .state
            .modify::<SecretsStatusSpec, _>(&set.consumer, OWNER, |spec| *spec = status.clone())
            .await?;
        debug!(
            consumer = %set.consumer,
            ready = status.ready,
            version = stored.metadata().version(),
            "Published secrets status"
        );
        Ok(status)
    }
}

/// Ready when every path exists; the version digests their contents.
pub async fn compute_status(paths: &[PathBuf]) -> anyhow::Result<SecretsStatusSpec> {
    for path in paths {
        if tokio::fs::metadata(path).await.is_err() {
            return Ok(SecretsStatusSpec {
                ready: false,
                version: String::new(),
            });
        }
    }

    let mut hasher = Sha256::new();
    for path in paths {
        hash_path(&mut hasher, path).await?;
    }
    Ok(SecretsStatusSpec {
        ready: true,
        version: format!("{:x}", hasher.finalize()),
    })
}

/// Hashes a file, or every file below a directory in name order.
async fn hash_path(hasher: &mut Sha256, root: &Path) -> anyhow::Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(path) = pending.pop() {
        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.is_dir() {
            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry.path());
            }
            entries.sort();
            // Reversed so the stack pops them in name order.
            pending.extend(entries.into_iter().rev());
        } else {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(tokio::fs::read(&path).await?);
        }
    }
    Ok(())
}

/// Tracks `SecretsStatus` of one consumer for a downstream reconciler.
pub struct SecretsGate {
    state: State,
    consumer: String,
    watch: WatchStream<SecretsStatusSpec>,
    current: Option<SecretsStatusSpec>,
}

impl SecretsGate {
    /// Starts tracking `consumer`. Not ready until its status is seen.
    pub async fn new(state: State, consumer: &str) -> Self {
        let watch = state.watch::<SecretsStatusSpec>(Some(consumer)).await;
        SecretsGate {
            state,
            consumer: consumer.to_string(),
            watch,
            current: None,
        }
    }

    /// Whether the secrets are ready.
    pub fn is_ready(&self) -> bool {
        self.current.as_ref().map(|s| s.ready).unwrap_or(false)
    }

    /// Version of the secrets, if known.
    pub fn version(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.version.as_str())
    }

    /// Resolves on the next change of readiness or version. Cancel safe.
    pub async fn changed(&mut self) {
        loop {
            match self.watch.next().await {
                Some(Ok(event)) => {
                    let next = match event.type_ {
                        EventType::Destroyed => None,
                        _ => Some(event.resource.into_spec()),
                    };
                    if next != self.current {
                        if let Some(status) = &next {
                            info!(consumer = %self.consumer, ready = status.ready, version = %status.version, "Secrets status changed");
                        }
                        self.current = next;
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(consumer = %self.consumer, error = %e, "Secrets status watch failed, restarting");
                    self.watch = self
                        .state
                        .watch::<SecretsStatusSpec>(Some(&self.consumer))
                        .await;
                }
                None => futures::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::KUBERNETES_CLIENT_SECRETS;

    #[tokio::test]
    async fn status_tracks_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("pki/ca.crt");
        let kubeconfig = dir.path().join("admin.conf");
        let paths = vec![dir.path().join("pki"), kubeconfig.clone()];

        let status = compute_status(&paths).await.unwrap();
        assert!(!status.ready);

        tokio::fs::create_dir_all(cert.parent().unwrap()).await.unwrap();
        tokio::fs::write(&cert, b"cert").await.unwrap();
        tokio::fs::write(&kubeconfig, b"config").await.unwrap();
        let first = compute_status(&paths).await.unwrap();
        assert!(first.ready);
        assert_eq!(first.version.len(), 64);
        assert_eq!(first, compute_status(&paths).await.unwrap());

        tokio::fs::write(&cert, b"rotated").await.unwrap();
        let rotated = compute_status(&paths).await.unwrap();
        assert!(rotated.ready);
        assert_ne!(first.version, rotated.version);
    }

    #[tokio::test]
    async fn publish_suppresses_identical_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("admin.conf");
        tokio::fs::write(&file, b"config").await.unwrap();

        let state = State::new();
        let publisher = SecretsStatusPublisher::new(
            state.clone(),
            vec![],
            Duration::from_secs(1),
        );
        let set = SecretSet {
            consumer: KUBERNETES_CLIENT_SECRETS.to_string(),
            paths: vec![file],
        };
        publisher.publish(&set).await.unwrap();
        publisher.publish(&set).await.unwrap();

        let stored = state
            .get::<SecretsStatusSpec>(KUBERNETES_CLIENT_SECRETS)
            .await
            .unwrap();
        assert!(stored.spec().ready);
        assert_eq!(stored.metadata().version(), 1);
    }

    #[tokio::test]
    async fn gate_opens_on_ready_and_reports_rotation() {
        let state = State::new();
        let mut gate = SecretsGate::new(state.clone(), KUBERNETES_CLIENT_SECRETS).await;
        assert!(!gate.is_ready());

        state
            .modify::<SecretsStatusSpec, _>(KUBERNETES_CLIENT_SECRETS, OWNER, |s| {
                s.ready = true;
                s.version = "1".to_string();
            })
            .await
            .unwrap();
        gate.changed().await;
        assert!(gate.is_ready());
        assert_eq!(gate.version(), Some("1"));

        state
            .modify::<SecretsStatusSpec, _>(KUBERNETES_CLIENT_SECRETS, OWNER, |s| {
                s.version = "2".to_string();
            })
            .await
            .unwrap();
        gate.changed().await;
        assert!(gate.is_ready());
        assert_eq!(gate.version(), Some("2"));
    }
}
