//! Loaders turning files on disk into `Manifest` and `StaticPod` resources.
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubenode_state::{Error as StateError, State};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::manifest::parse_yaml;
use crate::resources::{ManifestSpec, StaticPodSpec};
use crate::shutdown::Shutdown;
use crate::static_pod::codec::decode_pod;

/// Owner of `Manifest` resources loaded from disk.
pub const MANIFEST_SOURCE_OWNER: &str = "manifest-source";
/// Owner of `StaticPod` resources loaded from disk.
pub const STATIC_POD_SOURCE_OWNER: &str = "static-pod-source";

/// Reads every `*.yaml`/`*.yml` file of `dir`, keyed by file stem.
///
/// A missing directory holds no files.
pub async fn read_yaml_files(dir: &Path) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Source directory doesn't exist");
            return Ok(files);
        }
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml || !entry.file_type().await?.is_file() {
            continue;
        }
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if !stem.starts_with('.') => stem.to_string(),
            _ => continue,
        };
        files.insert(stem, tokio::fs::read(&path).await?);
    }
    Ok(files)
}

/// Keeps one `Manifest` per YAML bundle in a directory.
pub struct ManifestSource {
    state: State,
    dir: PathBuf,
    poll_interval: Duration,
}

impl ManifestSource {
    /// Create a loader for `dir`.
    pub fn new(state: State, dir: PathBuf, poll_interval: Duration) -> Self {
        ManifestSource {
            state,
            dir,
            poll_interval,
        }
    }

    /// Loads until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                _ = interval.tick() => {}
            }
            if let Err(e) = self.sync().await {
                warn!(dir = %self.dir.display(), error = %e, "Failed to load manifests");
            }
        }
    }

    /// Loads the directory once. Bundles which fail to parse keep their
    /// previous `Manifest`.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let files = read_yaml_files(&self.dir).await?;

        for (id, contents) in &files {
            let items = match parse_yaml(contents) {
                Ok(items) => items,
                Err(e) => {
                    warn!(%id, error = %e, "Ignoring invalid manifest bundle");
                    continue;
                }
            };
            self.state
                .modify::<ManifestSpec, _>(id, MANIFEST_SOURCE_OWNER, |spec| {
                    spec.items = items.clone()
                })
                .await?;
        }

        for manifest in self.state.list::<ManifestSpec>().await? {
            if manifest.metadata().owner() != MANIFEST_SOURCE_OWNER
                || files.contains_key(manifest.id())
            {
                continue;
            }
            match self
                .state
                .destroy::<ManifestSpec>(manifest.id(), MANIFEST_SOURCE_OWNER, None)
                .await
            {
                Ok(()) | Err(StateError::NotFound(_)) => {
                    info!(id = %manifest.id(), "Manifest removed from configuration")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Keeps one `StaticPod` per pod YAML file in a directory.
///
/// Removing a file tears the pod down: the resource is destroyed only once
/// the static pod writer released it.
pub struct StaticPodSource {
    state: State,
    dir: PathBuf,
    poll_interval: Duration,
    removing: Arc<Mutex<HashSet<String>>>,
}

impl StaticPodSource {
    /// Create a loader for `dir`.
    pub fn new(state: State, dir: PathBuf, poll_interval: Duration) -> Self {
        StaticPodSource {
            state,
            dir,
            poll_interval,
            removing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Loads until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                _ = interval.tick() => {}
            }
            if let Err(e) = self.sync().await {
                warn!(dir = %self.dir.display(), error = %e, "Failed to load static pods");
            }
        }
    }

    /// Loads the directory once.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let files = read_yaml_files(&self.dir).await?;
        let removing = self.removing_ids();

        for (id, contents) in &files {
            if removing.contains(id) {
                debug!(%id, "Static pod still tearing down");
                continue;
            }
            let spec = match parse_pod(contents) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(%id, error = %e, "Ignoring invalid static pod");
                    continue;
                }
            };
            self.state
                .modify::<StaticPodSpec, _>(id, STATIC_POD_SOURCE_OWNER, |current| {
                    *current = spec.clone()
                })
                .await?;
        }

        for pod in self.state.list::<StaticPodSpec>().await? {
            let id = pod.id().to_string();
            if pod.metadata().owner() != STATIC_POD_SOURCE_OWNER
                || files.contains_key(&id)
                || removing.contains(&id)
            {
                continue;
            }
            self.spawn_removal(id);
        }
        Ok(())
    }

    fn removing_ids(&self) -> HashSet<String> {
        match self.removing.lock() {
            Ok(removing) => removing.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn spawn_removal(&self, id: String) {
        if let Ok(mut removing) = self.removing.lock() {
            removing.insert(id.clone());
        }
        info!(%id, "Static pod removed from configuration");

        let state = self.state.clone();
        let removing = self.removing.clone();
        tokio::spawn(async move {
            if let Err(e) = state
                .teardown_and_destroy::<StaticPodSpec>(&id, STATIC_POD_SOURCE_OWNER)
                .await
            {
                warn!(%id, error = %e, "Failed to tear down static pod");
            }
            if let Ok(mut removing) = removing.lock() {
                removing.remove(&id);
            }
        });
    }
}

fn parse_pod(contents: &[u8]) -> anyhow::Result<StaticPodSpec> {
    let pod: Map<String, Value> = serde_yaml::from_slice(contents)?;
    let spec = StaticPodSpec { pod };
    decode_pod(&spec)?;
    Ok(spec)
}
