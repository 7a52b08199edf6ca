use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kubenode_state::{Error as StateError, Phase, Resource, State};
use tracing::{debug, info, instrument, warn};

use super::codec::{encode_status, pod_identity, render_manifest};
use super::kubelet::{is_instance_of, is_static, KubeletPods};
use crate::error::with_deadline;
use crate::resources::{StaticPodSpec, StaticPodStatusSpec, STATIC_POD_SECRETS};
use crate::secrets::SecretsGate;
use crate::shutdown::Shutdown;

/// Owner of `StaticPodStatus` resources.
pub const OWNER: &str = "static-pod-writer";
/// Finalizer held on every `StaticPod` until its file is gone and the kubelet
/// stopped the pod.
pub const FINALIZER: &str = "static-pod-writer";

const MANIFEST_EXTENSION: &str = "yaml";

/// Maps a resource ID to the manifest file name, keeping `[A-Za-z0-9._-]`.
pub fn manifest_file_name(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{}", sanitized, MANIFEST_EXTENSION)
}

/// Writes `contents` to `dir/file_name` so that readers see either the old or
/// the new file. Returns false when the file already had these contents.
pub async fn write_atomic(dir: &Path, file_name: &str, contents: Vec<u8>) -> anyhow::Result<bool> {
    let dir = dir.to_path_buf();
    let path = dir.join(file_name);
    tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        if let Ok(existing) = std::fs::read(&path) {
            if existing == contents {
                return Ok(false);
            }
        }
        // Dot-prefixed so the kubelet never picks up the temporary file.
        let mut tmp = tempfile::Builder::new()
            .prefix(".kubenode-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;
        Ok(true)
    })
    .await?
}

/// Renders `StaticPod` resources into the kubelet manifest directory and
/// reflects kubelet pod status back as `StaticPodStatus`.
pub struct StaticPodWriter<K> {
    state: State,
    kubelet: Arc<K>,
    manifests_dir: PathBuf,
    node_name: String,
    poll_interval: Duration,
    operation_timeout: Duration,
}

impl<K: KubeletPods> StaticPodWriter<K> {
    /// `node_name` is used to recognize mirror pods reported by the kubelet.
    pub fn new(
        state: State,
        kubelet: Arc<K>,
        manifests_dir: PathBuf,
        node_name: String,
        poll_interval: Duration,
        operation_timeout: Duration,
    ) -> Self {
        StaticPodWriter {
            state,
            kubelet,
            manifests_dir,
            node_name,
            poll_interval,
            operation_timeout,
        }
    }

    /// Runs until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.manifests_dir).await?;

        let mut gate = SecretsGate::new(self.state.clone(), STATIC_POD_SECRETS).await;
        let mut pods = self.state.watch::<StaticPodSpec>(None).await;
        let mut poll = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Static pod writer stopping");
                    return Ok(());
                }
                _ = gate.changed() => {}
                event = pods.next() => match event {
                    Some(Ok(event)) => debug!(id = %event.resource.id(), "Static pod changed"),
                    Some(Err(e)) => {
                        warn!(error = %e, "Static pod watch failed, restarting");
                        pods = self.state.watch::<StaticPodSpec>(None).await;
                    }
                    None => pods = self.state.watch::<StaticPodSpec>(None).await,
                },
                _ = poll.tick() => {
                    if let Err(e) = self.reconcile_statuses().await {
                        warn!(error = %e, "Failed to refresh static pod status");
                    }
                    continue;
                }
            }

            if let Err(e) = self.reconcile_files(gate.is_ready()).await {
                warn!(error = %e, "Failed to render static pods");
            }
        }
    }

    /// Brings the manifest directory in line with `StaticPod` resources.
    ///
    /// Pods are only (re)written while `secrets_ready`; removal of torn down
    /// and unknown manifests always happens.
    #[instrument(level = "debug", skip(self))]
    pub async fn reconcile_files(&self, secrets_ready: bool) -> anyhow::Result<()> {
        let pods = self.state.list::<StaticPodSpec>().await?;
        let mut wanted = HashSet::new();

        for pod in &pods {
            let file_name = manifest_file_name(pod.id());
            match pod.metadata().phase() {
                Phase::Running => {
                    wanted.insert(file_name.clone());
                    if !pod.metadata().has_finalizer(FINALIZER) {
                        match self.state.add_finalizer::<StaticPodSpec>(pod.id(), FINALIZER).await {
                            Ok(()) => {}
                            // Destroyed in between; the next event cleans up.
                            Err(StateError::NotFound(_)) => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    if secrets_ready {
                        self.render(pod, &file_name).await;
                    }
                }
                Phase::TearingDown => {
                    self.remove_file(&file_name).await?;
                }
            }
        }

        self.remove_strays(&wanted).await
    }

    async fn render(&self, pod: &Resource<StaticPodSpec>, file_name: &str) {
        let contents = match render_manifest(pod.spec()) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(id = %pod.id(), error = %e, "Static pod doesn't render, skipping");
                return;
            }
        };
        match write_atomic(&self.manifests_dir, file_name, contents).await {
            Ok(true) => info!(id = %pod.id(), file = %file_name, "Wrote static pod manifest"),
            Ok(false) => debug!(id = %pod.id(), "Static pod manifest up to date"),
            Err(e) => warn!(id = %pod.id(), error = %e, "Failed to write static pod manifest"),
        }
    }

    /// Returns whether there was a file to remove.
    async fn remove_file(&self, file_name: &str) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(self.manifests_dir.join(file_name)).await {
            Ok(()) => {
                info!(file = %file_name, "Removed static pod manifest");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The manifest directory belongs to us; anything unknown goes.
    async fn remove_strays(&self, wanted: &HashSet<String>) -> anyhow::Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.manifests_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !wanted.contains(&file_name) {
                self.remove_file(&file_name).await?;
            }
        }
        Ok(())
    }

    /// Refreshes `StaticPodStatus` from the kubelet and completes teardowns
    /// once the manifest is gone and the kubelet no longer runs the pod.
    #[instrument(level = "debug", skip(self))]
    pub async fn reconcile_statuses(&self) -> anyhow::Result<()> {
        let running: Vec<_> = with_deadline(self.operation_timeout, self.kubelet.pods())
            .await?
            .into_iter()
            .filter(is_static)
            .collect();
        let pods = self.state.list::<StaticPodSpec>().await?;

        for pod in &pods {
            let (namespace, name) = pod_identity(pod.spec());
            let instance = running
                .iter()
                .find(|p| is_instance_of(p, &namespace, &name, &self.node_name));

            match (pod.metadata().phase(), instance) {
                (Phase::Running, Some(instance)) => {
                    if let Some(status) = &instance.status {
                        let status = encode_status(status)?;
                        self.state
                            .modify::<StaticPodStatusSpec, _>(pod.id(), OWNER, |spec| {
                                *spec = status.clone()
                            })
                            .await?;
                    }
                }
                (Phase::Running, None) => self.destroy_status(pod.id()).await?,
                (Phase::TearingDown, instance) => {
                    // A file removed just now may not have reached the kubelet
                    // yet, so its absence from the pod list proves nothing.
                    let removed = self.remove_file(&manifest_file_name(pod.id())).await?;
                    if removed || instance.is_some() {
                        debug!(id = %pod.id(), "Waiting for the kubelet to stop static pod");
                    } else {
                        self.finish_teardown(pod.id()).await?;
                    }
                }
            }
        }

        // Statuses whose pod is gone entirely.
        let declared: HashSet<&str> = pods.iter().map(|p| p.id()).collect();
        for status in self.state.list::<StaticPodStatusSpec>().await? {
            if !declared.contains(status.id()) {
                self.destroy_status(status.id()).await?;
            }
        }
        Ok(())
    }

    async fn finish_teardown(&self, id: &str) -> anyhow::Result<()> {
        self.destroy_status(id).await?;
        match self.state.remove_finalizer::<StaticPodSpec>(id, FINALIZER).await {
            Ok(()) | Err(StateError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(%id, "Static pod stopped");
        Ok(())
    }

    async fn destroy_status(&self, id: &str) -> anyhow::Result<()> {
        match self
            .state
            .destroy::<StaticPodStatusSpec>(id, OWNER, None)
            .await
        {
            Ok(()) | Err(StateError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ApiError;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::{json, Map, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeKubelet {
        pods: Mutex<Vec<Pod>>,
    }

    impl FakeKubelet {
        fn set(&self, pods: Vec<Pod>) {
            *self.pods.lock().unwrap() = pods;
        }
    }

    #[async_trait]
    impl KubeletPods for FakeKubelet {
        async fn pods(&self) -> Result<Vec<Pod>, ApiError> {
            Ok(self.pods.lock().unwrap().clone())
        }
    }

    fn pod_spec(name: &str, image: &str) -> StaticPodSpec {
        StaticPodSpec {
            pod: json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": name, "namespace": "kube-system"},
                "spec": {"containers": [{"name": name, "image": image}]},
            })
            .as_object()
            .unwrap()
            .clone(),
        }
    }

    fn running_pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn writer(
        state: &State,
        kubelet: &Arc<FakeKubelet>,
        dir: &Path,
    ) -> StaticPodWriter<FakeKubelet> {
        StaticPodWriter::new(
            state.clone(),
            kubelet.clone(),
            dir.to_path_buf(),
            "node-1".to_string(),
            Duration::from_secs(15),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(manifest_file_name("kube-apiserver"), "kube-apiserver.yaml");
        assert_eq!(manifest_file_name("a/b c:d"), "a_b_c_d.yaml");
        assert_eq!(manifest_file_name("v1.2_x"), "v1.2_x.yaml");
    }

    #[tokio::test]
    async fn identical_writes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_atomic(dir.path(), "a.yaml", b"one".to_vec()).await.unwrap());
        assert!(!write_atomic(dir.path(), "a.yaml", b"one".to_vec()).await.unwrap());
        assert!(write_atomic(dir.path(), "a.yaml", b"two".to_vec()).await.unwrap());
        assert_eq!(std::fs::read(dir.path().join("a.yaml")).unwrap(), b"two");
        // No temporary files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_never_see_partial_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let old = render_manifest(&pod_spec("kube-scheduler", "old:1")).unwrap();
        let new = render_manifest(&pod_spec("kube-scheduler", &"x".repeat(64 * 1024))).unwrap();
        write_atomic(dir.path(), "kube-scheduler.yaml", old.clone())
            .await
            .unwrap();

        let path = dir.path().join("kube-scheduler.yaml");
        let reader = {
            let (old, new) = (old.clone(), new.clone());
            tokio::task::spawn_blocking(move || {
                for _ in 0..500 {
                    let contents = std::fs::read(&path).unwrap();
                    assert!(contents == old || contents == new);
                    let _: Map<String, Value> = serde_yaml::from_slice(&contents).unwrap();
                }
            })
        };
        for i in 0..50 {
            let contents = if i % 2 == 0 { new.clone() } else { old.clone() };
            write_atomic(dir.path(), "kube-scheduler.yaml", contents)
                .await
                .unwrap();
        }
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn renders_and_removes_strays() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("leftover.yaml"), b"kind: Pod").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        let state = State::new();
        state
            .create(Resource::new("kube-apiserver", "renderer", pod_spec("kube-apiserver", "api:1")))
            .await
            .unwrap();
        let kubelet = Arc::new(FakeKubelet::default());
        let writer = writer(&state, &kubelet, dir.path());

        writer.reconcile_files(false).await.unwrap();
        assert!(!dir.path().join("kube-apiserver.yaml").exists());
        assert!(!dir.path().join("leftover.yaml").exists());
        assert!(dir.path().join("notes.txt").exists());
        let pod = state.get::<StaticPodSpec>("kube-apiserver").await.unwrap();
        assert!(pod.metadata().has_finalizer(FINALIZER));

        writer.reconcile_files(true).await.unwrap();
        let on_disk: Map<String, Value> =
            serde_yaml::from_slice(&std::fs::read(dir.path().join("kube-apiserver.yaml")).unwrap())
                .unwrap();
        assert_eq!(on_disk, pod_spec("kube-apiserver", "api:1").pod);
    }

    #[tokio::test]
    async fn status_follows_kubelet_without_redundant_writes() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new();
        state
            .create(Resource::new("kube-apiserver", "renderer", pod_spec("kube-apiserver", "api:1")))
            .await
            .unwrap();
        let kubelet = Arc::new(FakeKubelet::default());
        let writer = writer(&state, &kubelet, dir.path());

        writer.reconcile_statuses().await.unwrap();
        assert!(state
            .get::<StaticPodStatusSpec>("kube-apiserver")
            .await
            .unwrap_err()
            .is_not_found());

        kubelet.set(vec![running_pod("kube-apiserver-node-1", "Running")]);
        writer.reconcile_statuses().await.unwrap();
        writer.reconcile_statuses().await.unwrap();
        let status = state
            .get::<StaticPodStatusSpec>("kube-apiserver")
            .await
            .unwrap();
        assert_eq!(status.metadata().version(), 1);
        assert_eq!(status.spec().pod_status["phase"], json!("Running"));

        kubelet.set(vec![running_pod("kube-apiserver-node-1", "Failed")]);
        writer.reconcile_statuses().await.unwrap();
        let status = state
            .get::<StaticPodStatusSpec>("kube-apiserver")
            .await
            .unwrap();
        assert_eq!(status.metadata().version(), 2);
    }

    #[tokio::test]
    async fn teardown_removes_manifest_before_releasing_pod() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new();
        state
            .create(Resource::new("kube-apiserver", "renderer", pod_spec("kube-apiserver", "api:1")))
            .await
            .unwrap();
        let kubelet = Arc::new(FakeKubelet::default());
        let writer = writer(&state, &kubelet, dir.path());
        let file = dir.path().join("kube-apiserver.yaml");

        writer.reconcile_files(true).await.unwrap();
        assert!(file.exists());
        assert!(!state
            .teardown::<StaticPodSpec>("kube-apiserver", "renderer")
            .await
            .unwrap());

        // Status refresh first: the kubelet doesn't report the pod, but the
        // manifest is still on disk.
        writer.reconcile_statuses().await.unwrap();
        assert!(!file.exists());
        let pod = state.get::<StaticPodSpec>("kube-apiserver").await.unwrap();
        assert!(pod.metadata().has_finalizer(FINALIZER));

        writer.reconcile_statuses().await.unwrap();
        let pod = state.get::<StaticPodSpec>("kube-apiserver").await.unwrap();
        assert!(!pod.metadata().has_finalizer(FINALIZER));
    }

    #[tokio::test]
    async fn status_is_dropped_when_kubelet_forgets_pod() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new();
        state
            .create(Resource::new("kube-apiserver", "renderer", pod_spec("kube-apiserver", "api:1")))
            .await
            .unwrap();
        let kubelet = Arc::new(FakeKubelet::default());
        let writer = writer(&state, &kubelet, dir.path());

        kubelet.set(vec![running_pod("kube-apiserver-node-1", "Running")]);
        writer.reconcile_statuses().await.unwrap();
        assert!(state
            .get::<StaticPodStatusSpec>("kube-apiserver")
            .await
            .is_ok());

        kubelet.set(vec![]);
        writer.reconcile_statuses().await.unwrap();
        assert!(state
            .get::<StaticPodStatusSpec>("kube-apiserver")
            .await
            .unwrap_err()
            .is_not_found());
        let pod = state.get::<StaticPodSpec>("kube-apiserver").await.unwrap();
        assert_eq!(pod.metadata().phase(), Phase::Running);
    }
}
