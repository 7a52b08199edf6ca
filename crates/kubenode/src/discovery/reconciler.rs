use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kubenode_state::{Error as StateError, EventType, State};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::registry::Registry;
use crate::backoff::{full_jitter, sleep_until, BackoffStrategy, ExponentialBackoffStrategy};
use crate::error::{with_deadline, ApiError};
use crate::resources::{AffiliateSpec, KUBERNETES_CLIENT_SECRETS};
use crate::secrets::SecretsGate;
use crate::shutdown::Shutdown;

/// Owner of peer `Affiliate` resources learned from the registry.
pub const OWNER: &str = "discovery";

/// Publishes the local affiliate to a [`Registry`] and mirrors the peers it
/// lists into the state.
pub struct DiscoveryReconciler<R> {
    state: State,
    registry: Arc<R>,
    local_node_id: String,
    node_name: String,
    operation_timeout: Duration,
}

impl<R: Registry> DiscoveryReconciler<R> {
    /// `local_node_id` is the ID of this node's own `Affiliate`, which is
    /// pushed and never mirrored.
    pub fn new(
        state: State,
        registry: Arc<R>,
        local_node_id: String,
        node_name: String,
        operation_timeout: Duration,
    ) -> Self {
        DiscoveryReconciler {
            state,
            registry,
            local_node_id,
            node_name,
            operation_timeout,
        }
    }

    /// Pushes and pulls until shutdown.
    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<()> {
        tokio::try_join!(self.push_loop(shutdown.clone()), self.pull_loop(shutdown))?;
        info!("Discovery stopped");
        Ok(())
    }

    async fn push_loop(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut gate = SecretsGate::new(self.state.clone(), KUBERNETES_CLIENT_SECRETS).await;
        let mut local = self
            .state
            .watch::<AffiliateSpec>(Some(&self.local_node_id))
            .await;
        let mut backoff = ExponentialBackoffStrategy::default();
        let mut pending: Option<AffiliateSpec> = None;
        let mut retry_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                _ = gate.changed() => {}
                event = local.next() => match event {
                    Some(Ok(event)) if event.type_ == EventType::Destroyed => pending = None,
                    Some(Ok(event)) => pending = Some(event.resource.into_spec()),
                    Some(Err(e)) => {
                        warn!(error = %e, "Local affiliate watch failed, restarting");
                        local = self.state.watch::<AffiliateSpec>(Some(&self.local_node_id)).await;
                    }
                    None => {
                        local = self.state.watch::<AffiliateSpec>(Some(&self.local_node_id)).await;
                    }
                },
                _ = sleep_until(retry_at) => retry_at = None,
            }

            if retry_at.is_some() || !gate.is_ready() {
                continue;
            }
            let affiliate = match &pending {
                Some(affiliate) => affiliate.clone(),
                None => continue,
            };

            let version = gate.version().unwrap_or_default();
            let pushed = match self.registry.connect(version).await {
                Ok(()) => with_deadline(self.operation_timeout, self.registry.push(&affiliate)).await,
                Err(e) => Err(e),
            };
            match pushed {
                Ok(()) => {
                    debug!(node_id = %affiliate.node_id, "Pushed local affiliate");
                    pending = None;
                    backoff.reset();
                }
                Err(e) => {
                    let delay = full_jitter(backoff.next_duration());
                    warn!(error = %e, retry_in = ?delay, "Failed to push local affiliate");
                    retry_at = Some(Instant::now() + delay);
                }
            }
        }
    }

    /// Keeps one registry watch open per secrets version and syncs peers on
    /// every notification.
    async fn pull_loop(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut gate = SecretsGate::new(self.state.clone(), KUBERNETES_CLIENT_SECRETS).await;
        let mut backoff = ExponentialBackoffStrategy::default();
        let mut changes: Option<mpsc::Receiver<()>> = None;
        let mut watched: Option<String> = None;
        let mut retry_at: Option<Instant> = None;

        loop {
            let wanted = gate
                .is_ready()
                .then(|| gate.version().unwrap_or_default().to_string());
            if wanted != watched {
                // Dropping the receiver stops the watch opened with the old
                // credentials.
                changes = None;
                watched = None;
            }
            match wanted {
                Some(version) if changes.is_none() && retry_at.is_none() => {
                    match self.open_watch(&version, shutdown.clone()).await {
                        Ok(receiver) => {
                            changes = Some(receiver);
                            watched = Some(version);
                            backoff.reset();
                        }
                        Err(e) => {
                            let delay = full_jitter(backoff.next_duration());
                            warn!(error = %e, retry_in = ?delay, "Failed to watch discovery registry");
                            retry_at = Some(Instant::now() + delay);
                        }
                    }
                }
                _ => {}
            }

            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                _ = gate.changed() => {}
                _ = sleep_until(retry_at) => retry_at = None,
                change = recv(&mut changes) => match change {
                    Some(()) => {
                        if let Err(e) = self.sync_peers().await {
                            warn!(error = %e, "Failed to sync discovered affiliates");
                        }
                    }
                    None => {
                        debug!("Discovery registry watch ended");
                        changes = None;
                        watched = None;
                        retry_at = Some(Instant::now() + full_jitter(backoff.next_duration()));
                    }
                },
            }
        }
    }

    async fn open_watch(
        &self,
        secrets_version: &str,
        shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<()>, ApiError> {
        self.registry.connect(secrets_version).await?;
        self.registry.watch(shutdown).await
    }

    /// Makes the set of `Affiliate` resources owned by discovery equal to the
    /// peers currently listed by the registry.
    #[instrument(level = "debug", skip(self))]
    pub async fn sync_peers(&self) -> Result<(), ApiError> {
        let listed = with_deadline(self.operation_timeout, self.registry.list(&self.node_name))
            .await?;

        let mut peers = BTreeMap::new();
        for affiliate in listed {
            if affiliate.node_id.is_empty()
                || affiliate.node_id == self.local_node_id
                || affiliate.nodename == self.node_name
            {
                continue;
            }
            peers.entry(affiliate.node_id.clone()).or_insert(affiliate);
        }

        for (id, affiliate) in &peers {
            match self
                .state
                .modify::<AffiliateSpec, _>(id, OWNER, |spec| *spec = affiliate.clone())
                .await
            {
                Ok(_) => {}
                Err(StateError::OwnerConflict { owner, .. }) => {
                    debug!(%id, %owner, "Affiliate owned elsewhere, not mirroring");
                }
                Err(e) => return Err(ApiError::Transient(e.to_string())),
            }
        }

        let existing = self
            .state
            .list::<AffiliateSpec>()
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;
        for resource in existing {
            if resource.metadata().owner() != OWNER || peers.contains_key(resource.id()) {
                continue;
            }
            match self
                .state
                .destroy::<AffiliateSpec>(resource.id(), OWNER, None)
                .await
            {
                Ok(()) => info!(id = %resource.id(), "Peer left the cluster"),
                Err(StateError::NotFound(_)) | Err(StateError::HasFinalizers(_)) => {}
                Err(e) => return Err(ApiError::Transient(e.to_string())),
            }
        }
        Ok(())
    }
}

/// Next notification, or never without a watch.
async fn recv(changes: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match changes {
        Some(receiver) => receiver.recv().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::SecretsStatusSpec;
    use async_trait::async_trait;
    use kubenode_state::Resource;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegistry {
        peers: Mutex<Vec<AffiliateSpec>>,
        pushed: Mutex<Vec<AffiliateSpec>>,
        fail_pushes: Mutex<usize>,
        notify: Mutex<Option<mpsc::Sender<()>>>,
        connects: Mutex<Vec<String>>,
        watches: Mutex<usize>,
    }

    #[async_trait]
    impl Registry for FakeRegistry {
        async fn connect(&self, secrets_version: &str) -> Result<(), ApiError> {
            self.connects.lock().unwrap().push(secrets_version.to_string());
            Ok(())
        }

        async fn push(&self, affiliate: &AffiliateSpec) -> Result<(), ApiError> {
            let mut fail = self.fail_pushes.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(ApiError::Transient("unavailable".to_string()));
            }
            self.pushed.lock().unwrap().push(affiliate.clone());
            Ok(())
        }

        async fn watch(&self, _shutdown: Shutdown) -> Result<mpsc::Receiver<()>, ApiError> {
            let (tx, rx) = mpsc::channel(1);
            tx.try_send(()).unwrap();
            *self.notify.lock().unwrap() = Some(tx);
            *self.watches.lock().unwrap() += 1;
            Ok(rx)
        }

        async fn list(&self, local_nodename: &str) -> Result<Vec<AffiliateSpec>, ApiError> {
            Ok(self
                .peers
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.nodename != local_nodename)
                .cloned()
                .collect())
        }
    }

    fn peer(id: &str, nodename: &str) -> AffiliateSpec {
        AffiliateSpec {
            node_id: id.to_string(),
            nodename: nodename.to_string(),
            addresses: vec!["10.0.0.3".parse().unwrap()],
            ..Default::default()
        }
    }

    fn reconciler(state: &State, registry: &Arc<FakeRegistry>) -> DiscoveryReconciler<FakeRegistry> {
        DiscoveryReconciler::new(
            state.clone(),
            registry.clone(),
            "self-id".to_string(),
            "local".to_string(),
            Duration::from_secs(5),
        )
    }

    async fn secrets_ready(state: &State, version: &str) {
        state
            .modify::<SecretsStatusSpec, _>(KUBERNETES_CLIENT_SECRETS, crate::secrets::OWNER, |s| {
                s.ready = true;
                s.version = version.to_string();
            })
            .await
            .unwrap();
    }

    async fn mirrored(state: &State) -> Vec<(String, u64)> {
        state
            .list::<AffiliateSpec>()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.metadata().owner() == OWNER)
            .map(|r| (r.id().to_string(), r.metadata().version()))
            .collect()
    }

    #[tokio::test]
    async fn mirrors_peers_and_skips_self() {
        let state = State::new();
        let registry = Arc::new(FakeRegistry::default());
        *registry.peers.lock().unwrap() = vec![
            peer("a", "node-a"),
            peer("b", "node-b"),
            peer("self-id", "renamed"),
            peer("c", "local"),
        ];
        let reconciler = reconciler(&state, &registry);

        reconciler.sync_peers().await.unwrap();
        assert_eq!(
            mirrored(&state).await,
            vec![("a".to_string(), 1), ("b".to_string(), 1)]
        );

        // Nothing changed upstream, nothing is rewritten.
        reconciler.sync_peers().await.unwrap();
        assert_eq!(
            mirrored(&state).await,
            vec![("a".to_string(), 1), ("b".to_string(), 1)]
        );

        registry.peers.lock().unwrap().remove(0);
        reconciler.sync_peers().await.unwrap();
        assert_eq!(mirrored(&state).await, vec![("b".to_string(), 1)]);
    }

    #[tokio::test]
    async fn leaves_local_affiliate_alone() {
        let state = State::new();
        state
            .create(Resource::new("self-id", "local-affiliate", peer("self-id", "local")))
            .await
            .unwrap();
        let registry = Arc::new(FakeRegistry::default());
        reconciler(&state, &registry).sync_peers().await.unwrap();

        let local = state.get::<AffiliateSpec>("self-id").await.unwrap();
        assert_eq!(local.metadata().owner(), "local-affiliate");
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_local_affiliate_with_retries() {
        let state = State::new();
        let registry = Arc::new(FakeRegistry::default());
        *registry.fail_pushes.lock().unwrap() = 2;
        *registry.peers.lock().unwrap() = vec![peer("a", "node-a")];

        let (trigger, shutdown) = crate::shutdown::channel();
        let task = tokio::spawn(reconciler(&state, &registry).run(shutdown));

        state
            .create(Resource::new("self-id", "local-affiliate", peer("self-id", "local")))
            .await
            .unwrap();
        secrets_ready(&state, "1").await;

        for _ in 0..100 {
            if !registry.pushed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(registry.pushed.lock().unwrap().len(), 1);
        assert_eq!(mirrored(&state).await, vec![("a".to_string(), 1)]);

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_secrets_and_rewatches_on_rotation() {
        let state = State::new();
        let registry = Arc::new(FakeRegistry::default());
        *registry.peers.lock().unwrap() = vec![peer("a", "node-a")];
        state
            .create(Resource::new("self-id", "local-affiliate", peer("self-id", "local")))
            .await
            .unwrap();

        let (trigger, shutdown) = crate::shutdown::channel();
        let task = tokio::spawn(reconciler(&state, &registry).run(shutdown));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*registry.watches.lock().unwrap(), 0);
        assert!(registry.pushed.lock().unwrap().is_empty());
        assert!(mirrored(&state).await.is_empty());

        secrets_ready(&state, "1").await;
        for _ in 0..100 {
            if *registry.watches.lock().unwrap() == 1 && !registry.pushed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(*registry.watches.lock().unwrap(), 1);
        assert_eq!(registry.pushed.lock().unwrap().len(), 1);
        assert_eq!(mirrored(&state).await, vec![("a".to_string(), 1)]);
        let first_watch = registry.notify.lock().unwrap().clone().unwrap();

        secrets_ready(&state, "2").await;
        for _ in 0..100 {
            if *registry.watches.lock().unwrap() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(*registry.watches.lock().unwrap(), 2);
        assert!(registry.connects.lock().unwrap().contains(&"2".to_string()));
        // The old watch was dropped along with the old credentials.
        assert!(first_watch.is_closed());

        trigger.trigger();
        task.await.unwrap().unwrap();
    }
}
