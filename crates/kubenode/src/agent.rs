//! The node agent: runs every reconciler against one shared [`State`].
use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use kubenode_state::State;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::config::Config;
use crate::discovery::{DiscoveryReconciler, KubernetesRegistry};
use crate::endpoint::EndpointPublisher;
use crate::kubeconfig::ClientCache;
use crate::local_affiliate::LocalAffiliate;
use crate::manifest::{KubeObjectClient, ManifestReconciler};
use crate::resources::{KUBERNETES_CLIENT_SECRETS, STATIC_POD_SECRETS};
use crate::secrets::{SecretSet, SecretsStatusPublisher};
use crate::shutdown;
use crate::source::{ManifestSource, StaticPodSource};
use crate::static_pod::{KubeletClient, StaticPodWriter};

/// Bootstraps a Kubernetes node and keeps it discoverable.
///
/// The agent owns a process-local [`State`] and runs one task per
/// reconciler: file sources feed `Manifest` and `StaticPod` resources,
/// the manifest reconciler applies them to the API server, the static pod
/// writer renders them for the kubelet and discovery publishes this node
/// and mirrors its peers through `Node` annotations.
pub struct Agent {
    config: Box<Config>,
}

type Component = JoinHandle<(&'static str, anyhow::Result<()>)>;

impl Agent {
    /// Create a new agent. The API server is only contacted once the
    /// kubeconfig named by `config` is ready.
    pub fn new(config: Config) -> Self {
        Agent {
            config: Box::new(config),
        }
    }

    /// Runs all reconcilers until Ctrl-C or SIGTERM, or until one of them
    /// fails.
    pub async fn start(&self) -> anyhow::Result<()> {
        let config = &self.config;
        let state = State::new();
        let (trigger, shutdown) = shutdown::channel();

        let local = LocalAffiliate::new(
            state.clone(),
            config.identity.affiliate(&config.node_name, &config.hostname),
        );
        info!(
            node_name = %config.node_name,
            node_id = %local.affiliate().node_id,
            "Starting node agent"
        );

        let secrets = SecretsStatusPublisher::new(
            state.clone(),
            vec![
                SecretSet {
                    consumer: KUBERNETES_CLIENT_SECRETS.to_string(),
                    paths: config.kubernetes_client_secrets.clone(),
                },
                SecretSet {
                    consumer: STATIC_POD_SECRETS.to_string(),
                    paths: config.static_pod_secrets.clone(),
                },
            ],
            config.source_poll_interval,
        );
        let manifest_source = ManifestSource::new(
            state.clone(),
            config.manifest_source_dir.clone(),
            config.source_poll_interval,
        );
        let static_pod_source = StaticPodSource::new(
            state.clone(),
            config.static_pod_source_dir.clone(),
            config.source_poll_interval,
        );
        let endpoints = EndpointPublisher::new(state.clone(), config.controlplane_endpoints.clone());
        let manifests = ManifestReconciler::new(
            state.clone(),
            Arc::new(KubeObjectClient::new(ClientCache::new(config.kubeconfig.clone()))),
            config.operation_timeout,
            config.manifest_sweep_interval,
        );
        let static_pods = StaticPodWriter::new(
            state.clone(),
            Arc::new(KubeletClient::new(&config.kubelet_url)?),
            config.manifests_dir.clone(),
            config.node_name.clone(),
            config.kubelet_poll_interval,
            config.operation_timeout,
        );
        let discovery = DiscoveryReconciler::new(
            state.clone(),
            Arc::new(KubernetesRegistry::new(ClientCache::new(config.kubeconfig.clone()))),
            local.affiliate().node_id.clone(),
            config.node_name.clone(),
            config.operation_timeout,
        );

        let mut components: FuturesUnordered<Component> = FuturesUnordered::new();
        components.push(spawn("secrets-status", secrets.run(shutdown.clone())));
        components.push(spawn("manifest-source", manifest_source.run(shutdown.clone())));
        components.push(spawn("static-pod-source", static_pod_source.run(shutdown.clone())));
        components.push(spawn("local-affiliate", local.run(shutdown.clone())));
        components.push(spawn("endpoint", endpoints.run(shutdown.clone())));
        components.push(spawn("manifest-apply", manifests.run(shutdown.clone())));
        components.push(spawn("static-pod-writer", static_pods.run(shutdown.clone())));
        components.push(spawn("discovery", discovery.run(shutdown)));

        let mut failed = false;
        tokio::select! {
            res = start_signal_task() => if let Err(e) = res {
                error!(error = %e, "Signal task completed with error");
            },
            Some(res) = components.next() => {
                failed = true;
                log_exit(res);
            }
        }

        info!("Shutting down");
        trigger.trigger();
        while let Some(res) = components.next().await {
            log_exit(res);
        }

        if failed {
            anyhow::bail!("a component stopped unexpectedly");
        }
        Ok(())
    }
}

fn spawn<F>(component: &'static str, task: F) -> Component
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let span = info_span!("component", name = component);
    tokio::spawn(async move { (component, task.await) }.instrument(span))
}

fn log_exit(res: Result<(&'static str, anyhow::Result<()>), tokio::task::JoinError>) {
    match res {
        Ok((component, Ok(()))) => info!(component, "Component stopped"),
        Ok((component, Err(e))) => error!(component, error = %e, "Component failed"),
        Err(e) => error!(error = %e, "Component panicked"),
    }
}

/// Awaits SIGINT or SIGTERM.
async fn start_signal_task() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                warn!("Caught keyboard interrupt.");
            }
            _ = terminate.recv() => warn!("Caught SIGTERM."),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        warn!("Caught keyboard interrupt.");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shutdown::Shutdown;

    #[tokio::test]
    async fn components_run_in_their_span_until_shutdown() {
        let (trigger, shutdown) = shutdown::channel();
        let mut waiting: Shutdown = shutdown.clone();
        let component = spawn("test", async move {
            waiting.wait().await;
            Ok(())
        });
        let failing = spawn("broken", async { anyhow::bail!("boom") });

        let (name, res) = failing.await.unwrap();
        assert_eq!(name, "broken");
        assert!(res.is_err());

        trigger.trigger();
        let (name, res) = component.await.unwrap();
        assert_eq!(name, "test");
        assert!(res.is_ok());
        drop(shutdown);
    }
}
