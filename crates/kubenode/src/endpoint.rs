//! Publishes the control plane addresses this node uses to reach the API
//! server.
use std::net::IpAddr;

use futures::StreamExt;
use kubenode_state::State;
use tracing::{debug, info, warn};

use crate::resources::{AffiliateSpec, EndpointSpec, CONTROLPLANE_ENDPOINT_ID};
use crate::shutdown::Shutdown;

/// Owner of the `Endpoint(controlplane)` resource.
pub const OWNER: &str = "endpoint";

/// Keeps `Endpoint(controlplane)` equal to the configured endpoints plus the
/// addresses of every known control plane affiliate.
pub struct EndpointPublisher {
    state: State,
    static_endpoints: Vec<IpAddr>,
}

impl EndpointPublisher {
    /// `static_endpoints` are always part of the published set.
    pub fn new(state: State, static_endpoints: Vec<IpAddr>) -> Self {
        EndpointPublisher {
            state,
            static_endpoints,
        }
    }

    /// Publishes until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut affiliates = self.state.watch::<AffiliateSpec>(None).await;
        if let Err(e) = self.publish().await {
            warn!(error = %e, "Failed to publish control plane endpoints");
        }

        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                event = affiliates.next() => match event {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Affiliate watch failed, restarting");
                        affiliates = self.state.watch::<AffiliateSpec>(None).await;
                    }
                    None => affiliates = self.state.watch::<AffiliateSpec>(None).await,
                },
            }

            if let Err(e) = self.publish().await {
                warn!(error = %e, "Failed to publish control plane endpoints");
            }
        }
    }

    /// Computes and stores the endpoint set.
    ///
    /// An empty set is never written; the previous endpoints stay in place
    /// until some control plane member is known again.
    pub async fn publish(&self) -> anyhow::Result<Option<EndpointSpec>> {
        let affiliates = self.state.list::<AffiliateSpec>().await?;
        let endpoints = EndpointSpec::from_addresses(
            self.static_endpoints.iter().copied().chain(
                affiliates
                    .iter()
                    .map(|a| a.spec())
                    .filter(|a| a.machine_type.is_control_plane())
                    .flat_map(|a| a.addresses.iter().copied()),
            ),
        );

        if endpoints.addresses.is_empty() {
            debug!("No control plane endpoints known");
            return Ok(None);
        }

        let previous = self
            .state
            .get::<EndpointSpec>(CONTROLPLANE_ENDPOINT_ID)
            .await
            .ok()
            .map(|r| r.metadata().version());
        let stored = self
            .state
            .modify::<EndpointSpec, _>(CONTROLPLANE_ENDPOINT_ID, OWNER, |spec| {
                *spec = endpoints.clone()
            })
            .await?;
        if previous != Some(stored.metadata().version()) {
            info!(addresses = ?endpoints.addresses, "Updated control plane endpoints");
        }
        Ok(Some(endpoints))
    }
}
