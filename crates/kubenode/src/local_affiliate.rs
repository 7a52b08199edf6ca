//! Publishes this node's own `Affiliate`.
use kubenode_state::{Resource, State};
use tracing::{info, warn};

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::resources::AffiliateSpec;
use crate::shutdown::Shutdown;

/// Owner of the local `Affiliate`.
pub const OWNER: &str = "local-affiliate";

/// Writes `Affiliate(node_id)` from the configured identity.
pub struct LocalAffiliate {
    state: State,
    affiliate: AffiliateSpec,
}

impl LocalAffiliate {
    /// Create a publisher for `affiliate`.
    pub fn new(state: State, affiliate: AffiliateSpec) -> Self {
        LocalAffiliate { state, affiliate }
    }

    /// The affiliate being published.
    pub fn affiliate(&self) -> &AffiliateSpec {
        &self.affiliate
    }

    /// Publishes the affiliate, then waits for shutdown.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut backoff = ExponentialBackoffStrategy::default();
        loop {
            match self.publish().await {
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to publish local affiliate");
                    tokio::select! {
                        _ = shutdown.wait() => return Ok(()),
                        _ = backoff.wait() => {}
                    }
                }
            }
        }
        shutdown.wait().await;
        Ok(())
    }

    /// Creates or updates the local affiliate.
    pub async fn publish(&self) -> anyhow::Result<Resource<AffiliateSpec>> {
        let affiliate = &self.affiliate;
        let stored = self
            .state
            .modify::<AffiliateSpec, _>(&affiliate.node_id, OWNER, |spec| {
                *spec = affiliate.clone()
            })
            .await?;
        info!(
            node_id = %affiliate.node_id,
            nodename = %affiliate.nodename,
            version = stored.metadata().version(),
            "Published local affiliate"
        );
        Ok(stored)
    }
}
