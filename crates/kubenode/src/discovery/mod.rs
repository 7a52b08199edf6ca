//! Cluster discovery over Kubernetes node annotations.
//!
//! The local `Affiliate` is published as annotations on this node's `Node`
//! object, and peers are discovered by reading the annotations of every other
//! node.
pub mod annotations;
mod reconciler;
mod registry;

pub use reconciler::{DiscoveryReconciler, OWNER};
pub use registry::{KubernetesRegistry, Registry, RESYNC_PERIOD};
