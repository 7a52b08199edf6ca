//! A node agent which bootstraps a Kubernetes node and keeps it discoverable
//! by its peers.
//!
//! Reconcilers talk to each other only through a shared
//! [`State`](kubenode_state::State):
//!
//! * manifest bundles are parsed into `Manifest` resources and applied to
//!   the API server by the [`ManifestReconciler`](manifest::ManifestReconciler),
//! * `StaticPod` resources are rendered into the kubelet manifest directory by
//!   the [`StaticPodWriter`](static_pod::StaticPodWriter),
//! * the local `Affiliate` is published as `Node` annotations and peers are
//!   mirrored back by the [`DiscoveryReconciler`](discovery::DiscoveryReconciler).
//!
//! # Example
//! ```rust,no_run
//! use kubenode::{config::Config, Agent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default_config()?;
//!     Agent::new(config).start().await
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

mod agent;
pub mod backoff;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod kubeconfig;
pub mod local_affiliate;
pub mod manifest;
pub mod resources;
pub mod secrets;
pub mod shutdown;
pub mod source;
pub mod static_pod;

pub use self::agent::Agent;
