//! Control plane manifests: parsing bundles and applying them to the API
//! server.
pub mod client;
pub mod parser;
mod reconciler;

pub use client::{KubeObjectClient, ObjectClient, ObjectRef};
pub use parser::{parse_yaml, ParseError};
pub use reconciler::{ManifestReconciler, PassError, OWNER};
