//! Static pods: rendering `StaticPod` resources for the kubelet and reading
//! their status back.
pub mod codec;
pub mod kubelet;
mod writer;

pub use kubelet::{KubeletClient, KubeletPods};
pub use writer::{manifest_file_name, write_atomic, StaticPodWriter, FINALIZER, OWNER};
