//! Configuration for a node agent
//!
//! The best way to configure the agent is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
#[cfg(feature = "cli")]
use structopt::StructOpt;
use url::Url;

use crate::resources::{AffiliateSpec, ControlPlane, KubeSpanAffiliateSpec, MachineType};

const MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";
const MANIFEST_SOURCE_DIR: &str = "/etc/kubenode/manifests";
const STATIC_POD_SOURCE_DIR: &str = "/etc/kubenode/static-pods";
const KUBELET_URL: &str = "http://127.0.0.1:10255";
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
const PKI_DIR: &str = "/etc/kubernetes/pki";
const MACHINE_ID_FILE: &str = "/etc/machine-id";

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MANIFEST_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_KUBELET_POLL_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_SOURCE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The configuration needed for the agent to run.
///
/// This can be configured manually in your code or, if you are exposing a
/// CLI, with [`Config::new_from_flags`] (this requires the "cli" feature).
#[derive(Clone, Debug)]
pub struct Config {
    /// The name the kubelet registers this node under
    pub node_name: String,
    /// The hostname of the node
    pub hostname: String,
    /// Identity published as this node's affiliate
    pub identity: Identity,
    /// Kubeconfig used to reach the API server, read once the Kubernetes
    /// client secrets are ready
    pub kubeconfig: PathBuf,
    /// The kubelet static pod manifest directory
    pub manifests_dir: PathBuf,
    /// Directory of manifest bundles to apply to the cluster
    pub manifest_source_dir: PathBuf,
    /// Directory of static pod definitions
    pub static_pod_source_dir: PathBuf,
    /// Base URL of the kubelet read-only API
    pub kubelet_url: Url,
    /// Files which must exist before the Kubernetes API is used
    pub kubernetes_client_secrets: Vec<PathBuf>,
    /// Files which must exist before static pods are written
    pub static_pod_secrets: Vec<PathBuf>,
    /// Statically known control plane addresses
    pub controlplane_endpoints: Vec<IpAddr>,
    /// Deadline for every remote call
    pub operation_timeout: Duration,
    /// Period of manifest drift correction, `None` disables it
    pub manifest_sweep_interval: Option<Duration>,
    /// Period of kubelet pod status polling
    pub kubelet_poll_interval: Duration,
    /// Period of source and secret file polling
    pub source_poll_interval: Duration,
}

/// Identity of the local node, usually read from a YAML file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Cluster-unique node identifier
    pub node_id: String,
    /// Role of the node
    #[serde(default)]
    pub machine_type: MachineType,
    /// Addresses advertised to peers
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    /// OS descriptor, defaults to the agent name and version
    #[serde(default)]
    pub operating_system: Option<String>,
    /// KubeSpan identity, if the overlay is enabled
    #[serde(default)]
    pub kubespan: Option<KubeSpanAffiliateSpec>,
    /// Port of the local API server, control plane nodes only
    #[serde(default)]
    pub api_server_port: Option<u16>,
}

impl Identity {
    /// Reads an identity file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read(path).await?;
        let identity: Identity = serde_yaml::from_slice(&contents)?;
        if identity.node_id.is_empty() {
            anyhow::bail!("identity file {} has no node_id", path.display());
        }
        Ok(identity)
    }

    /// Builds an identity whose node ID is derived from the machine ID, or
    /// from the node name when there is none.
    pub fn generate(node_name: &str) -> Self {
        let seed = std::fs::read(MACHINE_ID_FILE).unwrap_or_else(|_| node_name.as_bytes().to_vec());
        let digest = Sha256::digest(&seed);
        Identity {
            node_id: digest.iter().map(|b| format!("{:02x}", b)).collect(),
            ..Default::default()
        }
    }

    /// The affiliate describing this node.
    pub fn affiliate(&self, node_name: &str, hostname: &str) -> AffiliateSpec {
        AffiliateSpec {
            node_id: self.node_id.clone(),
            hostname: hostname.to_string(),
            nodename: node_name.to_string(),
            machine_type: self.machine_type,
            addresses: self.addresses.clone(),
            operating_system: self
                .operating_system
                .clone()
                .unwrap_or_else(default_operating_system),
            kubespan: self.kubespan.clone().filter(|k| !k.is_empty()),
            control_plane: self
                .api_server_port
                .map(|api_server_port| ControlPlane { api_server_port }),
        }
    }
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config() -> anyhow::Result<Self> {
        let hostname = default_hostname()?;
        let node_name = sanitize_hostname(&hostname);
        Ok(Config {
            identity: Identity::generate(&node_name),
            node_name,
            hostname,
            kubeconfig: PathBuf::from(ADMIN_KUBECONFIG),
            manifests_dir: PathBuf::from(MANIFESTS_DIR),
            manifest_source_dir: PathBuf::from(MANIFEST_SOURCE_DIR),
            static_pod_source_dir: PathBuf::from(STATIC_POD_SOURCE_DIR),
            kubelet_url: Url::parse(KUBELET_URL)?,
            kubernetes_client_secrets: vec![PathBuf::from(ADMIN_KUBECONFIG)],
            static_pod_secrets: vec![PathBuf::from(PKI_DIR)],
            controlplane_endpoints: vec![],
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            manifest_sweep_interval: Some(DEFAULT_MANIFEST_SWEEP_INTERVAL),
            kubelet_poll_interval: DEFAULT_KUBELET_POLL_INTERVAL,
            source_poll_interval: DEFAULT_SOURCE_POLL_INTERVAL,
        })
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub async fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Self::from_opts(opts).await
    }

    /// Builds a config from already parsed options.
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub async fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let hostname = match opts.hostname {
            Some(hostname) => hostname,
            None => default_hostname()?,
        };
        let node_name = opts
            .node_name
            .unwrap_or_else(|| sanitize_hostname(&hostname));
        let identity = match &opts.identity_file {
            Some(path) => Identity::load(path).await?,
            None => Identity::generate(&node_name),
        };

        let or_default = |paths: Vec<PathBuf>, default: &Path| {
            if paths.is_empty() {
                vec![default.to_path_buf()]
            } else {
                paths
            }
        };

        Ok(Config {
            identity,
            node_name,
            hostname,
            kubernetes_client_secrets: or_default(opts.kubernetes_client_secrets, &opts.kubeconfig),
            kubeconfig: opts.kubeconfig,
            manifests_dir: opts.manifests_dir,
            manifest_source_dir: opts.manifest_source_dir,
            static_pod_source_dir: opts.static_pod_source_dir,
            kubelet_url: opts.kubelet_url,
            static_pod_secrets: or_default(opts.static_pod_secrets, Path::new(PKI_DIR)),
            controlplane_endpoints: opts.controlplane_endpoints,
            operation_timeout: opts.operation_timeout,
            manifest_sweep_interval: Some(opts.manifest_sweep_interval)
                .filter(|interval| !interval.is_zero()),
            kubelet_poll_interval: opts.kubelet_poll_interval,
            source_poll_interval: opts.source_poll_interval,
        })
    }
}

/// CLI options that can be configured for the agent
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "kubenode",
    about = "Bootstraps a Kubernetes node and keeps it discoverable by its peers"
)]
pub struct Opts {
    #[structopt(
        long = "node-name",
        env = "KUBENODE_NODE_NAME",
        help = "The name for this node in Kubernetes, defaults to the hostname of this machine"
    )]
    node_name: Option<String>,

    #[structopt(
        long = "hostname",
        env = "KUBENODE_HOSTNAME",
        help = "The hostname for this node, defaults to the hostname of this machine"
    )]
    hostname: Option<String>,

    #[structopt(
        long = "identity-file",
        env = "KUBENODE_IDENTITY_FILE",
        help = "YAML file with the node identity. Defaults to an ID derived from the machine ID"
    )]
    identity_file: Option<PathBuf>,

    #[structopt(
        long = "kubeconfig",
        env = "KUBECONFIG",
        default_value = ADMIN_KUBECONFIG,
        help = "The kubeconfig used to reach the API server, loaded once the Kubernetes client secrets are ready"
    )]
    kubeconfig: PathBuf,

    #[structopt(
        long = "manifests-dir",
        env = "KUBENODE_MANIFESTS_DIR",
        default_value = MANIFESTS_DIR,
        help = "The kubelet static pod manifest directory, owned by this agent"
    )]
    manifests_dir: PathBuf,

    #[structopt(
        long = "manifest-source-dir",
        env = "KUBENODE_MANIFEST_SOURCE_DIR",
        default_value = MANIFEST_SOURCE_DIR,
        help = "Directory of YAML bundles applied to the cluster"
    )]
    manifest_source_dir: PathBuf,

    #[structopt(
        long = "static-pod-source-dir",
        env = "KUBENODE_STATIC_POD_SOURCE_DIR",
        default_value = STATIC_POD_SOURCE_DIR,
        help = "Directory of static pod definitions"
    )]
    static_pod_source_dir: PathBuf,

    #[structopt(
        long = "kubelet-url",
        env = "KUBENODE_KUBELET_URL",
        default_value = KUBELET_URL,
        help = "Base URL of the kubelet read-only API"
    )]
    kubelet_url: Url,

    #[structopt(
        long = "kubernetes-client-secret",
        help = "File required before talking to the API server (repeatable). Defaults to the kubeconfig"
    )]
    kubernetes_client_secrets: Vec<PathBuf>,

    #[structopt(
        long = "static-pod-secret",
        help = "File required before writing static pods (repeatable). Defaults to the PKI directory"
    )]
    static_pod_secrets: Vec<PathBuf>,

    #[structopt(
        long = "controlplane-endpoint",
        help = "Statically known control plane address (repeatable)"
    )]
    controlplane_endpoints: Vec<IpAddr>,

    #[structopt(
        long = "operation-timeout",
        default_value = "30s",
        parse(try_from_str = parse_duration),
        help = "Deadline for every remote call"
    )]
    operation_timeout: Duration,

    #[structopt(
        long = "manifest-sweep-interval",
        default_value = "30s",
        parse(try_from_str = parse_duration),
        help = "How often applied manifests are checked for drift, 0 disables"
    )]
    manifest_sweep_interval: Duration,

    #[structopt(
        long = "kubelet-poll-interval",
        default_value = "15s",
        parse(try_from_str = parse_duration),
        help = "How often static pod status is read from the kubelet"
    )]
    kubelet_poll_interval: Duration,

    #[structopt(
        long = "source-poll-interval",
        default_value = "5s",
        parse(try_from_str = parse_duration),
        help = "How often source and secret files are read"
    )]
    source_poll_interval: Duration,
}

/// Parses durations like `500ms`, `30s`, `5m` or `1h`. A bare number is in
/// seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {:?}", value))?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "" | "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(number.saturating_mul(3600))),
        _ => Err(format!("invalid duration unit in {:?}", value)),
    }
}

fn default_hostname() -> anyhow::Result<String> {
    hostname::get()?
        .into_string()
        .map_err(|_| anyhow::anyhow!("invalid utf-8 hostname string"))
}

fn default_operating_system() -> String {
    format!("kubenode ({})", env!("CARGO_PKG_VERSION"))
}

// Some hostnames (particularly local ones) can have uppercase letters, which is
// disallowed by the DNS spec used in kubernetes naming.
fn sanitize_hostname(hostname: &str) -> String {
    hostname.to_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("0").unwrap(), Duration::from_secs(0));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn hostnames_are_lowercased() {
        assert_eq!(sanitize_hostname("Node-1.Example"), "node-1.example");
    }

    #[test]
    fn generated_identity_is_stable() {
        let a = Identity::generate("node-1");
        assert_eq!(a.node_id.len(), 64);
        assert_eq!(a, Identity::generate("node-1"));
    }

    #[tokio::test]
    async fn identity_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.yaml");
        std::fs::write(
            &path,
            "\
node_id: 29QQTc97U5ZyFTIX33Dp9NqtwxqQI8QI13scCLzffrZ
machine_type: controlplane
addresses: [10.0.0.2, 192.168.3.4]
api_server_port: 6443
kubespan:
  public_key: PLPNBddmTgHJhtw0vxltq1ZBdPP9RNOEUd5JjJZzBRY=
  endpoints: ['10.0.0.2:51820']
",
        )
        .unwrap();

        let identity = Identity::load(&path).await.unwrap();
        let affiliate = identity.affiliate("bar", "foo.com");
        assert_eq!(affiliate.node_id, "29QQTc97U5ZyFTIX33Dp9NqtwxqQI8QI13scCLzffrZ");
        assert_eq!(affiliate.nodename, "bar");
        assert_eq!(affiliate.hostname, "foo.com");
        assert_eq!(affiliate.machine_type, MachineType::ControlPlane);
        assert_eq!(affiliate.addresses.len(), 2);
        assert_eq!(
            affiliate.control_plane,
            Some(ControlPlane {
                api_server_port: 6443
            })
        );
        assert_eq!(affiliate.kubespan.unwrap().endpoints.len(), 1);
        assert!(affiliate.operating_system.starts_with("kubenode"));

        std::fs::write(&path, "machine_type: worker\n").unwrap();
        assert!(Identity::load(&path).await.is_err());
    }

    #[cfg(feature = "cli")]
    #[tokio::test]
    async fn flags() {
        let opts = Opts::from_iter_safe(&[
            "kubenode",
            "--node-name",
            "worker-1",
            "--hostname",
            "Worker-1.example",
            "--controlplane-endpoint",
            "10.0.0.1",
            "--controlplane-endpoint",
            "10.0.0.2",
            "--manifest-sweep-interval",
            "0",
            "--operation-timeout",
            "10s",
            "--kubeconfig",
            "/var/lib/kubenode/kubeconfig",
        ])
        .unwrap();
        let config = Config::from_opts(opts).await.unwrap();
        assert_eq!(config.node_name, "worker-1");
        assert_eq!(config.hostname, "Worker-1.example");
        assert_eq!(config.controlplane_endpoints.len(), 2);
        assert_eq!(config.manifest_sweep_interval, None);
        assert_eq!(config.operation_timeout, Duration::from_secs(10));
        assert_eq!(config.static_pod_secrets, vec![PathBuf::from(PKI_DIR)]);
        // The client is gated on the kubeconfig it is built from.
        assert_eq!(
            config.kubernetes_client_secrets,
            vec![PathBuf::from("/var/lib/kubenode/kubeconfig")]
        );
        assert_eq!(config.kubelet_url.as_str(), "http://127.0.0.1:10255/");
    }
}
