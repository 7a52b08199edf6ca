use kubenode::config::Config;
use kubenode::Agent;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION")).await?;

    let agent = Agent::new(config);
    agent.start().await
}
