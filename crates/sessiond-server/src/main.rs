mod config;
mod server;

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "libsessiond=info,sessiond_server=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let args = config::Args::parse()?;
    let cfg = config::load_runtime_config(&args)?;
    server::run(cfg).await
}
