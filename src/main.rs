use tracing_subscriber::EnvFilter;

use mcp_gateway::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mcp_gateway=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        database = %config.database_path.display(),
        default_metadata_url = %config.default_metadata_url,
        "Loaded configuration"
    );

    api::serve(config).await
}
