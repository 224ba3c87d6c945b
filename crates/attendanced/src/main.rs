use anyhow::Result;
use attendanced::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        port = config.port,
        db = %config.db_path.display(),
        pool = config.db_pool_size,
        uploads = %config.upload_dir.display(),
        "attendanced starting"
    );

    attendanced::serve(config).await
}
