//! Apply the Brewline schema to the configured database.

use anyhow::Context;
use tracing::info;

use brewline_infra::{Config, PostgresStorage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    brewline_observability::init_with(config.log_format);

    let storage = PostgresStorage::connect(&config)
        .await
        .context("connecting to postgres")?;
    storage.migrate().await.context("applying schema")?;

    info!(max_connections = config.max_connections, "schema up to date");
    Ok(())
}
