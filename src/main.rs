use anyhow::Result;
use tracing_subscriber::EnvFilter;

use aqe::storage::db::HISTORY_LOOKUP_DEADLINE;
use aqe::storage::{meta, Db};
use aqe::web::{start_server, AppState};
use aqe::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(db_path = %config.db_path, "opening backing database");

    let db = Db::open(&config.db_path)?;
    db.call(HISTORY_LOOKUP_DEADLINE, "meta bootstrap", meta::ensure_meta_tables)
        .await?;

    start_server(AppState::new(db), config.port).await
}
