pub mod migrate;
pub mod poll_once;
pub mod run;
pub mod sweep;

pub use migrate::handle_migrate;
pub use poll_once::handle_poll_once;
pub use run::handle_run;
pub use sweep::handle_sweep;

use std::sync::Arc;

use aerotrack::config::PipelineConfig;
use aerotrack::memory_store::MemoryStore;
use aerotrack::pg_store;
use aerotrack::store::Store;
use anyhow::Result;
use tracing::{info, warn};

/// Connections kept by the pipeline's pool. Writes are serialized, so a
/// handful covers the writer plus keeper and ad-hoc reads.
const DB_POOL_SIZE: u32 = 8;

/// Postgres store from the configured URL, or an empty in-memory store for
/// dry runs
pub async fn open_store(config: &PipelineConfig, dry_run: bool) -> Result<Arc<dyn Store>> {
    if dry_run {
        warn!("Dry run: writing to an in-memory store, nothing is persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let url = config.database_url()?;
    info!("Connecting to database...");
    let store = pg_store::connect(url, DB_POOL_SIZE).await?;
    Ok(Arc::new(store))
}
