use aerotrack::config::PipelineConfig;
use aerotrack::pg_store::{create_pool, run_migrations};
use anyhow::Result;
use tracing::info;

pub async fn handle_migrate(config: &PipelineConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "migrate");
    });

    let pool = create_pool(config.database_url()?, 1)?;
    let applied = run_migrations(&pool).await?;
    if applied.is_empty() {
        info!("Database schema is up to date");
    }
    for migration in applied {
        info!("Applied migration {}", migration);
    }
    Ok(())
}
