use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use stockflow_infra::runs::RunStore;
use stockflow_infra::{Engine, EngineConfig, EngineStores};
use tokio::runtime::Runtime;

const TICK: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    stockflow_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    // Stores block on this runtime from the engine's own threads, so the main
    // thread must stay outside any async context.
    let runtime = Runtime::new().context("failed to start tokio runtime")?;
    let stores = match &config.database_url {
        Some(url) => {
            let pool = runtime
                .block_on(PgPool::connect(url))
                .context("failed to connect to Postgres")?;
            tracing::info!("using Postgres stores");
            EngineStores::postgres(pool, runtime.handle().clone())
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            EngineStores::in_memory()
        }
    };

    let engine = Engine::build(stores, config.clone()).context("failed to load automation rules")?;
    let handles = engine.start().context("failed to start engine threads")?;

    loop {
        let stop = runtime.block_on(async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => true,
                _ = tokio::time::sleep(TICK) => false,
            }
        });
        if stop {
            tracing::info!("shutdown requested");
            break;
        }

        if let Some(max_age) = config.rule_refresh_interval {
            match engine.trigger.refresh_if_stale(max_age) {
                Ok(Some(rules)) => tracing::info!(active_rules = rules, "rule snapshot reloaded"),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "rule snapshot reload failed; keeping previous snapshot"),
            }
        }
        match engine.runs.stats() {
            Ok(stats) => tracing::debug!(
                pending = stats.pending,
                running = stats.running,
                failed = stats.failed,
                dead_lettered = stats.dead_lettered,
                "run backlog"
            ),
            Err(e) => tracing::warn!(error = %e, "run stats unavailable"),
        }
    }

    handles.shutdown();
    Ok(())
}
