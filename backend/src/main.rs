use std::collections::HashMap;
use std::sync::Arc;

use backend::{
    config::AppConfig,
    runtime::{CoreRuntime, default_provider_table},
    workers::{SimulatedWorker, TierWorker},
};
use common::logger::init_logger;
use corelib::models::Tier;
use registry::MemoryTenantDirectory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger("request-plane-core");

    let config = AppConfig::from_env();

    // Tenants arrive from the control plane; until an edge is wired in, the
    // directory starts empty and is populated through registry events.
    let directory = Arc::new(MemoryTenantDirectory::new());

    let mut workers: HashMap<Tier, Arc<dyn TierWorker>> = HashMap::new();
    for tier in Tier::ALL {
        workers.insert(tier, Arc::new(SimulatedWorker { tier }));
    }

    let runtime = CoreRuntime::build(config, directory, default_provider_table(), workers).await?;
    runtime.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    runtime.shutdown().await;

    Ok(())
}
