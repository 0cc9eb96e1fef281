//! `CoreRuntime`: explicit ownership of every client, cache, pool, and loop.
//!
//! Nothing in the request plane is a global. The runtime builds the object
//! graph, starts the owned tasks, and tears them down in order on shutdown:
//! stop admitting, drain, flush the outbox, release uncommitted reservations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use bus::{ConsumerConfig, EventBus, EventKind, StreamConfig};
use common::time::now_ms;
use corelib::models::Tier;
use quota::{MemoryCounterStore, QuotaEngine, SqliteCounterStore, spawn_sweeper};
use registry::{
    CachedTenantRegistry, ProviderConfig, ProviderTable, ProviderType, TenantDirectory,
};
use router::{MemoryBanditStore, MemoryFeatureStore, Router};
use scheduler::{
    AdmissionTicket, DispatchedRequest, Request, RequestId, SchedulerEngine, WorkerCredits,
};

use crate::billing::UsageAggregator;
use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::error::CoreError;
use crate::metrics::Counters;
use crate::recorder::OutcomeRecorder;
use crate::workers::{TierWorker, WorkItem, run_worker_pool};

pub struct CoreRuntime {
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub registry: Arc<CachedTenantRegistry>,
    pub quota: Arc<QuotaEngine>,
    pub scheduler: Arc<SchedulerEngine>,
    pub router: Arc<Router>,
    pub recorder: Arc<OutcomeRecorder>,
    pub credits: Arc<WorkerCredits>,
    pub billing: Arc<UsageAggregator>,
    pub counters: Counters,

    publisher: bus::Publisher,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Consumed by start().
    dispatch_rx: Mutex<Option<mpsc::Receiver<DispatchedRequest>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    worker_rxs: Mutex<Option<HashMap<Tier, mpsc::Receiver<WorkItem>>>>,
    workers: Mutex<Option<HashMap<Tier, Arc<dyn TierWorker>>>>,
}

impl CoreRuntime {
    /// Wire the whole request plane. Stores are in-memory unless
    /// `config.database_url` names a database.
    pub async fn build(
        config: AppConfig,
        directory: Arc<dyn TenantDirectory>,
        providers: ProviderTable,
        workers: HashMap<Tier, Arc<dyn TierWorker>>,
    ) -> anyhow::Result<Arc<Self>> {
        let (bus, counter_store): (EventBus, Arc<dyn quota::CounterStore>) =
            if config.database_url.is_empty() {
                (
                    EventBus::in_memory(StreamConfig::defaults(), config.bus_outbox_cap),
                    Arc::new(MemoryCounterStore::new()),
                )
            } else {
                sqlx::any::install_default_drivers();
                let pool = sqlx::any::AnyPoolOptions::new()
                    .max_connections(5)
                    .connect(&config.database_url)
                    .await?;
                (
                    EventBus::with_sqlite(
                        pool.clone(),
                        StreamConfig::defaults(),
                        config.bus_outbox_cap,
                    )
                    .await?,
                    Arc::new(SqliteCounterStore::new(pool).await?),
                )
            };
        let bus = Arc::new(bus);
        let publisher = bus.publisher();

        let registry = Arc::new(CachedTenantRegistry::new(directory));
        let quota = Arc::new(QuotaEngine::new(
            counter_store,
            publisher.clone(),
            config.quota(),
        ));

        let feature_store = Arc::new(MemoryFeatureStore::default());
        let bandit_store = Arc::new(MemoryBanditStore::new());
        let router = Arc::new(Router::new(
            feature_store.clone(),
            bandit_store,
            config.router(),
        ));

        let credits = Arc::new(WorkerCredits::new());
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.worker_pool_size.max(1) * 4);
        let scheduler = Arc::new(SchedulerEngine::new(
            config.scheduler(),
            registry.clone(),
            quota.clone(),
            publisher.clone(),
            dispatch_tx,
            credits.clone(),
        ));

        let recorder = Arc::new(OutcomeRecorder::new(
            router.clone(),
            feature_store,
            publisher.clone(),
        ));

        let counters = Counters::default();
        let mut worker_txs = HashMap::new();
        let mut worker_rxs = HashMap::new();
        for tier in Tier::ALL {
            let (tx, rx) = mpsc::channel(config.worker_pool_size.max(1));
            worker_txs.insert(tier, tx);
            worker_rxs.insert(tier, rx);
        }

        let dispatcher = Dispatcher::new(
            router.clone(),
            quota.clone(),
            Arc::new(providers),
            publisher.clone(),
            worker_txs,
            counters.clone(),
        );

        let billing = Arc::new(UsageAggregator::new());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            bus,
            registry,
            quota,
            scheduler,
            router,
            recorder,
            credits,
            billing,
            counters,
            publisher,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            worker_rxs: Mutex::new(Some(worker_rxs)),
            workers: Mutex::new(Some(workers)),
        }))
    }

    /// Start every owned loop. Idempotent per build.
    pub fn start(self: &Arc<Self>) {
        let Some(dispatch_rx) = self.dispatch_rx.lock().take() else {
            return;
        };
        let Some(dispatcher) = self.dispatcher.lock().take() else {
            return;
        };
        let Some(mut worker_rxs) = self.worker_rxs.lock().take() else {
            return;
        };
        let Some(workers) = self.workers.lock().take() else {
            return;
        };

        self.bus.start();

        // Billing read model over usage_metered.
        if let Err(e) = self.bus.subscribe(
            ConsumerConfig::new("billing-aggregator", EventKind::UsageMetered)
                .with_max_deliver(self.config.bus_max_deliver)
                .with_ack_wait(Duration::from_secs(self.config.bus_ack_wait_s)),
            self.billing.clone(),
        ) {
            error!(error = %e, "failed to register billing consumer");
        }

        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(
            self.scheduler
                .clone()
                .run_dispatch_loop(self.shutdown_tx.subscribe()),
        ));

        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(dispatcher.run(dispatch_rx, shutdown)));

        for tier in Tier::ALL {
            let Some(rx) = worker_rxs.remove(&tier) else {
                continue;
            };
            let Some(worker) = workers.get(&tier).cloned() else {
                continue;
            };
            self.credits.add(tier, self.config.worker_pool_size as u32);
            tasks.push(tokio::spawn(run_worker_pool(
                tier,
                worker,
                rx,
                self.credits.clone(),
                self.scheduler.clone(),
                self.recorder.clone(),
                self.publisher.clone(),
                self.counters.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        tasks.push(spawn_sweeper(
            self.quota.clone(),
            Duration::from_secs(1),
            self.shutdown_tx.subscribe(),
        ));

        info!("core runtime started");
    }

    /// Admission API.
    pub async fn schedule(&self, request: Request) -> Result<AdmissionTicket, CoreError> {
        self.scheduler.schedule(request).await.map_err(Into::into)
    }

    /// Idempotent cancel of a still-queued request.
    pub async fn cancel(&self, request_id: RequestId) -> bool {
        self.scheduler.cancel(request_id).await
    }

    /// Graceful teardown: stop admitting, stop loops (the scheduler loop
    /// releases everything still queued), return in-flight reservations,
    /// flush the outbox.
    pub async fn shutdown(&self) {
        self.scheduler.stop_admitting();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let released = self.quota.release_all_pending(now_ms()).await;
        if released > 0 {
            info!(released, "released uncommitted reservations at shutdown");
        }

        self.bus.shutdown().await;
        info!("core runtime stopped");
    }
}

/// Regional provider table used when no external configuration is supplied.
pub fn default_provider_table() -> ProviderTable {
    let mut table = ProviderTable::new();
    for region in ["us-east-1", "eu-west-1", "ap-southeast-1"] {
        table.insert(ProviderConfig {
            region: region.to_string(),
            provider_type: ProviderType::Llm,
            provider_name: "openai".to_string(),
            endpoint: "https://api.openai.com/v1".to_string(),
            priority: 1,
            active: true,
        });
        table.insert(ProviderConfig {
            region: region.to_string(),
            provider_type: ProviderType::Llm,
            provider_name: "anthropic".to_string(),
            endpoint: "https://api.anthropic.com/v1".to_string(),
            priority: 2,
            active: true,
        });
        table.insert(ProviderConfig {
            region: region.to_string(),
            provider_type: ProviderType::Vector,
            provider_name: "pinecone".to_string(),
            endpoint: "https://api.pinecone.io".to_string(),
            priority: 1,
            active: true,
        });
        table.insert(ProviderConfig {
            region: region.to_string(),
            provider_type: ProviderType::Storage,
            provider_name: "s3".to_string(),
            endpoint: format!("https://s3.{region}.amazonaws.com"),
            priority: 1,
            active: true,
        });
    }
    table
}
