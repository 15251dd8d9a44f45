use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use once_cell::sync::Lazy;
use prometheus::{register_gauge, Gauge};
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::attempt_manager::storage::AttemptStorage;
use crate::attempt_manager::{AttemptManager, AttemptManagerV1, AttemptManagerV2};
use crate::config::Config;
use crate::ethereum::Eth;
use crate::pool::TxPool;
use crate::processor::Processor;
use crate::shutdown::Shutdown;
use crate::signer::init_signer;
use crate::store::RedisStore;
use crate::utils::{supervise, OnShutdown};

const POOL_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// How long draining tasks get to land their state after the signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

static POOL_SIZE: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("pool_size", "Transactions waiting in the pool").unwrap());

/// Wire the components, recover state and run until shutdown.
#[instrument(name = "app::run", level = "debug", skip_all)]
pub async fn run(config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let store = Arc::new(RedisStore::connect(config.redis_uri.expose()).await?);
    let pool = TxPool::new(store.clone(), &config);

    let eth = Arc::new(Eth::connect(&config).await?);
    let chain_id = eth.chain_id();
    info!(chain_id, "Connected to Ethereum");

    let signer = init_signer(&config, chain_id).await?;
    let source = signer.address();

    // Wallet sanity: log the starting state, flag an unfunded account.
    let nonce = eth.nonce(source).await?;
    let balance = eth.balance(source).await?;
    info!(?source, nonce, balance, "Constructed wallet");
    if balance == 0 {
        error!(?source, "Wallet has no funds");
    }

    let storage = AttemptStorage::new(store.clone());
    let attempt_manager = if eth.supports_eip1559().await {
        info!("Node serves fee history, using the EIP-1559 pricing policy");
        AttemptManager::Eip1559(AttemptManagerV2::new(
            eth.clone(),
            storage,
            source,
            &config,
        ))
    } else {
        info!("No fee history, using the legacy pricing policy");
        AttemptManager::Legacy(AttemptManagerV1::new(eth.clone(), storage, source, &config))
    };

    let processor = Processor::new(eth, pool.clone(), signer, attempt_manager, config.clone());
    let processor = Arc::new(Mutex::new(processor));

    let handles = FuturesUnordered::new();

    // The worker loop. On failure the supervisor restarts it after the
    // configured timeout; on shutdown it drains, so an in-flight
    // transaction reaches a persisted state before the process exits.
    let processor_task = {
        let processor = processor.clone();
        let shutdown = shutdown.clone();
        move || {
            let processor = processor.clone();
            let shutdown = shutdown.clone();
            async move { processor.lock().await.run(shutdown).await }
        }
    };
    handles.push(supervise(
        "processor",
        processor_task,
        Duration::from_secs(config.restart_timeout.max(1)),
        OnShutdown::Drain,
        shutdown.clone(),
    ));

    // Periodic pool introspection for operators and metrics.
    let monitor_task = {
        let pool = pool.clone();
        move || {
            let pool = pool.clone();
            async move {
                loop {
                    let size = pool.size().await?;
                    POOL_SIZE.set(size as f64);
                    if size > 0 {
                        let ids = pool.to_list().await?;
                        info!(size, ?ids, "Pool state");
                    }
                    tokio::time::sleep(POOL_MONITOR_INTERVAL).await;
                }
            }
        }
    };
    handles.push(supervise(
        "pool-monitor",
        monitor_task,
        POOL_MONITOR_INTERVAL,
        OnShutdown::Cancel,
        shutdown.clone(),
    ));

    let mut handles = handles;
    monitor_shutdown(&mut handles, shutdown).await;

    // A draining processor may still be mid-transaction; give it a bounded
    // window to reach a persisted state.
    let drain = async {
        while handles.next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Tasks did not finish within the shutdown grace period");
    }

    info!("Shutting down");
    Ok(())
}

async fn monitor_shutdown(handles: &mut FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
    select! {
        // Wait for the shutdown signal
        _ = shutdown.await_shutdown_begin() => {}
        // Or for a task to die
        _ = await_task_end(handles, shutdown.clone()) => {}
    };
}

async fn await_task_end(handles: &mut FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
    while let Some(result) = handles.next().await {
        if !shutdown.is_shutting_down() {
            match result {
                Ok(()) => info!("Task exited"),
                Err(err) => {
                    error!(?err, "Task panicked, shutting the service down");
                    shutdown.shutdown();
                    return;
                }
            }
        }
    }
    warn!("All tasks have returned unexpectedly");
}
