//! Queue worker: consumes `ASSET_GENERATION` messages and periodically
//! re-publishes jobs whose enqueue never landed.

use std::time::Duration;

use chrono::Utc;
use lorekeeper_api::app::services;
use lorekeeper_infra::{PipelineConfig, producer::JobProducer};

const RECONCILE_BATCH: usize = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lorekeeper_observability::init();

    let config = PipelineConfig::from_env();
    if !config.use_persistent_stores {
        tracing::warn!(
            "worker running against in-memory backends; it will not see jobs submitted to the API process"
        );
    }

    let backends = services::build_backends(&config).await?;
    let consumer =
        services::asset_generation_consumer(&backends, &config, services::default_provider());
    let handle = consumer.spawn();

    let producer = JobProducer::new(backends.queue.clone());
    let reconcile_after = chrono::Duration::from_std(config.reconcile_after)?;
    let mut ticker = tokio::time::interval(config.reconcile_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        queue = %config.queue_name,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        "worker started"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let cutoff = Utc::now() - reconcile_after;
                if let Err(e) = producer.reconcile(&*backends.jobs, cutoff, RECONCILE_BATCH).await {
                    tracing::warn!(error = %e, "reconcile sweep failed");
                }
            }
        }
    }

    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(
        received = stats.messages_received,
        acked = stats.messages_acked,
        dead_lettered = stats.messages_dead_lettered,
        "worker stopped"
    );

    Ok(())
}
