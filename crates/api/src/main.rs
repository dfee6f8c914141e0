use lorekeeper_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lorekeeper_observability::init();

    let config = PipelineConfig::from_env();
    if config.worker_tokens.is_empty() {
        tracing::warn!("WORKER_TOKENS not set; any bearer token is accepted on worker routes");
    }

    let bind_addr = config.bind_addr.clone();
    let lorekeeper_api::app::Server { router, consumer } =
        lorekeeper_api::app::build_server(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    if let Some(consumer) = consumer {
        consumer.shutdown().await;
    }
    Ok(())
}
