use std::sync::Arc;

use anyhow::Context;
use fila::{
    handler::HandlerRegistry,
    manager::{Connect, QueueManager},
    pruner::PrunerRunner,
    worker::Worker,
};
use fila_redis::RedisConnector;
use fila_sqlx::PgConnector;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    pdf::{
        CommandRenderer, FsArtifactStore, GeneratePdfHandler, LogNotifier, PgRecordStore,
        GENERATE_PDF,
    },
};

mod config;
mod pdf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let pool = PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .context("invalid DATABASE_URL")?;

    let fallback = PgConnector::new(pool.clone()).with_migrations(config.migrate_on_startup);
    let primary = config
        .redis_url
        .as_ref()
        .map(|url| RedisConnector::new(url).with_prefix(&config.redis_prefix));
    let manager = Arc::new(
        QueueManager::initialize(
            config.manager_config(),
            primary.as_ref().map(|connector| connector as &dyn Connect),
            &fallback,
        )
        .await?,
    );

    let registry = HandlerRegistry::new().with_handler(
        GENERATE_PDF,
        GeneratePdfHandler::new(
            PgRecordStore::new(pool),
            CommandRenderer::new(&config.render_command)?,
            FsArtifactStore::new(&config.artifact_dir),
            LogNotifier,
        ),
    );

    let cancellation_token = CancellationToken::new();
    let worker = Worker::new(manager.clone(), registry, config.worker_config()?)
        .spawn(cancellation_token.clone());
    let pruner = PrunerRunner::new(manager.clone(), config.pruner_config()?)
        .spawn(cancellation_token.clone());
    tracing::info!(
        backend = manager.backend_name(),
        queue = %config.queue,
        "Worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("Shutting down");
    cancellation_token.cancel();

    if let Err(error) = worker.await {
        tracing::error!(?error, "Worker task failed");
    }
    if let Err(error) = pruner.await {
        tracing::error!(?error, "Pruner task failed");
    }
    manager.close().await?;
    Ok(())
}
