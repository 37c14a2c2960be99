mod config;
mod health;

use anyhow::Context;
use common::http::HttpUserClient;
use common::nats::BrokerConnector;
use common::postgres::{
    PostgresClient, PostgresDocumentStore, PostgresMetaUserRepository, PostgresUserRepository,
    METAUSERS, OLD_METAUSERS, OLD_USERS, USERS,
};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use crate::config::{ServiceConfig, StoreMode};
use std::sync::Arc;
use std::time::Duration;
use sync_runner::Runner;
use sync_worker::{SyncStore, SyncWorker, SyncWorkerConfig, UserSyncService};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        store_mode = ?config.store_mode,
        payload_format = ?config.payload_format,
        "Starting user-sync service"
    );
    debug!(
        nats_url = %config.nats_url,
        postgres_host = %config.postgres_host,
        user_api_url = %config.user_api_url,
        topics = %config.topics,
        "Configuration loaded"
    );

    let topics = match config.topic_set() {
        Ok(topics) => topics,
        Err(e) => {
            error!("Invalid topic configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (connector, sync_store) = match initialize_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize dependencies: {:#}", e);
            std::process::exit(1);
        }
    };

    let user_client = match HttpUserClient::new(&config.user_api_config()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build user API client: {:#}", e);
            std::process::exit(1);
        }
    };
    let sync_service = Arc::new(UserSyncService::new(user_client, sync_store));

    // Shared by the runner and the subscription listeners
    let shutdown_token = CancellationToken::new();

    let sync_worker = match SyncWorker::new(
        connector.clone(),
        sync_service,
        SyncWorkerConfig {
            topics,
            subject_prefix: config.nats_subject_prefix.clone(),
            payload_format: config.payload_format,
        },
        shutdown_token.clone(),
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize sync worker: {:#}", e);
            std::process::exit(1);
        }
    };

    let health_addr = config.health_addr();

    Runner::new()
        .with_cancellation_token(shutdown_token)
        .with_named_process("dispatcher", sync_worker.into_runner_process())
        .with_named_process("health", move |ctx| health::serve(health_addr, ctx))
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            if let Err(e) = connector.disconnect().await {
                error!("Failed to disconnect from broker: {:#}", e);
            }

            shutdown_telemetry(telemetry_providers);

            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(config.shutdown_timeout_secs))
        .run()
        .await;
}

async fn initialize_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<(Arc<BrokerConnector>, SyncStore)> {
    info!("Initializing PostgreSQL...");
    let postgres_client = PostgresClient::new(&config.postgres_config())?;
    tokio::time::timeout(
        Duration::from_secs(config.startup_timeout_secs),
        postgres_client.ping(),
    )
    .await
    .context("timed out connecting to PostgreSQL")?
    .context("failed to connect to PostgreSQL")?;

    let store = PostgresDocumentStore::new(postgres_client, config.store_timeout());
    let sync_store = match config.store_mode {
        StoreMode::Versioned => {
            store.ensure_collections(&[METAUSERS, OLD_METAUSERS]).await?;
            let repository = Arc::new(PostgresMetaUserRepository::new(store));
            SyncStore::Versioned {
                live: repository.clone(),
                archive: repository,
            }
        }
        StoreMode::Flat => {
            store.ensure_collections(&[USERS, OLD_USERS]).await?;
            let repository = Arc::new(PostgresUserRepository::new(store));
            SyncStore::Flat {
                live: repository.clone(),
                archive: repository,
            }
        }
    };

    info!("Initializing NATS...");
    let connector = BrokerConnector::connect(
        &config.nats_connect_config(),
        &config.nats_subject_prefix,
        config.redelivery_policy(),
        config.subscription_config(),
    )
    .await
    .context("failed to connect to broker")?;

    Ok((Arc::new(connector), sync_store))
}
