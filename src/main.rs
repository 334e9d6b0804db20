//! Conflux integration service.
//!
//! Entry point wiring configuration, Postgres, the integration engine, and
//! the HTTP server, with graceful shutdown on CTRL+C/SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use conflux_api::{AppState, Config};
use conflux_core::{storage::PgDataAccess, storage::Storage, RealClock};
use conflux_engine::{HttpOutboundClient, IntegrationEngine, PostgresRecordStore};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting conflux integration service");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let clock = Arc::new(RealClock::new());
    let storage = Storage::new(db_pool.clone());

    let records = Arc::new(PostgresRecordStore::new(Arc::new(storage.clone())));
    let access = Arc::new(PgDataAccess::new(storage.clone(), clock.clone()));
    let outbound = Arc::new(
        HttpOutboundClient::new(config.to_outbound_config())
            .context("Failed to build outbound HTTP client")?,
    );

    let engine = Arc::new(IntegrationEngine::new(
        config.to_engine_config(),
        records,
        access,
        outbound,
        clock.clone(),
    ));
    engine.start().await;

    let state = AppState::new(engine.clone(), storage, clock);
    let addr = config.parse_server_addr()?;

    info!(addr = %addr, "Conflux is ready to receive webhooks");
    if let Err(e) = conflux_api::start_server(state, addr).await {
        error!(error = %e, "Server failed");
    }

    engine.shutdown(Duration::from_secs(30)).await;

    db_pool.close().await;
    info!("Database connections closed");

    info!("Conflux shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with startup retry.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the engine's tables exist.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_events (
            source_service TEXT NOT NULL,
            event_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            status TEXT NOT NULL,
            received_at TIMESTAMPTZ NOT NULL,
            reserved_at TIMESTAMPTZ NOT NULL,
            applied_at TIMESTAMPTZ,
            attempt_count INTEGER NOT NULL DEFAULT 1,
            last_error TEXT,
            PRIMARY KEY (source_service, event_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create processed_events table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            tenant_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            state JSONB NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (tenant_id, kind, entity_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create entities table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            detail JSONB NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create audit_log table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_processed_events_status
        ON processed_events(status, received_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create processed_events status index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_audit_log_tenant
        ON audit_log(tenant_id, recorded_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create audit_log tenant index")?;

    Ok(())
}
