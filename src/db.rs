//! Database connection management
//!
//! Pool construction (TLS when the server asks for it) and schema bootstrap.

use crate::config::DatabaseConfig;
use crate::store::queries;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tracing::info;

/// Hosts that only accept TLS connections
const TLS_HOST_SUFFIXES: &[&str] = &["neon.tech", "supabase.co", "rds.amazonaws.com"];

fn requires_tls(config: &DatabaseConfig) -> bool {
    config.require_tls || TLS_HOST_SUFFIXES.iter().any(|suffix| config.host.ends_with(suffix))
}

/// Create the connection pool and verify it with a round trip
pub async fn init_pool(config: &DatabaseConfig) -> anyhow::Result<Pool> {
    let use_tls = requires_tls(config);

    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let pool = if use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| anyhow::anyhow!("Failed to create TLS pool: {}", e))?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| anyhow::anyhow!("Failed to create pool: {}", e))?
    };

    let client = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get pool connection: {}", e))?;
    client
        .query_one("SELECT 1 as ok", &[])
        .await
        .map_err(|e| anyhow::anyhow!("Failed to verify database connection: {}", e))?;

    info!(host = %config.host, database = %config.database, tls = use_tls, "Database connection successful");
    Ok(pool)
}

/// Create tables and indexes if they don't exist
pub async fn create_tables(pool: &Pool) -> anyhow::Result<()> {
    let client = pool.get().await?;

    client.batch_execute(queries::CREATE_SNAPSHOTS_TABLE).await?;
    client.batch_execute(queries::CREATE_EVENTS_TABLE).await?;
    client.batch_execute(queries::CREATE_EVENTS_RECENT_INDEX).await?;

    info!("Database tables initialized");
    Ok(())
}
