use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let min_connections = env("ATELIER_REALTIME_DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MIN_CONNECTIONS);

        let max_connections = env("ATELIER_REALTIME_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(min_connections);

        let acquire_timeout_secs = env("ATELIER_REALTIME_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);

        Self {
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        }
    }
}

pub async fn create_pg_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse realtime PostgreSQL connection options")?;
    ensure_postgres_tls(&connect_options)?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to realtime PostgreSQL")
}

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("realtime PostgreSQL health check failed")?;

    Ok(())
}

fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "realtime PostgreSQL connection must require TLS; got sslmode={mode:?}. Set sslmode=require (or stricter)."
        ),
    }
}
