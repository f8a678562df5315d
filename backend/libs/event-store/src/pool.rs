//! PostgreSQL pool creation and schema migrations for the event store

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Pool settings read from `DATABASE_URL` and `DB_*`.
///
/// `max_connections` should be at least the consumer's fallback concurrency.
#[derive(Clone)]
pub struct StoreConfig {
    pub service_name: String,
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Budget for the `SELECT 1` check after connecting
    pub connect_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("service_name", &self.service_name)
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            database_url: String::new(),
            max_connections: 50,
            min_connections: 5,
            connect_timeout_secs: 5,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl StoreConfig {
    pub fn from_env(service_name: &str) -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL environment variable not set".to_string())?;

        // Unparseable values fall back to the default
        fn var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let d = Self::default();
        Ok(Self {
            service_name: service_name.to_string(),
            database_url,
            max_connections: var("DB_MAX_CONNECTIONS", d.max_connections),
            min_connections: var("DB_MIN_CONNECTIONS", d.min_connections),
            connect_timeout_secs: var("DB_CONNECT_TIMEOUT_SECS", d.connect_timeout_secs),
            acquire_timeout_secs: var("DB_ACQUIRE_TIMEOUT_SECS", d.acquire_timeout_secs),
            idle_timeout_secs: var("DB_IDLE_TIMEOUT_SECS", d.idle_timeout_secs),
            max_lifetime_secs: var("DB_MAX_LIFETIME_SECS", d.max_lifetime_secs),
        })
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(self.max_lifetime_secs))
            .test_before_acquire(true)
    }
}

/// Connect and verify the pool answers queries within `connect_timeout_secs`.
pub async fn create_pool(config: StoreConfig) -> Result<PgPool, sqlx::Error> {
    info!(
        service = %config.service_name,
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout_secs,
        "Connecting to the event store"
    );

    let pool = config.pool_options().connect(&config.database_url).await?;

    let check = sqlx::query("SELECT 1").execute(&pool);
    tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), check)
        .await
        .map_err(|_| {
            sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "event store did not answer SELECT 1 in time",
            ))
        })??;

    debug!(service = %config.service_name, "Event store pool verified");
    Ok(pool)
}

/// Apply the embedded schema migrations (creates the `events` table)
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Event store migrations applied");
    Ok(())
}
