use anyhow::{anyhow, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Connection pool for whichever backend `DATABASE_URL` names.
#[derive(Clone, Debug)]
pub enum DatabaseManager {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl DatabaseManager {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_size(database_url, 20).await
    }

    pub async fn with_pool_size(database_url: &str, max_connections: u32) -> Result<Self> {
        let url = database_url.trim();

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await?;
            info!("Connected to PostgreSQL (max_connections={})", max_connections);
            return Ok(Self::Postgres(pool));
        }

        if url.starts_with("sqlite:") {
            // Create database if it doesn't exist
            let options = SqliteConnectOptions::from_str(url)?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?;
            info!("Opened SQLite database {}", url);
            return Ok(Self::Sqlite(pool));
        }

        Err(anyhow!("Unsupported DATABASE_URL scheme: expected sqlite: or postgres://"))
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations ({})", self.backend());
        match self {
            Self::Sqlite(pool) => sqlx::migrate!("./migrations/sqlite").run(pool).await?,
            Self::Postgres(pool) => sqlx::migrate!("./migrations/postgres").run(pool).await?,
        }
        Ok(())
    }

    /// Points the Postgres change-notify trigger at `channel`. SQLite has no
    /// trigger; its in-process notifier is built with the channel directly.
    pub async fn set_notify_channel(&self, channel: &str) -> Result<()> {
        if let Self::Postgres(pool) = self {
            sqlx::query("UPDATE notify_channel SET name = $1 WHERE singleton")
                .bind(channel)
                .execute(pool)
                .await?;
            info!("Campaign notifications go to channel {}", channel);
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            Self::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            Self::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        }
    }

    pub fn pool_size(&self) -> u32 {
        match self {
            Self::Sqlite(pool) => pool.size(),
            Self::Postgres(pool) => pool.size(),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Sqlite(pool) => pool.close().await,
            Self::Postgres(pool) => pool.close().await,
        }
    }
}
