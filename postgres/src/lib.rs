//! `PostgreSQL` storage for the ticket issuance engine.
//!
//! [`PostgresStore`] implements every storage trait from `ticket-engine-core`
//! with runtime `sqlx` queries. The guarantees rest on three statements:
//!
//! - inventory: `UPDATE competitions ... WHERE tickets_sold + $q <= total_tickets ... RETURNING`
//! - ledger: `UPDATE payments SET state = 'completed' ... WHERE state IN ('created', 'approved')`
//! - vouchers: `UPDATE vouchers ... WHERE redemption_count < redemption_cap RETURNING`
//!
//! Each is a single conditional write evaluated by Postgres, so concurrent
//! callers on any number of processes can never oversell or double-complete.
//!
//! # Example
//!
//! ```ignore
//! use ticket_engine_postgres::{PoolSettings, PostgresStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::connect(&PoolSettings::new("postgres://localhost/tickets")).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod competitions;
mod ledger;
mod rows;
mod unit_of_work;
mod vouchers;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use ticket_engine_core::error::StoreError;
use ticket_engine_core::store::{BoxFuture, TicketStore, UnitOfWork};

pub use unit_of_work::PostgresUnitOfWork;

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connection string.
    pub url: String,
    /// Pool upper bound.
    pub max_connections: u32,
    /// Connections kept open when idle.
    pub min_connections: u32,
    /// Wait for a free connection before failing.
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    /// Defaults for the given connection string.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// `PostgreSQL` implementation of [`TicketStore`].
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database is unreachable.
    pub async fn connect(settings: &PoolSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Apply the schema migrations in `postgres/migrations`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, StoreError> {
        self.pool.acquire().await.map_err(rows::db)
    }
}

impl TicketStore for PostgresStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork>, StoreError>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(rows::db)?;
            let uow: Box<dyn UnitOfWork> = Box::new(PostgresUnitOfWork::new(tx));
            Ok(uow)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(rows::db)?;
            Ok(())
        })
    }
}
