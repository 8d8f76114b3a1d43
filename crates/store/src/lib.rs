//! Job row store access for genq.
//!
//! - [`JobRowStore`]: the four primitives the orchestration core needs from
//!   a persistent store (insert, read, conditional update, count).
//! - [`MemoryJobStore`] and [`PgJobStore`]: in-process and PostgreSQL
//!   implementations.
//! - [`JobStoreClient`]: admission control, authentication, and retry on
//!   top of any [`JobRowStore`].

use sqlx::postgres::PgPoolOptions;

pub mod client;
pub mod memory;
pub mod pg;
pub mod store;

pub use client::{AdmissionConfig, FixedSession, JobClientError, JobStoreClient, Session};
pub use memory::MemoryJobStore;
pub use pg::PgJobStore;
pub use store::{JobRowStore, StoreError, UpdateOutcome};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the `jobs` schema and its change-notification trigger.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
