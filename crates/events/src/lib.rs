//! Job change notification transports for genq.
//!
//! - [`ChangeFeed`]: subscribe to snapshots of one job as they are written.
//! - [`MemoryChangeFeed`]: in-process feed over `MemoryJobStore`'s change
//!   log, with fault injection for failover tests.
//! - [`PgChangeFeed`]: `LISTEN job_changes` on PostgreSQL.

pub mod feed;
pub mod memory;
pub mod pg;

pub use feed::{ChangeFeed, FeedEvent, FeedSubscription, TransportError};
pub use memory::MemoryChangeFeed;
pub use pg::PgChangeFeed;
