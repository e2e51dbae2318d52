//! Datastore connector consumed by the gateway bootstrap and health checks.
//!
//! The document store itself is an external collaborator; this crate only
//! exposes the narrow connection interface the gateway depends on.

pub mod sqlite;

use async_trait::async_trait;
use proto::DatabaseError;

/// SQLite-backed datastore implementation.
pub use sqlite::SqliteStore;

/// Connection-level view of the datastore.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    /// Round-trips a trivial query to confirm the connection is usable.
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Closes the underlying connection pool.
    async fn close(&self);
}
