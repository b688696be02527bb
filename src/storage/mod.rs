//! Persistent storage backends.
//!
//! One trait, three independent implementations selected by configuration:
//! an embedded SQL database, a networked SQL server and a document database.
//! Each backend fronts its durable reads with a bounded TTL response cache
//! and runs its own ordered migration list at startup.

pub mod migrate;
pub mod mongo;
pub mod mysql;
pub mod sqlite;

use crate::cidr::AddressRange;
use crate::config::{DatabaseConfig, DatabaseKind};
use crate::error::{MigrationError, PersistenceError};
use crate::lookup::ReputationResult;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// TTL of the response cache kept in front of durable reads.
pub(crate) const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(20 * 60);

/// Capacity of the response cache kept in front of durable reads.
pub(crate) const RESPONSE_CACHE_CAPACITY: usize = 4000;

/// A durable storage backend.
///
/// All methods are synchronous and may block; callers on the async side go
/// through `spawn_blocking`. Implementations synchronize internally, so every
/// operation is a single atomic call, never a read-modify-write split across
/// two calls from outside.
pub trait PersistentBackend: Send + Sync {
    /// Establish schema: applies the backend's migration list in order.
    fn init(&self) -> Result<(), MigrationError>;

    fn shutdown(&self);

    /// Previously classified response for an address, if one is stored and
    /// still within the retention window.
    fn cached_response(&self, addr: Ipv4Addr) -> Result<Option<ReputationResult>, PersistenceError>;

    fn put_cached_response(&self, result: &ReputationResult) -> Result<(), PersistenceError>;

    fn clear_cached_responses(&self) -> Result<(), PersistenceError>;

    fn is_principal_exempt(&self, id: &Uuid) -> Result<bool, PersistenceError>;

    /// Whether a stored range fully covers the queried range.
    fn is_range_exempt(&self, range: &AddressRange) -> Result<bool, PersistenceError>;

    fn add_principal(&self, id: &Uuid) -> Result<(), PersistenceError>;

    fn remove_principal(&self, id: &Uuid) -> Result<(), PersistenceError>;

    fn add_range(&self, range: &AddressRange) -> Result<(), PersistenceError>;

    fn remove_range(&self, range: &AddressRange) -> Result<(), PersistenceError>;

    fn list_principals(&self) -> Result<Vec<Uuid>, PersistenceError>;

    fn list_ranges(&self) -> Result<Vec<AddressRange>, PersistenceError>;

    fn alert_flag(&self, id: &Uuid) -> Result<bool, PersistenceError>;

    fn set_alert_flag(&self, id: &Uuid, enabled: bool) -> Result<(), PersistenceError>;
}

/// Open the backend selected by configuration. Does not run migrations; call
/// [`PersistentBackend::init`] once the connection is established.
pub fn open_backend(config: &DatabaseConfig) -> Result<Arc<dyn PersistentBackend>, PersistenceError> {
    match config.kind {
        DatabaseKind::Sqlite => Ok(Arc::new(sqlite::SqliteBackend::open(config)?)),
        DatabaseKind::Mysql => Ok(Arc::new(mysql::MySqlBackend::connect(config)?)),
        DatabaseKind::Mongodb => Ok(Arc::new(mongo::MongoBackend::connect(config)?)),
    }
}
