//! Embedded SQL backend.

use crate::cache::TtlCache;
use crate::cidr::AddressRange;
use crate::config::DatabaseConfig;
use crate::error::{MigrationError, PersistenceError};
use crate::lookup::{epoch_ms, ReputationResult};
use crate::storage::migrate::{
    addresses_to_ranges, plan_range_normalization, run_migrations, Migration, RangeFix, RangeRow,
};
use crate::storage::{PersistentBackend, RESPONSE_CACHE_CAPACITY, RESPONSE_CACHE_TTL};
use rusqlite::{params, Connection, OptionalExtension};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Embedded database backed by a single file.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    responses: TtlCache<Ipv4Addr, ReputationResult>,
    retention: Duration,
}

impl SqliteBackend {
    /// Open or create the database file.
    pub fn open(config: &DatabaseConfig) -> Result<Self, PersistenceError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Other(e.to_string()))?;
            }
        }

        let conn = Connection::open(&config.path)?;
        Ok(Self::from_connection(
            conn,
            Duration::from_secs(config.response_retention_secs),
        ))
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, Duration::from_secs(3600)))
    }

    fn from_connection(conn: Connection, retention: Duration) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            responses: TtlCache::new(RESPONSE_CACHE_TTL, RESPONSE_CACHE_CAPACITY),
            retention,
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, PersistenceError> {
        let conn = self.conn.lock().map_err(|_| PersistenceError::Closed)?;
        f(&conn).map_err(PersistenceError::from)
    }

    fn has_version_marker(&self, version: u32) -> bool {
        self.with_conn(|conn| {
            conn.query_row(
                "select count(*) from schema_version where version = ?1",
                params![version],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|count| count > 0)
        .unwrap_or(false)
    }

    fn range_rows(&self) -> Result<Vec<RangeRow>, PersistenceError> {
        let rows = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("select cidr, range_start, range_end from exempt_ranges")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        rows.into_iter()
            .map(|(cidr, start, end)| {
                let start = u32::try_from(start)
                    .map_err(|_| PersistenceError::Other(format!("corrupt range row {cidr:?}")))?;
                let end = u32::try_from(end)
                    .map_err(|_| PersistenceError::Other(format!("corrupt range row {cidr:?}")))?;
                Ok(RangeRow { cidr, start, end })
            })
            .collect()
    }

    fn insert_range_row(conn: &Connection, range: &AddressRange) -> rusqlite::Result<()> {
        conn.execute(
            "insert into exempt_ranges (cidr, range_start, range_end) values (?1, ?2, ?3)",
            params![
                range.to_string(),
                i64::from(range.start()),
                i64::from(range.end())
            ],
        )?;
        Ok(())
    }
}

impl PersistentBackend for SqliteBackend {
    fn init(&self) -> Result<(), MigrationError> {
        info!("initializing embedded database");
        run_migrations(self, &migrations())
    }

    fn shutdown(&self) {
        self.responses.clear();
    }

    fn cached_response(&self, addr: Ipv4Addr) -> Result<Option<ReputationResult>, PersistenceError> {
        if let Some(result) = self.responses.get(&addr) {
            return Ok(Some(result));
        }

        let row = self.with_conn(|conn| {
            conn.query_row(
                "select ip, asn, country_name, country_code, city, isp, proxy, observed_at \
                 from responses where ip = ?1 limit 1",
                params![addr.to_string()],
                |row| {
                    Ok(ReputationResult {
                        address: row.get(0)?,
                        asn: row.get(1)?,
                        country_name: row.get(2)?,
                        country_code: row.get(3)?,
                        city: row.get(4)?,
                        isp: row.get(5)?,
                        is_proxy: row.get(6)?,
                        success: true,
                        failure_reason: None,
                        observed_at_ms: row.get::<_, i64>(7)? as u64,
                    })
                },
            )
            .optional()
        })?;

        let Some(result) = row else {
            return Ok(None);
        };

        // Retention: stale rows are dropped on read instead of being served.
        if epoch_ms().saturating_sub(result.observed_at_ms) > self.retention.as_millis() as u64 {
            self.with_conn(|conn| {
                conn.execute("delete from responses where ip = ?1", params![addr.to_string()])
            })?;
            return Ok(None);
        }

        self.responses.insert(addr, result.clone());
        Ok(Some(result))
    }

    fn put_cached_response(&self, result: &ReputationResult) -> Result<(), PersistenceError> {
        if let Ok(addr) = result.address.parse::<Ipv4Addr>() {
            self.responses.insert(addr, result.clone());
        }

        self.with_conn(|conn| {
            conn.execute(
                "delete from responses where ip = ?1",
                params![result.address],
            )?;
            conn.execute(
                "insert into responses (ip, asn, country_name, country_code, city, isp, proxy, observed_at) \
                 values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    result.address,
                    result.asn,
                    result.country_name,
                    result.country_code,
                    result.city,
                    result.isp,
                    result.is_proxy,
                    result.observed_at_ms as i64,
                ],
            )?;
            Ok(())
        })
    }

    fn clear_cached_responses(&self) -> Result<(), PersistenceError> {
        self.responses.clear();
        self.with_conn(|conn| conn.execute("delete from responses", []).map(|_| ()))
    }

    fn is_principal_exempt(&self, id: &Uuid) -> Result<bool, PersistenceError> {
        let found = self.with_conn(|conn| {
            conn.query_row(
                "select 1 from exempt_principals where uuid = ?1 limit 1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    fn is_range_exempt(&self, range: &AddressRange) -> Result<bool, PersistenceError> {
        let found = self.with_conn(|conn| {
            conn.query_row(
                "select 1 from exempt_ranges where range_start <= ?1 and range_end >= ?2 limit 1",
                params![i64::from(range.start()), i64::from(range.end())],
                |_| Ok(()),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    fn add_principal(&self, id: &Uuid) -> Result<(), PersistenceError> {
        self.with_conn(|conn| {
            conn.execute(
                "insert into exempt_principals (uuid) values (?1)",
                params![id.to_string()],
            )
            .map(|_| ())
        })
    }

    fn remove_principal(&self, id: &Uuid) -> Result<(), PersistenceError> {
        self.with_conn(|conn| {
            conn.execute(
                "delete from exempt_principals where uuid = ?1",
                params![id.to_string()],
            )
            .map(|_| ())
        })
    }

    fn add_range(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        self.with_conn(|conn| Self::insert_range_row(conn, range))
    }

    fn remove_range(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        self.with_conn(|conn| {
            conn.execute(
                "delete from exempt_ranges where cidr = ?1",
                params![range.to_string()],
            )
            .map(|_| ())
        })
    }

    fn list_principals(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare("select uuid from exempt_principals")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|text| match Uuid::parse_str(&text) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(uuid = %text, "skipping unparseable principal row");
                    None
                }
            })
            .collect())
    }

    fn list_ranges(&self) -> Result<Vec<AddressRange>, PersistenceError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare("select cidr from exempt_ranges")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|text| match AddressRange::parse(&text) {
                Ok(range) => Some(range),
                Err(e) => {
                    warn!(cidr = %text, error = %e, "skipping unparseable range row");
                    None
                }
            })
            .collect())
    }

    fn alert_flag(&self, id: &Uuid) -> Result<bool, PersistenceError> {
        let found = self.with_conn(|conn| {
            conn.query_row(
                "select 1 from alerts where uuid = ?1 limit 1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    fn set_alert_flag(&self, id: &Uuid, enabled: bool) -> Result<(), PersistenceError> {
        if enabled {
            // Guard against double insertion so one delete disables globally.
            if self.alert_flag(id)? {
                return Ok(());
            }
            self.with_conn(|conn| {
                conn.execute("insert into alerts (uuid) values (?1)", params![id.to_string()])
                    .map(|_| ())
            })
        } else {
            self.with_conn(|conn| {
                conn.execute("delete from alerts where uuid = ?1", params![id.to_string()])
                    .map(|_| ())
            })
        }
    }
}

fn migrations() -> Vec<Box<dyn Migration<SqliteBackend>>> {
    vec![
        Box::new(InitialSchema),
        Box::new(AddressesToRanges),
        Box::new(NormalizeRanges),
    ]
}

fn step_failed(version: u32, source: PersistenceError) -> MigrationError {
    MigrationError::StepFailed { version, source }
}

/// v0: base tables and indexes.
struct InitialSchema;

impl Migration<SqliteBackend> for InitialSchema {
    fn version_number(&self) -> u32 {
        0
    }

    fn needs_update(&self, backend: &SqliteBackend) -> bool {
        !backend.has_version_marker(0)
    }

    fn apply(&self, backend: &SqliteBackend) -> Result<(), MigrationError> {
        backend
            .with_conn(|conn| {
                conn.execute_batch(
                    "create table if not exists exempt_principals (uuid text not null);
                     create table if not exists exempt_addresses (ip text not null);
                     create table if not exists responses (
                         ip text not null, asn text, country_name text, country_code text,
                         city text, isp text, proxy integer not null, observed_at integer not null);
                     create table if not exists alerts (uuid text not null);
                     create table if not exists schema_version (version integer not null);
                     create index if not exists idx_principals_uuid on exempt_principals (uuid);
                     create index if not exists idx_addresses_ip on exempt_addresses (ip);
                     create index if not exists idx_responses_ip on responses (ip);",
                )?;
                conn.execute("insert into schema_version (version) values (0)", [])?;
                Ok(())
            })
            .map_err(|e| step_failed(0, e))
    }
}

/// v1: rewrite legacy single-address exemption rows into range rows.
struct AddressesToRanges;

impl AddressesToRanges {
    fn apply_inner(
        backend: &SqliteBackend,
        ranges: &[AddressRange],
    ) -> Result<(), PersistenceError> {
        backend.with_conn(|conn| {
            conn.execute_batch(
                "create table if not exists exempt_ranges (
                     id integer primary key autoincrement,
                     cidr text not null, range_start integer not null, range_end integer not null);
                 create index if not exists idx_ranges_bounds on exempt_ranges (range_start, range_end);",
            )?;

            for range in ranges {
                SqliteBackend::insert_range_row(conn, range)?;
            }

            conn.execute_batch(
                "drop index if exists idx_addresses_ip;
                 drop table exempt_addresses;",
            )?;
            conn.execute("insert into schema_version (version) values (1)", [])?;
            Ok(())
        })
    }

    fn rollback(backend: &SqliteBackend, snapshot: &[String]) -> Result<(), PersistenceError> {
        warn!("rolling back address-to-range migration");
        backend.with_conn(|conn| {
            conn.execute_batch(
                "drop index if exists idx_ranges_bounds;
                 drop table if exists exempt_ranges;
                 create table if not exists exempt_addresses (ip text not null);
                 create index if not exists idx_addresses_ip on exempt_addresses (ip);
                 delete from exempt_addresses;",
            )?;

            for ip in snapshot {
                conn.execute("insert into exempt_addresses (ip) values (?1)", params![ip])?;
            }

            conn.execute("delete from schema_version where version = 1", [])?;
            Ok(())
        })
    }
}

impl Migration<SqliteBackend> for AddressesToRanges {
    fn version_number(&self) -> u32 {
        1
    }

    fn needs_update(&self, backend: &SqliteBackend) -> bool {
        !backend.has_version_marker(1)
    }

    fn apply(&self, backend: &SqliteBackend) -> Result<(), MigrationError> {
        let snapshot = backend
            .with_conn(|conn| {
                let mut stmt = conn.prepare("select ip from exempt_addresses")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(|e| step_failed(1, e))?;

        let ranges = addresses_to_ranges(&snapshot)?;

        if let Err(e) = Self::apply_inner(backend, &ranges) {
            return match Self::rollback(backend, &snapshot) {
                Ok(()) => Err(step_failed(1, e)),
                Err(rollback) => Err(MigrationError::RollbackFailed {
                    version: 1,
                    rollback,
                }),
            };
        }

        info!(ranges = ranges.len(), "migrated single-address exemptions to ranges");
        Ok(())
    }
}

/// v2: re-decompose stored ranges with the corrected range algebra.
struct NormalizeRanges;

impl NormalizeRanges {
    fn apply_inner(backend: &SqliteBackend, fixes: &[RangeFix]) -> Result<(), PersistenceError> {
        backend.with_conn(|conn| {
            for fix in fixes {
                match fix {
                    RangeFix::Rewrite { row, blocks } => {
                        conn.execute(
                            "delete from exempt_ranges where range_start = ?1 and range_end = ?2",
                            params![i64::from(row.start), i64::from(row.end)],
                        )?;
                        for block in blocks {
                            SqliteBackend::insert_range_row(conn, block)?;
                        }
                    }
                    RangeFix::Relabel { row, block } => {
                        conn.execute(
                            "update exempt_ranges set cidr = ?1 \
                             where range_start = ?2 and range_end = ?3",
                            params![
                                block.to_string(),
                                i64::from(row.start),
                                i64::from(row.end)
                            ],
                        )?;
                    }
                }
            }

            conn.execute("insert into schema_version (version) values (2)", [])?;
            Ok(())
        })
    }

    fn rollback(backend: &SqliteBackend, snapshot: &[RangeRow]) -> Result<(), PersistenceError> {
        warn!("rolling back range normalization migration");
        backend.with_conn(|conn| {
            conn.execute("delete from exempt_ranges", [])?;
            for row in snapshot {
                conn.execute(
                    "insert into exempt_ranges (cidr, range_start, range_end) values (?1, ?2, ?3)",
                    params![row.cidr, i64::from(row.start), i64::from(row.end)],
                )?;
            }
            conn.execute("delete from schema_version where version = 2", [])?;
            Ok(())
        })
    }
}

impl Migration<SqliteBackend> for NormalizeRanges {
    fn version_number(&self) -> u32 {
        2
    }

    fn needs_update(&self, backend: &SqliteBackend) -> bool {
        !backend.has_version_marker(2)
    }

    fn apply(&self, backend: &SqliteBackend) -> Result<(), MigrationError> {
        let snapshot = backend.range_rows().map_err(|e| step_failed(2, e))?;
        let fixes = plan_range_normalization(&snapshot);

        if !fixes.is_empty() {
            info!(rows = fixes.len(), "normalizing stored exemption ranges");
        }

        if let Err(e) = Self::apply_inner(backend, &fixes) {
            return match Self::rollback(backend, &snapshot) {
                Ok(()) => Err(step_failed(2, e)),
                Err(rollback) => Err(MigrationError::RollbackFailed {
                    version: 2,
                    rollback,
                }),
            };
        }

        Ok(())
    }
}
