//! Networked SQL backend.

use crate::cache::TtlCache;
use crate::cidr::AddressRange;
use crate::config::DatabaseConfig;
use crate::error::{MigrationError, PersistenceError};
use crate::lookup::{epoch_ms, ReputationResult};
use crate::storage::migrate::{
    addresses_to_ranges, plan_range_normalization, run_migrations, Migration, RangeFix, RangeRow,
};
use crate::storage::{PersistentBackend, RESPONSE_CACHE_CAPACITY, RESPONSE_CACHE_TTL};
use mysql::prelude::Queryable;
use mysql::{OptsBuilder, Pool, PooledConn};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Backend talking to a MySQL server through a connection pool.
pub struct MySqlBackend {
    pool: Pool,
    responses: TtlCache<Ipv4Addr, ReputationResult>,
    retention: Duration,
}

impl MySqlBackend {
    /// Connect to the configured server.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, PersistenceError> {
        let mut opts = OptsBuilder::new()
            .ip_or_hostname(Some(config.host.clone()))
            .tcp_port(config.port())
            .db_name(Some(config.name.clone()));

        if config.use_credentials {
            opts = opts
                .user(Some(config.username.clone()))
                .pass(Some(config.password.clone()));
        }

        let pool = Pool::new(opts)?;

        Ok(Self {
            pool,
            responses: TtlCache::new(RESPONSE_CACHE_TTL, RESPONSE_CACHE_CAPACITY),
            retention: Duration::from_secs(config.response_retention_secs),
        })
    }

    fn conn(&self) -> Result<PooledConn, PersistenceError> {
        self.pool.get_conn().map_err(PersistenceError::from)
    }

    fn has_version_marker(&self, version: u32) -> bool {
        let Ok(mut conn) = self.conn() else {
            return false;
        };

        conn.exec_first::<i64, _, _>(
            "SELECT COUNT(*) FROM schema_version WHERE version = ?",
            (version,),
        )
        .map(|count| count.unwrap_or(0) > 0)
        .unwrap_or(false)
    }

    fn range_rows(&self) -> Result<Vec<RangeRow>, PersistenceError> {
        let rows: Vec<(String, i64, i64)> = self
            .conn()?
            .query("SELECT cidr, range_start, range_end FROM exempt_ranges")?;

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

    fn insert_range_row(conn: &mut PooledConn, range: &AddressRange) -> Result<(), mysql::Error> {
        conn.exec_drop(
            "INSERT INTO exempt_ranges (cidr, range_start, range_end) VALUES (?, ?, ?)",
            (
                range.to_string(),
                i64::from(range.start()),
                i64::from(range.end()),
            ),
        )
    }
}

impl PersistentBackend for MySqlBackend {
    fn init(&self) -> Result<(), MigrationError> {
        info!("initializing MySQL database");
        run_migrations(self, &migrations())
    }

    fn shutdown(&self) {
        self.responses.clear();
    }

    fn cached_response(&self, addr: Ipv4Addr) -> Result<Option<ReputationResult>, PersistenceError> {
        if let Some(result) = self.responses.get(&addr) {
            return Ok(Some(result));
        }

        type ResponseRow = (String, String, String, String, String, String, bool, i64);
        let row: Option<ResponseRow> = self.conn()?.exec_first(
            "SELECT ip, asn, country_name, country_code, city, isp, proxy, observed_at \
             FROM responses WHERE ip = ? LIMIT 1",
            (addr.to_string(),),
        )?;

        let Some((ip, asn, country_name, country_code, city, isp, proxy, observed_at)) = row
        else {
            return Ok(None);
        };

        let result = ReputationResult {
            address: ip,
            asn,
            country_name,
            country_code,
            city,
            isp,
            is_proxy: proxy,
            success: true,
            failure_reason: None,
            observed_at_ms: observed_at as u64,
        };

        if epoch_ms().saturating_sub(result.observed_at_ms) > self.retention.as_millis() as u64 {
            self.conn()?
                .exec_drop("DELETE FROM responses WHERE ip = ?", (addr.to_string(),))?;
            return Ok(None);
        }

        self.responses.insert(addr, result.clone());
        Ok(Some(result))
    }

    fn put_cached_response(&self, result: &ReputationResult) -> Result<(), PersistenceError> {
        if let Ok(addr) = result.address.parse::<Ipv4Addr>() {
            self.responses.insert(addr, result.clone());
        }

        let mut conn = self.conn()?;
        conn.exec_drop("DELETE FROM responses WHERE ip = ?", (result.address.clone(),))?;
        conn.exec_drop(
            "INSERT INTO responses (ip, asn, country_name, country_code, city, isp, proxy, observed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                result.address.clone(),
                result.asn.clone(),
                result.country_name.clone(),
                result.country_code.clone(),
                result.city.clone(),
                result.isp.clone(),
                result.is_proxy,
                result.observed_at_ms as i64,
            ),
        )?;
        Ok(())
    }

    fn clear_cached_responses(&self) -> Result<(), PersistenceError> {
        self.responses.clear();
        self.conn()?.query_drop("DELETE FROM responses")?;
        Ok(())
    }

    fn is_principal_exempt(&self, id: &Uuid) -> Result<bool, PersistenceError> {
        let found: Option<i64> = self.conn()?.exec_first(
            "SELECT 1 FROM exempt_principals WHERE uuid = ? LIMIT 1",
            (id.to_string(),),
        )?;
        Ok(found.is_some())
    }

    fn is_range_exempt(&self, range: &AddressRange) -> Result<bool, PersistenceError> {
        let found: Option<i64> = self.conn()?.exec_first(
            "SELECT 1 FROM exempt_ranges WHERE range_start <= ? AND range_end >= ? LIMIT 1",
            (i64::from(range.start()), i64::from(range.end())),
        )?;
        Ok(found.is_some())
    }

    fn add_principal(&self, id: &Uuid) -> Result<(), PersistenceError> {
        self.conn()?.exec_drop(
            "INSERT INTO exempt_principals (uuid) VALUES (?)",
            (id.to_string(),),
        )?;
        Ok(())
    }

    fn remove_principal(&self, id: &Uuid) -> Result<(), PersistenceError> {
        self.conn()?.exec_drop(
            "DELETE FROM exempt_principals WHERE uuid = ?",
            (id.to_string(),),
        )?;
        Ok(())
    }

    fn add_range(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        let mut conn = self.conn()?;
        Self::insert_range_row(&mut conn, range)?;
        Ok(())
    }

    fn remove_range(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        self.conn()?.exec_drop(
            "DELETE FROM exempt_ranges WHERE cidr = ?",
            (range.to_string(),),
        )?;
        Ok(())
    }

    fn list_principals(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let rows: Vec<String> = self.conn()?.query("SELECT uuid FROM exempt_principals")?;

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
        let rows: Vec<String> = self.conn()?.query("SELECT cidr FROM exempt_ranges")?;

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
        let found: Option<i64> = self.conn()?.exec_first(
            "SELECT 1 FROM alerts WHERE uuid = ? LIMIT 1",
            (id.to_string(),),
        )?;
        Ok(found.is_some())
    }

    fn set_alert_flag(&self, id: &Uuid, enabled: bool) -> Result<(), PersistenceError> {
        if enabled {
            // Guard against double insertion so one delete disables globally.
            if self.alert_flag(id)? {
                return Ok(());
            }
            self.conn()?
                .exec_drop("INSERT INTO alerts (uuid) VALUES (?)", (id.to_string(),))?;
        } else {
            self.conn()?
                .exec_drop("DELETE FROM alerts WHERE uuid = ?", (id.to_string(),))?;
        }
        Ok(())
    }
}

fn migrations() -> Vec<Box<dyn Migration<MySqlBackend>>> {
    vec![
        Box::new(InitialSchema),
        Box::new(AddressesToRanges),
        Box::new(NormalizeRanges),
    ]
}

fn step_failed(version: u32, source: PersistenceError) -> MigrationError {
    MigrationError::StepFailed { version, source }
}

/// v0: base tables with inline indexes, idempotent under re-runs.
struct InitialSchema;

impl Migration<MySqlBackend> for InitialSchema {
    fn version_number(&self) -> u32 {
        0
    }

    fn needs_update(&self, backend: &MySqlBackend) -> bool {
        !backend.has_version_marker(0)
    }

    fn apply(&self, backend: &MySqlBackend) -> Result<(), MigrationError> {
        let run = || -> Result<(), PersistenceError> {
            let mut conn = backend.conn()?;
            conn.query_drop(
                "CREATE TABLE IF NOT EXISTS exempt_principals (
                     uuid VARCHAR(36) NOT NULL, INDEX idx_principals_uuid (uuid))",
            )?;
            conn.query_drop(
                "CREATE TABLE IF NOT EXISTS exempt_addresses (
                     ip VARCHAR(45) NOT NULL, INDEX idx_addresses_ip (ip))",
            )?;
            conn.query_drop(
                "CREATE TABLE IF NOT EXISTS responses (
                     ip VARCHAR(45) NOT NULL, asn VARCHAR(16) NOT NULL,
                     country_name TEXT NOT NULL, country_code VARCHAR(10) NOT NULL,
                     city TEXT NOT NULL, isp TEXT NOT NULL,
                     proxy BOOLEAN NOT NULL, observed_at BIGINT NOT NULL,
                     INDEX idx_responses_ip (ip))",
            )?;
            conn.query_drop("CREATE TABLE IF NOT EXISTS alerts (uuid VARCHAR(36) NOT NULL)")?;
            conn.query_drop("CREATE TABLE IF NOT EXISTS schema_version (version INT NOT NULL)")?;
            conn.query_drop("INSERT INTO schema_version (version) VALUES (0)")?;
            Ok(())
        };

        run().map_err(|e| step_failed(0, e))
    }
}

/// v1: rewrite legacy single-address exemption rows into range rows.
struct AddressesToRanges;

impl AddressesToRanges {
    fn apply_inner(backend: &MySqlBackend, ranges: &[AddressRange]) -> Result<(), PersistenceError> {
        let mut conn = backend.conn()?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS exempt_ranges (
                 id INT AUTO_INCREMENT PRIMARY KEY,
                 cidr VARCHAR(45) NOT NULL,
                 range_start BIGINT NOT NULL,
                 range_end BIGINT NOT NULL,
                 INDEX idx_ranges_bounds (range_start, range_end))",
        )?;

        for range in ranges {
            MySqlBackend::insert_range_row(&mut conn, range)?;
        }

        conn.query_drop("DROP TABLE exempt_addresses")?;
        conn.query_drop("INSERT INTO schema_version (version) VALUES (1)")?;
        Ok(())
    }

    fn rollback(backend: &MySqlBackend, snapshot: &[String]) -> Result<(), PersistenceError> {
        warn!("rolling back address-to-range migration");
        let mut conn = backend.conn()?;
        conn.query_drop("DROP TABLE IF EXISTS exempt_ranges")?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS exempt_addresses (
                 ip VARCHAR(45) NOT NULL, INDEX idx_addresses_ip (ip))",
        )?;
        conn.query_drop("DELETE FROM exempt_addresses")?;

        for ip in snapshot {
            conn.exec_drop("INSERT INTO exempt_addresses (ip) VALUES (?)", (ip.clone(),))?;
        }

        conn.query_drop("DELETE FROM schema_version WHERE version = 1")?;
        Ok(())
    }
}

impl Migration<MySqlBackend> for AddressesToRanges {
    fn version_number(&self) -> u32 {
        1
    }

    fn needs_update(&self, backend: &MySqlBackend) -> bool {
        !backend.has_version_marker(1)
    }

    fn apply(&self, backend: &MySqlBackend) -> Result<(), MigrationError> {
        let snapshot: Vec<String> = backend
            .conn()
            .and_then(|mut conn| {
                conn.query("SELECT ip FROM exempt_addresses")
                    .map_err(PersistenceError::from)
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
    fn apply_inner(backend: &MySqlBackend, fixes: &[RangeFix]) -> Result<(), PersistenceError> {
        let mut conn = backend.conn()?;

        for fix in fixes {
            match fix {
                RangeFix::Rewrite { row, blocks } => {
                    conn.exec_drop(
                        "DELETE FROM exempt_ranges WHERE range_start = ? AND range_end = ?",
                        (i64::from(row.start), i64::from(row.end)),
                    )?;
                    for block in blocks {
                        MySqlBackend::insert_range_row(&mut conn, block)?;
                    }
                }
                RangeFix::Relabel { row, block } => {
                    conn.exec_drop(
                        "UPDATE exempt_ranges SET cidr = ? WHERE range_start = ? AND range_end = ?",
                        (
                            block.to_string(),
                            i64::from(row.start),
                            i64::from(row.end),
                        ),
                    )?;
                }
            }
        }

        conn.query_drop("INSERT INTO schema_version (version) VALUES (2)")?;
        Ok(())
    }

    fn rollback(backend: &MySqlBackend, snapshot: &[RangeRow]) -> Result<(), PersistenceError> {
        warn!("rolling back range normalization migration");
        let mut conn = backend.conn()?;
        conn.query_drop("DELETE FROM exempt_ranges")?;

        for row in snapshot {
            conn.exec_drop(
                "INSERT INTO exempt_ranges (cidr, range_start, range_end) VALUES (?, ?, ?)",
                (row.cidr.clone(), i64::from(row.start), i64::from(row.end)),
            )?;
        }

        conn.query_drop("DELETE FROM schema_version WHERE version = 2")?;
        Ok(())
    }
}

impl Migration<MySqlBackend> for NormalizeRanges {
    fn version_number(&self) -> u32 {
        2
    }

    fn needs_update(&self, backend: &MySqlBackend) -> bool {
        !backend.has_version_marker(2)
    }

    fn apply(&self, backend: &MySqlBackend) -> Result<(), MigrationError> {
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
