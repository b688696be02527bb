//! Document database backend.

use crate::cache::TtlCache;
use crate::cidr::AddressRange;
use crate::config::DatabaseConfig;
use crate::error::{MigrationError, PersistenceError};
use crate::lookup::{epoch_ms, ReputationResult};
use crate::storage::migrate::{
    addresses_to_ranges, plan_range_normalization, run_migrations, Migration, RangeFix, RangeRow,
};
use crate::storage::{PersistentBackend, RESPONSE_CACHE_CAPACITY, RESPONSE_CACHE_TTL};
use mongodb::bson::{doc, Document};
use mongodb::options::UpdateOptions;
use mongodb::sync::{Client, Collection, Database};
use mongodb::IndexModel;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const PRINCIPALS: &str = "exempt_principals";
const ADDRESSES: &str = "exempt_addresses";
const RANGES: &str = "exempt_ranges";
const RESPONSES: &str = "responses";
const ALERTS: &str = "alerts";
const VERSIONS: &str = "schema_version";

/// Backend talking to a MongoDB deployment.
pub struct MongoBackend {
    db: Database,
    responses: TtlCache<Ipv4Addr, ReputationResult>,
    retention: Duration,
}

impl MongoBackend {
    /// Connect using the configured URL, or host/port/credentials when no URL
    /// is given.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, PersistenceError> {
        let uri = if !config.mongo_url.trim().is_empty() {
            config.mongo_url.clone()
        } else if config.use_credentials {
            format!(
                "mongodb://{}:{}@{}:{}",
                config.username,
                config.password,
                config.host,
                config.port()
            )
        } else {
            format!("mongodb://{}:{}", config.host, config.port())
        };

        let client = Client::with_uri_str(&uri)?;

        Ok(Self {
            db: client.database(&config.name),
            responses: TtlCache::new(RESPONSE_CACHE_TTL, RESPONSE_CACHE_CAPACITY),
            retention: Duration::from_secs(config.response_retention_secs),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }

    fn has_version_marker(&self, version: u32) -> bool {
        self.collection(VERSIONS)
            .find_one(doc! { "version": version as i64 }, None)
            .map(|found| found.is_some())
            .unwrap_or(false)
    }

    fn record_version(&self, version: u32) -> Result<(), PersistenceError> {
        self.collection(VERSIONS)
            .insert_one(doc! { "version": version as i64 }, None)?;
        Ok(())
    }

    fn range_rows(&self) -> Result<Vec<RangeRow>, PersistenceError> {
        let mut rows = Vec::new();

        for document in self.collection(RANGES).find(None, None)? {
            let document = document?;
            rows.push(range_row(&document)?);
        }

        Ok(rows)
    }

    fn insert_range_doc(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        self.collection(RANGES).insert_one(
            doc! {
                "cidr": range.to_string(),
                "range_start": i64::from(range.start()),
                "range_end": i64::from(range.end()),
            },
            None,
        )?;
        Ok(())
    }
}

fn field_error(e: mongodb::bson::document::ValueAccessError) -> PersistenceError {
    PersistenceError::Other(format!("malformed document: {}", e))
}

fn range_row(document: &Document) -> Result<RangeRow, PersistenceError> {
    let cidr = document.get_str("cidr").map_err(field_error)?.to_string();
    let start = document.get_i64("range_start").map_err(field_error)?;
    let end = document.get_i64("range_end").map_err(field_error)?;

    let start = u32::try_from(start)
        .map_err(|_| PersistenceError::Other(format!("corrupt range row {cidr:?}")))?;
    let end = u32::try_from(end)
        .map_err(|_| PersistenceError::Other(format!("corrupt range row {cidr:?}")))?;

    Ok(RangeRow { cidr, start, end })
}

fn response_from(document: &Document) -> Result<ReputationResult, PersistenceError> {
    Ok(ReputationResult {
        address: document.get_str("ip").map_err(field_error)?.to_string(),
        asn: document.get_str("asn").map_err(field_error)?.to_string(),
        country_name: document
            .get_str("country_name")
            .map_err(field_error)?
            .to_string(),
        country_code: document
            .get_str("country_code")
            .map_err(field_error)?
            .to_string(),
        city: document.get_str("city").map_err(field_error)?.to_string(),
        isp: document.get_str("isp").map_err(field_error)?.to_string(),
        is_proxy: document.get_bool("proxy").map_err(field_error)?,
        success: true,
        failure_reason: None,
        observed_at_ms: document.get_i64("observed_at").map_err(field_error)? as u64,
    })
}

impl PersistentBackend for MongoBackend {
    fn init(&self) -> Result<(), MigrationError> {
        info!("initializing MongoDB database");
        run_migrations(self, &migrations())
    }

    fn shutdown(&self) {
        self.responses.clear();
    }

    fn cached_response(&self, addr: Ipv4Addr) -> Result<Option<ReputationResult>, PersistenceError> {
        if let Some(result) = self.responses.get(&addr) {
            return Ok(Some(result));
        }

        let document = self
            .collection(RESPONSES)
            .find_one(doc! { "ip": addr.to_string() }, None)?;

        let Some(document) = document else {
            return Ok(None);
        };

        let result = response_from(&document)?;

        // Retention: stale documents are dropped on read instead of served.
        if epoch_ms().saturating_sub(result.observed_at_ms) > self.retention.as_millis() as u64 {
            self.collection(RESPONSES)
                .delete_many(doc! { "ip": addr.to_string() }, None)?;
            return Ok(None);
        }

        self.responses.insert(addr, result.clone());
        Ok(Some(result))
    }

    fn put_cached_response(&self, result: &ReputationResult) -> Result<(), PersistenceError> {
        if let Ok(addr) = result.address.parse::<Ipv4Addr>() {
            self.responses.insert(addr, result.clone());
        }

        let update = doc! {
            "$set": {
                "ip": result.address.clone(),
                "asn": result.asn.clone(),
                "country_name": result.country_name.clone(),
                "country_code": result.country_code.clone(),
                "city": result.city.clone(),
                "isp": result.isp.clone(),
                "proxy": result.is_proxy,
                "observed_at": result.observed_at_ms as i64,
            }
        };

        self.collection(RESPONSES).update_one(
            doc! { "ip": result.address.clone() },
            update,
            UpdateOptions::builder().upsert(true).build(),
        )?;
        Ok(())
    }

    fn clear_cached_responses(&self) -> Result<(), PersistenceError> {
        self.responses.clear();
        self.collection(RESPONSES).delete_many(doc! {}, None)?;
        Ok(())
    }

    fn is_principal_exempt(&self, id: &Uuid) -> Result<bool, PersistenceError> {
        let found = self
            .collection(PRINCIPALS)
            .find_one(doc! { "uuid": id.to_string() }, None)?;
        Ok(found.is_some())
    }

    fn is_range_exempt(&self, range: &AddressRange) -> Result<bool, PersistenceError> {
        let found = self.collection(RANGES).find_one(
            doc! {
                "range_start": { "$lte": i64::from(range.start()) },
                "range_end": { "$gte": i64::from(range.end()) },
            },
            None,
        )?;
        Ok(found.is_some())
    }

    fn add_principal(&self, id: &Uuid) -> Result<(), PersistenceError> {
        self.collection(PRINCIPALS)
            .insert_one(doc! { "uuid": id.to_string() }, None)?;
        Ok(())
    }

    fn remove_principal(&self, id: &Uuid) -> Result<(), PersistenceError> {
        self.collection(PRINCIPALS)
            .delete_many(doc! { "uuid": id.to_string() }, None)?;
        Ok(())
    }

    fn add_range(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        self.insert_range_doc(range)
    }

    fn remove_range(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        self.collection(RANGES)
            .delete_many(doc! { "cidr": range.to_string() }, None)?;
        Ok(())
    }

    fn list_principals(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let mut principals = Vec::new();

        for document in self.collection(PRINCIPALS).find(None, None)? {
            let document = document?;
            let text = document.get_str("uuid").map_err(field_error)?;
            match Uuid::parse_str(text) {
                Ok(id) => principals.push(id),
                Err(_) => warn!(uuid = %text, "skipping unparseable principal document"),
            }
        }

        Ok(principals)
    }

    fn list_ranges(&self) -> Result<Vec<AddressRange>, PersistenceError> {
        let mut ranges = Vec::new();

        for document in self.collection(RANGES).find(None, None)? {
            let document = document?;
            let text = document.get_str("cidr").map_err(field_error)?;
            match AddressRange::parse(text) {
                Ok(range) => ranges.push(range),
                Err(e) => warn!(cidr = %text, error = %e, "skipping unparseable range document"),
            }
        }

        Ok(ranges)
    }

    fn alert_flag(&self, id: &Uuid) -> Result<bool, PersistenceError> {
        let found = self
            .collection(ALERTS)
            .find_one(doc! { "uuid": id.to_string() }, None)?;
        Ok(found.is_some())
    }

    fn set_alert_flag(&self, id: &Uuid, enabled: bool) -> Result<(), PersistenceError> {
        if enabled {
            // Guard against double insertion so one delete disables globally.
            if self.alert_flag(id)? {
                return Ok(());
            }
            self.collection(ALERTS)
                .insert_one(doc! { "uuid": id.to_string() }, None)?;
        } else {
            self.collection(ALERTS)
                .delete_many(doc! { "uuid": id.to_string() }, None)?;
        }
        Ok(())
    }
}

fn migrations() -> Vec<Box<dyn Migration<MongoBackend>>> {
    vec![
        Box::new(InitialSchema),
        Box::new(AddressesToRanges),
        Box::new(NormalizeRanges),
    ]
}

fn step_failed(version: u32, source: PersistenceError) -> MigrationError {
    MigrationError::StepFailed { version, source }
}

/// v0: collection indexes. Creating an index implicitly creates the
/// collection, so nothing else is needed up front.
struct InitialSchema;

impl Migration<MongoBackend> for InitialSchema {
    fn version_number(&self) -> u32 {
        0
    }

    fn needs_update(&self, backend: &MongoBackend) -> bool {
        !backend.has_version_marker(0)
    }

    fn apply(&self, backend: &MongoBackend) -> Result<(), MigrationError> {
        let run = || -> Result<(), PersistenceError> {
            backend.collection(PRINCIPALS).create_index(
                IndexModel::builder().keys(doc! { "uuid": 1 }).build(),
                None,
            )?;
            backend.collection(ADDRESSES).create_index(
                IndexModel::builder().keys(doc! { "ip": 1 }).build(),
                None,
            )?;
            backend.collection(RESPONSES).create_index(
                IndexModel::builder().keys(doc! { "ip": 1 }).build(),
                None,
            )?;
            backend.record_version(0)
        };

        run().map_err(|e| step_failed(0, e))
    }
}

/// v1: rewrite legacy single-address exemption documents into range documents.
struct AddressesToRanges;

impl AddressesToRanges {
    fn apply_inner(backend: &MongoBackend, ranges: &[AddressRange]) -> Result<(), PersistenceError> {
        for range in ranges {
            backend.insert_range_doc(range)?;
        }

        backend.collection(RANGES).create_index(
            IndexModel::builder()
                .keys(doc! { "range_start": 1, "range_end": 1 })
                .build(),
            None,
        )?;

        backend.collection(ADDRESSES).drop(None)?;
        backend.record_version(1)
    }

    fn rollback(
        backend: &MongoBackend,
        snapshot: &[String],
        inserted: &[AddressRange],
    ) -> Result<(), PersistenceError> {
        warn!("rolling back address-to-range migration");

        for range in inserted {
            backend
                .collection(RANGES)
                .delete_many(doc! { "cidr": range.to_string() }, None)?;
        }

        for ip in snapshot {
            backend
                .collection(ADDRESSES)
                .insert_one(doc! { "ip": ip.clone() }, None)?;
        }

        backend
            .collection(VERSIONS)
            .delete_many(doc! { "version": 1i64 }, None)?;
        Ok(())
    }
}

impl Migration<MongoBackend> for AddressesToRanges {
    fn version_number(&self) -> u32 {
        1
    }

    fn needs_update(&self, backend: &MongoBackend) -> bool {
        !backend.has_version_marker(1)
    }

    fn apply(&self, backend: &MongoBackend) -> Result<(), MigrationError> {
        let snapshot = (|| -> Result<Vec<String>, PersistenceError> {
            let mut ips = Vec::new();
            for document in backend.collection(ADDRESSES).find(None, None)? {
                let document = document?;
                ips.push(document.get_str("ip").map_err(field_error)?.to_string());
            }
            Ok(ips)
        })()
        .map_err(|e| step_failed(1, e))?;

        let ranges = addresses_to_ranges(&snapshot)?;

        if let Err(e) = Self::apply_inner(backend, &ranges) {
            return match Self::rollback(backend, &snapshot, &ranges) {
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
    fn apply_inner(backend: &MongoBackend, fixes: &[RangeFix]) -> Result<(), PersistenceError> {
        for fix in fixes {
            match fix {
                RangeFix::Rewrite { row, blocks } => {
                    backend.collection(RANGES).delete_many(
                        doc! {
                            "range_start": i64::from(row.start),
                            "range_end": i64::from(row.end),
                        },
                        None,
                    )?;
                    for block in blocks {
                        backend.insert_range_doc(block)?;
                    }
                }
                RangeFix::Relabel { row, block } => {
                    backend.collection(RANGES).update_one(
                        doc! {
                            "range_start": i64::from(row.start),
                            "range_end": i64::from(row.end),
                        },
                        doc! { "$set": { "cidr": block.to_string() } },
                        None,
                    )?;
                }
            }
        }

        backend.record_version(2)
    }

    fn rollback(backend: &MongoBackend, snapshot: &[RangeRow]) -> Result<(), PersistenceError> {
        warn!("rolling back range normalization migration");

        backend.collection(RANGES).delete_many(doc! {}, None)?;
        for row in snapshot {
            backend.collection(RANGES).insert_one(
                doc! {
                    "cidr": row.cidr.clone(),
                    "range_start": i64::from(row.start),
                    "range_end": i64::from(row.end),
                },
                None,
            )?;
        }

        backend
            .collection(VERSIONS)
            .delete_many(doc! { "version": 2i64 }, None)?;
        Ok(())
    }
}

impl Migration<MongoBackend> for NormalizeRanges {
    fn version_number(&self) -> u32 {
        2
    }

    fn needs_update(&self, backend: &MongoBackend) -> bool {
        !backend.has_version_marker(2)
    }

    fn apply(&self, backend: &MongoBackend) -> Result<(), MigrationError> {
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
