//! Exemption store.
//!
//! Holds the two exemption sets: principal identifiers and address ranges.
//! Membership tests run against an in-memory snapshot so the hot path never
//! waits on storage; when a durable backend is configured a background task
//! re-reads the full set on a fixed period and swaps the snapshot atomically,
//! bounding staleness. Mutations apply to durable storage first and then patch
//! the snapshot, so the local process reads its own writes.

use crate::cidr::AddressRange;
use crate::error::PersistenceError;
use crate::storage::PersistentBackend;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const REFRESH_START_DELAY: Duration = Duration::from_secs(2);
const REFRESH_PERIOD: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Snapshot {
    principals: HashSet<Uuid>,
    ranges: HashSet<AddressRange>,
}

/// The exemption sets, optionally mirrored from a durable backend.
pub struct ExemptionStore {
    snapshot: RwLock<Snapshot>,
    backend: Option<Arc<dyn PersistentBackend>>,
}

impl ExemptionStore {
    /// Transient in-memory store. Exemptions live for the process lifetime.
    pub fn in_memory() -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            backend: None,
        }
    }

    /// Store mirrored from a durable backend.
    pub fn with_backend(backend: Arc<dyn PersistentBackend>) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            backend: Some(backend),
        }
    }

    pub fn is_principal_exempt(&self, id: &Uuid) -> bool {
        self.snapshot
            .read()
            .map(|s| s.principals.contains(id))
            .unwrap_or(false)
    }

    /// True if any stored range contains the address.
    pub fn is_address_exempt(&self, addr: Ipv4Addr) -> bool {
        self.snapshot
            .read()
            .map(|s| s.ranges.iter().any(|r| r.contains(addr)))
            .unwrap_or(false)
    }

    /// Exempt a principal. Durable storage is updated first; a persistence
    /// failure leaves the snapshot untouched and surfaces to the caller.
    pub fn add_principal(&self, id: Uuid) -> Result<(), PersistenceError> {
        if let Some(backend) = &self.backend {
            backend.add_principal(&id)?;
        }
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.principals.insert(id);
        }
        Ok(())
    }

    pub fn remove_principal(&self, id: &Uuid) -> Result<(), PersistenceError> {
        if let Some(backend) = &self.backend {
            backend.remove_principal(id)?;
        }
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.principals.remove(id);
        }
        Ok(())
    }

    pub fn add_range(&self, range: AddressRange) -> Result<(), PersistenceError> {
        if let Some(backend) = &self.backend {
            backend.add_range(&range)?;
        }
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.ranges.insert(range);
        }
        Ok(())
    }

    pub fn remove_range(&self, range: &AddressRange) -> Result<(), PersistenceError> {
        if let Some(backend) = &self.backend {
            backend.remove_range(range)?;
        }
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.ranges.remove(range);
        }
        Ok(())
    }

    pub fn list_principals(&self) -> Vec<Uuid> {
        self.snapshot
            .read()
            .map(|s| s.principals.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Stored ranges in ascending address order.
    pub fn list_ranges(&self) -> Vec<AddressRange> {
        let mut ranges: Vec<AddressRange> = self
            .snapshot
            .read()
            .map(|s| s.ranges.iter().copied().collect())
            .unwrap_or_default();
        ranges.sort();
        ranges
    }

    /// Re-read the full exemption set from the backend and swap the snapshot.
    /// A no-op without a backend.
    pub fn refresh(&self) -> Result<(), PersistenceError> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };

        let principals: HashSet<Uuid> = backend.list_principals()?.into_iter().collect();
        let ranges: HashSet<AddressRange> = backend.list_ranges()?.into_iter().collect();

        debug!(
            principals = principals.len(),
            ranges = ranges.len(),
            "refreshed exemption snapshot"
        );

        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = Snapshot { principals, ranges };
        }
        Ok(())
    }

    /// Spawn the periodic snapshot refresh task.
    pub fn start_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + REFRESH_START_DELAY;
            let mut tick = tokio::time::interval_at(start, REFRESH_PERIOD);

            loop {
                tick.tick().await;

                let store = Arc::clone(&store);
                let refreshed =
                    tokio::task::spawn_blocking(move || store.refresh()).await;

                match refreshed {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "exemption refresh failed"),
                    Err(e) => warn!(error = %e, "exemption refresh task panicked"),
                }
            }
        })
    }
}
