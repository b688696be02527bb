//! Proxyward screens connecting users against IP reputation data.
//!
//! Classifies each connecting address as a VPN/proxy or by country policy,
//! with an exemption layer, two caching tiers and pluggable durable storage.
//!
//! # Features
//!
//! - **Exemptions** - Principals, CIDR address ranges and name prefixes skip
//!   checks entirely, with no cache or network interaction
//! - **CIDR Algebra** - Arbitrary address ranges are stored as their minimal
//!   aligned block decomposition
//! - **Layered Caching** - A short-lived outcome cache in front of a
//!   longer-lived persistent response cache; at most one external query per
//!   cache miss
//! - **Deferred Enforcement** - Kicks against principals still mid-handshake
//!   are queued until they become addressable
//! - **Pluggable Storage** - SQLite, MySQL or MongoDB, evolved by a versioned,
//!   rollback-capable migration engine
//! - **Fail-Open Lookups** - A failed reputation query never blocks a
//!   connection
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   enabled: true
//!   kick_blocked: true
//!
//! api:
//!   license: "${PROXYWARD_LICENSE}"
//!   timeout_ms: 5000
//!
//! countries:
//!   list: ["US", "CA"]
//!   whitelist_mode: true
//!
//! database:
//!   enabled: true
//!   kind: sqlite
//!   path: "proxyward.db"
//! ```

pub mod cache;
pub mod cidr;
pub mod config;
pub mod deferred;
pub mod error;
pub mod exempt;
pub mod lookup;
pub mod pipeline;
pub mod runtime;
pub mod storage;
pub mod webhook;

pub use cidr::AddressRange;
pub use config::Config;
pub use exempt::ExemptionStore;
pub use pipeline::{CheckOutcome, CheckPipeline, CheckRequest, Principal, Verdict};
