//! Schema migration engine.
//!
//! Each backend exposes an ordered list of versioned steps applied at startup
//! after the connection is established. A step either fully applies its change
//! and records the new version marker, or leaves the backend in its pre-call
//! state; data-transforming steps snapshot affected rows before mutating and
//! replay the snapshot verbatim on failure. A failed step aborts startup;
//! the engine never retries, skips or reorders.

use crate::cidr::{decompose, AddressRange};
use crate::error::MigrationError;
use tracing::{debug, info};

/// A single versioned migration step for backend `B`.
pub trait Migration<B: ?Sized>: Send + Sync {
    fn version_number(&self) -> u32;

    /// Whether this step still has to run. Queries the persisted version
    /// marker (or the schema shape) directly and must not assume the marker
    /// table exists; when in doubt the answer is true.
    fn needs_update(&self, backend: &B) -> bool;

    /// Apply the step and record the version marker, or roll back and
    /// re-raise the original error.
    fn apply(&self, backend: &B) -> Result<(), MigrationError>;
}

/// Apply a backend's migration list in order. Steps whose `needs_update`
/// returns false are skipped without side effects.
pub fn run_migrations<B: ?Sized>(
    backend: &B,
    steps: &[Box<dyn Migration<B>>],
) -> Result<(), MigrationError> {
    for step in steps {
        if step.needs_update(backend) {
            info!(version = step.version_number(), "applying schema migration");
            step.apply(backend)?;
        } else {
            debug!(version = step.version_number(), "schema migration already applied");
        }
    }
    Ok(())
}

/// A stored exemption range row as the backends persist it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRow {
    pub cidr: String,
    pub start: u32,
    pub end: u32,
}

/// Correction for one stored range row.
#[derive(Debug)]
pub enum RangeFix {
    /// The bounds span more than one aligned block: replace the row with its
    /// canonical decomposition.
    Rewrite {
        row: RangeRow,
        blocks: Vec<AddressRange>,
    },
    /// The bounds form a single block but the stored text disagrees with it:
    /// rewrite the text.
    Relabel { row: RangeRow, block: AddressRange },
}

/// Plan the corrections needed to bring stored rows in line with the range
/// algebra. Rows that already match their canonical block are left alone.
pub fn plan_range_normalization(rows: &[RangeRow]) -> Vec<RangeFix> {
    let mut fixes = Vec::new();

    for row in rows {
        let blocks = decompose(row.start, row.end);

        match blocks.as_slice() {
            [single] if single.to_string() == row.cidr => {}
            [single] => fixes.push(RangeFix::Relabel {
                row: row.clone(),
                block: *single,
            }),
            _ => fixes.push(RangeFix::Rewrite {
                row: row.clone(),
                blocks,
            }),
        }
    }

    fixes
}

/// Parse legacy single-address exemption rows into `/32` ranges.
pub fn addresses_to_ranges(ips: &[String]) -> Result<Vec<AddressRange>, MigrationError> {
    ips.iter()
        .map(|ip| AddressRange::parse(ip).map_err(|_| MigrationError::CorruptRange(ip.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_to_ranges() {
        let ips = vec!["10.0.0.1".to_string(), "192.168.1.2".to_string()];
        let ranges = addresses_to_ranges(&ips).unwrap();

        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].to_string(), "10.0.0.1/32");
        assert_eq!(ranges[1].to_string(), "192.168.1.2/32");
    }

    #[test]
    fn test_addresses_to_ranges_rejects_corrupt_rows() {
        let ips = vec!["not-an-ip".to_string()];
        assert!(matches!(
            addresses_to_ranges(&ips),
            Err(MigrationError::CorruptRange(_))
        ));
    }

    #[test]
    fn test_normalization_leaves_canonical_rows_alone() {
        let rows = vec![RangeRow {
            cidr: "10.0.0.0/8".to_string(),
            start: u32::from_be_bytes([10, 0, 0, 0]),
            end: u32::from_be_bytes([10, 255, 255, 255]),
        }];

        assert!(plan_range_normalization(&rows).is_empty());
    }

    #[test]
    fn test_normalization_rewrites_multi_block_rows() {
        let rows = vec![RangeRow {
            cidr: "0.0.0.10/30".to_string(),
            start: 10,
            end: 13,
        }];

        let fixes = plan_range_normalization(&rows);
        assert_eq!(fixes.len(), 1);
        match &fixes[0] {
            RangeFix::Rewrite { blocks, .. } => {
                let texts: Vec<String> = blocks.iter().map(|b| b.to_string()).collect();
                assert_eq!(texts, vec!["0.0.0.10/31", "0.0.0.12/31"]);
            }
            other => panic!("expected rewrite, got {:?}", other),
        }
    }

    #[test]
    fn test_normalization_relabels_mismatched_text() {
        let rows = vec![RangeRow {
            cidr: "10.0.0.0".to_string(),
            start: u32::from_be_bytes([10, 0, 0, 0]),
            end: u32::from_be_bytes([10, 0, 0, 255]),
        }];

        let fixes = plan_range_normalization(&rows);
        assert_eq!(fixes.len(), 1);
        match &fixes[0] {
            RangeFix::Relabel { block, .. } => {
                assert_eq!(block.to_string(), "10.0.0.0/24");
            }
            other => panic!("expected relabel, got {:?}", other),
        }
    }

    struct Recorder {
        version: u32,
        applied: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl Migration<Vec<u32>> for Recorder {
        fn version_number(&self) -> u32 {
            self.version
        }

        fn needs_update(&self, markers: &Vec<u32>) -> bool {
            !markers.contains(&self.version)
        }

        fn apply(&self, _markers: &Vec<u32>) -> Result<(), MigrationError> {
            self.applied.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_runner_skips_satisfied_steps() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let steps: Vec<Box<dyn Migration<Vec<u32>>>> = vec![
            Box::new(Recorder {
                version: 0,
                applied: Arc::clone(&first),
            }),
            Box::new(Recorder {
                version: 1,
                applied: Arc::clone(&second),
            }),
        ];

        // Marker 0 is already persisted, so only v1 should run.
        let markers = vec![0];
        run_migrations(&markers, &steps).unwrap();

        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }
}
