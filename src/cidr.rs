//! CIDR range algebra.
//!
//! Converts between textual CIDR notation, inclusive integer address ranges
//! and the canonical decomposition of an arbitrary range into the minimal set
//! of aligned CIDR blocks. IPv4 only; the integer math is kept in `u64` so
//! widening to 128-bit addresses stays mechanical.

use crate::error::FormatError;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// Address width in bits.
const ADDRESS_BITS: u32 = 32;

/// An immutable CIDR block: `base/prefix` with all host bits of `base` zero.
///
/// The inclusive integer bounds are derived from the network and broadcast
/// addresses, so the alignment invariant holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRange {
    net: Ipv4Net,
}

impl AddressRange {
    /// Parse CIDR text. A bare address is treated as a `/32` block.
    ///
    /// Fails on malformed input, an out-of-range prefix length, or host bits
    /// set beyond the prefix (`10.0.0.1/8` is rejected, not coerced).
    pub fn parse(text: &str) -> Result<AddressRange, FormatError> {
        let Some((addr_text, prefix_text)) = text.split_once('/') else {
            let addr: Ipv4Addr = text
                .parse()
                .map_err(|_| FormatError::Malformed(text.to_string()))?;
            return Ok(AddressRange::single(addr));
        };

        let addr: Ipv4Addr = addr_text
            .parse()
            .map_err(|_| FormatError::Malformed(text.to_string()))?;
        let prefix: u8 = prefix_text
            .parse()
            .map_err(|_| FormatError::Malformed(text.to_string()))?;

        let net = Ipv4Net::new(addr, prefix).map_err(|_| FormatError::PrefixOutOfRange(prefix))?;
        if net.addr() != net.network() {
            return Err(FormatError::HostBitsSet {
                text: text.to_string(),
                prefix,
            });
        }

        Ok(AddressRange { net })
    }

    /// The block containing `addr` at the given prefix length: the lower
    /// bound is `addr & mask`, the upper bound `start | !mask`.
    pub fn block(addr: Ipv4Addr, prefix: u8) -> Result<AddressRange, FormatError> {
        let net = Ipv4Net::new(addr, prefix).map_err(|_| FormatError::PrefixOutOfRange(prefix))?;
        Ok(AddressRange { net: net.trunc() })
    }

    /// The `/32` block covering a single address.
    pub fn single(addr: Ipv4Addr) -> AddressRange {
        AddressRange {
            net: Ipv4Net::new(addr, ADDRESS_BITS as u8).expect("/32 is a valid IPv4 prefix"),
        }
    }

    /// Build from an already block-aligned start address and prefix length.
    fn from_aligned(start: u32, prefix: u8) -> AddressRange {
        AddressRange {
            net: Ipv4Net::new(Ipv4Addr::from(start), prefix)
                .expect("prefix length is at most the address width"),
        }
    }

    /// Inclusive lower bound as an integer.
    pub fn start(&self) -> u32 {
        u32::from(self.net.network())
    }

    /// Inclusive upper bound as an integer.
    pub fn end(&self) -> u32 {
        u32::from(self.net.broadcast())
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Containment test over the inclusive integer bounds.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        self.start() <= value && value <= self.end()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.net.fmt(f)
    }
}

/// Decompose an arbitrary inclusive range into the minimal ordered list of
/// maximally-aligned CIDR blocks covering it exactly.
///
/// Blocks come out in ascending order, pairwise non-overlapping and gap-free.
/// Returns an empty list when `start > end`.
pub fn decompose(start: u32, end: u32) -> Vec<AddressRange> {
    let mut blocks = Vec::new();
    let mut cursor = u64::from(start);
    let end = u64::from(end);

    while cursor <= end {
        // Alignment bound: trailing zero bits of the cursor. trailing_zeros of
        // zero saturates past the address width, so the cap handles start == 0.
        let align = cursor.trailing_zeros().min(ADDRESS_BITS);

        // Size bound: floor(log2(remaining span)).
        let span = end - cursor + 1;
        let size = 63 - span.leading_zeros();

        let block_bits = align.min(size);
        blocks.push(AddressRange::from_aligned(
            cursor as u32,
            (ADDRESS_BITS - block_bits) as u8,
        ));

        cursor += 1u64 << block_bits;
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(text: &str) -> AddressRange {
        AddressRange::parse(text).unwrap()
    }

    #[test]
    fn test_parse_block() {
        let r = range("10.0.0.0/8");
        assert_eq!(r.start(), u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(r.end(), u32::from(Ipv4Addr::new(10, 255, 255, 255)));
        assert_eq!(r.prefix_len(), 8);
    }

    #[test]
    fn test_parse_bare_address_is_slash_32() {
        let r = range("192.168.1.1");
        assert_eq!(r.prefix_len(), 32);
        assert_eq!(r.start(), r.end());
        assert_eq!(r.to_string(), "192.168.1.1/32");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            AddressRange::parse("not-an-ip"),
            Err(FormatError::Malformed(_))
        ));
        assert!(matches!(
            AddressRange::parse("300.0.0.1/8"),
            Err(FormatError::Malformed(_))
        ));
        assert!(matches!(
            AddressRange::parse("10.0.0.0/"),
            Err(FormatError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_out_of_range_prefix() {
        assert!(matches!(
            AddressRange::parse("10.0.0.0/33"),
            Err(FormatError::PrefixOutOfRange(33))
        ));
    }

    #[test]
    fn test_parse_rejects_host_bits() {
        assert!(matches!(
            AddressRange::parse("10.0.0.1/8"),
            Err(FormatError::HostBitsSet { prefix: 8, .. })
        ));
    }

    #[test]
    fn test_block_masks_host_bits() {
        let r = AddressRange::block(Ipv4Addr::new(10, 1, 2, 3), 8).unwrap();
        assert_eq!(r.to_string(), "10.0.0.0/8");
        assert_eq!(r.start(), u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(r.end(), u32::from(Ipv4Addr::new(10, 255, 255, 255)));

        assert!(AddressRange::block(Ipv4Addr::new(10, 1, 2, 3), 33).is_err());
    }

    #[test]
    fn test_contains() {
        let r = range("10.0.0.0/8");
        assert!(r.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(r.contains(Ipv4Addr::new(10, 255, 255, 255)));
        assert!(!r.contains(Ipv4Addr::new(11, 0, 0, 0)));
    }

    #[test]
    fn test_decompose_splits_unaligned_range() {
        // .0.10-.0.13 splits into two /31 blocks.
        let blocks = decompose(10, 13);
        let texts: Vec<String> = blocks.iter().map(|b| b.to_string()).collect();
        assert_eq!(texts, vec!["0.0.0.10/31", "0.0.0.12/31"]);
    }

    #[test]
    fn test_decompose_aligned_range_is_single_block() {
        let blocks = decompose(
            u32::from(Ipv4Addr::new(10, 0, 0, 0)),
            u32::from(Ipv4Addr::new(10, 255, 255, 255)),
        );
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_decompose_full_address_space() {
        let blocks = decompose(0, u32::MAX);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_decompose_single_address() {
        let blocks = decompose(42, 42);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].to_string(), "0.0.0.42/32");
    }

    #[test]
    fn test_decompose_empty_when_reversed() {
        assert!(decompose(10, 9).is_empty());
    }

    #[test]
    fn test_decompose_covers_exactly_without_gaps_or_overlap() {
        let cases = [
            (10, 13),
            (0, 255),
            (1, 2),
            (7, 1025),
            (u32::MAX - 9, u32::MAX),
            (
                u32::from(Ipv4Addr::new(192, 168, 0, 3)),
                u32::from(Ipv4Addr::new(192, 168, 7, 200)),
            ),
        ];

        for (start, end) in cases {
            let blocks = decompose(start, end);
            assert!(!blocks.is_empty());
            assert_eq!(blocks.first().map(AddressRange::start), Some(start));
            assert_eq!(blocks.last().map(AddressRange::end), Some(end));
            for pair in blocks.windows(2) {
                // Ascending, adjacent, no overlap.
                assert_eq!(u64::from(pair[0].end()) + 1, u64::from(pair[1].start()));
            }
        }
    }

    #[test]
    fn test_decompose_round_trips_through_parse() {
        for block in decompose(7, 1025) {
            assert_eq!(AddressRange::parse(&block.to_string()).unwrap(), block);
        }
    }
}
