use std::collections::BTreeSet;
use std::fmt;

use stackpulse_wire::AddressBitmapMsg;

use crate::address::{Address, AddressRange};

/// One bit per address over a half-open range.
///
/// The in-memory bit vector always has exactly `range.width()` entries; the
/// wire form packs them LSB-first into `max(1, ceil(width / 8))` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AddressBitmap {
    range: AddressRange,
    bits: Vec<bool>,
}

impl AddressBitmap {
    /// An all-zero bitmap over the given range.
    pub fn new(range: AddressRange) -> Self {
        AddressBitmap {
            range,
            bits: vec![false; range.width() as usize],
        }
    }

    /// The smallest bitmap covering the given addresses, with exactly those
    /// bits set. The resulting range is `[min, max + 1)`.
    pub fn from_addresses(addresses: &BTreeSet<Address>) -> Self {
        assert!(
            !addresses.is_empty(),
            "cannot build an address bitmap from an empty address set"
        );
        let begin = *addresses.iter().next().unwrap();
        let end = *addresses.iter().next_back().unwrap() + 1;
        let mut bitmap = AddressBitmap::new(AddressRange::new(begin, end));
        for address in addresses {
            bitmap.set(*address, true);
        }
        bitmap
    }

    pub fn from_message(message: &AddressBitmapMsg) -> Self {
        let range = AddressRange::new(Address::new(message.begin), Address::new(message.end));
        assert_eq!(
            message.bytes.len(),
            AddressBitmapMsg::expected_len(message.begin, message.end),
            "address bitmap payload length does not match its range width"
        );
        let mut bits = vec![false; range.width() as usize];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = message.bytes[i / 8] & (1 << (i % 8)) != 0;
        }
        AddressBitmap { range, bits }
    }

    pub fn to_message(&self) -> AddressBitmapMsg {
        let begin = self.range.begin().value();
        let end = self.range.end().value();
        let mut bytes = vec![0u8; AddressBitmapMsg::expected_len(begin, end)];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        AddressBitmapMsg { begin, end, bytes }
    }

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    pub fn get(&self, address: Address) -> bool {
        assert!(self.range.contains(address), "address outside bitmap range");
        self.bits[(address - self.range.begin()) as usize]
    }

    pub fn set(&mut self, address: Address, value: bool) {
        assert!(self.range.contains(address), "address outside bitmap range");
        self.bits[(address - self.range.begin()) as usize] = value;
    }

    /// The maximal half-open subranges whose bits all equal `value`,
    /// ascending by begin.
    pub fn contiguous_ranges(&self, value: bool) -> Vec<AddressRange> {
        let mut ranges = Vec::new();
        let mut run_begin = None;

        for (i, bit) in self.bits.iter().enumerate() {
            match (run_begin, *bit == value) {
                (None, true) => run_begin = Some(self.range.begin() + i as u64),
                (Some(begin), false) => {
                    ranges.push(AddressRange::new(begin, self.range.begin() + i as u64));
                    run_begin = None;
                }
                _ => {}
            }
        }
        if let Some(begin) = run_begin {
            ranges.push(AddressRange::new(begin, self.range.end()));
        }

        ranges
    }
}

impl fmt::Debug for AddressBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AddressBitmap({} ", self.range)?;
        for bit in &self.bits {
            write!(f, "{}", if *bit { '1' } else { '0' })?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(values: &[u64]) -> BTreeSet<Address> {
        values.iter().map(|v| Address::new(*v)).collect()
    }

    fn range(begin: u64, end: u64) -> AddressRange {
        AddressRange::new(Address::new(begin), Address::new(end))
    }

    #[test]
    fn test_construction_from_addresses() {
        let bitmap = AddressBitmap::from_addresses(&addresses(&[0x1000, 0x1001, 0x1003]));

        assert_eq!(*bitmap.range(), range(0x1000, 0x1004));
        assert_eq!(bitmap.range().width(), 4);
        assert!(bitmap.get(Address::new(0x1000)));
        assert!(bitmap.get(Address::new(0x1001)));
        assert!(!bitmap.get(Address::new(0x1002)));
        assert!(bitmap.get(Address::new(0x1003)));

        let message = bitmap.to_message();
        assert_eq!(message.bytes, vec![0x0B]);
    }

    #[test]
    fn test_contiguous_true_runs() {
        let bitmap = AddressBitmap::from_addresses(&addresses(&[0x1000, 0x1001, 0x1003]));
        assert_eq!(
            bitmap.contiguous_ranges(true),
            vec![range(0x1000, 0x1002), range(0x1003, 0x1004)]
        );
        assert_eq!(
            bitmap.contiguous_ranges(false),
            vec![range(0x1002, 0x1003)]
        );
    }

    #[test]
    fn test_empty_range_encodes_one_byte() {
        let bitmap = AddressBitmap::new(range(0x2000, 0x2000));
        let message = bitmap.to_message();
        assert_eq!(message.bytes, vec![0x00]);
        assert!(bitmap.contiguous_ranges(true).is_empty());
        assert!(bitmap.contiguous_ranges(false).is_empty());
    }

    #[test]
    fn test_message_round_trip() {
        let mut bitmap = AddressBitmap::new(range(0x400, 0x40D));
        for offset in [0u64, 1, 2, 7, 8, 12] {
            bitmap.set(Address::new(0x400) + offset, true);
        }

        let restored = AddressBitmap::from_message(&bitmap.to_message());
        assert_eq!(restored, bitmap);
        // 13 bits need 2 bytes.
        assert_eq!(bitmap.to_message().bytes.len(), 2);
    }

    #[test]
    fn test_runs_are_maximal_and_disjoint() {
        let mut bitmap = AddressBitmap::new(range(0, 16));
        for offset in [0u64, 1, 2, 5, 6, 10, 15] {
            bitmap.set(Address::new(offset), true);
        }

        let runs = bitmap.contiguous_ranges(true);
        assert_eq!(
            runs,
            vec![range(0, 3), range(5, 7), range(10, 11), range(15, 16)]
        );
        for pair in runs.windows(2) {
            assert!(!pair[0].intersects(&pair[1]));
            // Maximality: the gap between runs holds the opposite polarity.
            assert!(pair[0].end() < pair[1].begin());
        }

        // Every set bit is covered by exactly one run.
        let covered: u64 = runs.iter().map(|r| r.width()).sum();
        assert_eq!(covered, 7);
    }

    #[test]
    fn test_all_set_is_single_run() {
        let mut bitmap = AddressBitmap::new(range(0x10, 0x18));
        for offset in 0..8 {
            bitmap.set(Address::new(0x10) + offset, true);
        }
        assert_eq!(bitmap.contiguous_ranges(true), vec![range(0x10, 0x18)]);
        assert!(bitmap.contiguous_ranges(false).is_empty());
    }

    #[test]
    #[should_panic(expected = "payload length")]
    fn test_wrong_payload_length_asserts() {
        AddressBitmap::from_message(&AddressBitmapMsg {
            begin: 0x1000,
            end: 0x1010,
            bytes: vec![0xFF],
        });
    }

    #[test]
    #[should_panic(expected = "outside bitmap range")]
    fn test_get_outside_range_asserts() {
        let bitmap = AddressBitmap::new(range(0x1000, 0x1004));
        bitmap.get(Address::new(0x1004));
    }
}
