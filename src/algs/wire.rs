//! Fixed, little-endian wire types for the halo setup handshake.

use crate::exchange_error::ExchangeError;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Encode records for sending.
pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode a received byte run into owned records.
///
/// Received `Vec<u8>`s carry no alignment guarantee, so this copies.
pub fn decode_records<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Check a received message against its planned length.
pub fn expect_exact_len(peer: usize, actual: usize, expected: usize) -> Result<(), ExchangeError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ExchangeError::CommunicationFailure {
            peer,
            reason: format!("expected {expected} bytes, got {actual}"),
        })
    }
}

/// Number of records that follow.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    /// `None` if `n` does not fit the 32-bit wire field.
    pub fn new(n: usize) -> Option<Self> {
        let n = u32::try_from(n).ok()?;
        Some(Self { n_le: n.to_le() })
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A local element offset carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireIndex {
    pub idx_le: u64,
}

impl WireIndex {
    pub fn of(idx: usize) -> Self {
        Self {
            idx_le: (idx as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.idx_le) as usize
    }
}

const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireIndex>(), 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_unaligned_indices() {
        let v = [WireIndex::of(3), WireIndex::of(70_000)];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(cast_slice(&v));
        let out: Vec<WireIndex> = decode_records(&bytes[1..]);
        assert_eq!(out.iter().map(WireIndex::get).collect::<Vec<_>>(), [3, 70_000]);
    }

    #[test]
    fn count_is_little_endian() {
        let c = WireCount::new(0x0102).unwrap();
        assert_eq!(cast_slice(std::slice::from_ref(&c)), &[2, 1, 0, 0]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn count_beyond_u32_is_rejected() {
        assert!(WireCount::new(u32::MAX as usize).is_some());
        assert!(WireCount::new(u32::MAX as usize + 1).is_none());
    }

    #[test]
    fn length_check() {
        assert!(expect_exact_len(1, 4, 4).is_ok());
        assert!(matches!(
            expect_exact_len(1, 3, 4),
            Err(ExchangeError::CommunicationFailure { peer: 1, .. })
        ));
    }
}
