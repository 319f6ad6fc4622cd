//! Fixed little-endian wire records for setup-time exchanges.
//!
//! Everything the block-need resolver and topology glue put on the wire
//! outside the per-step f-value halo goes through these Pod structs, so the
//! byte layout is pinned regardless of host endianness.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode a received byte buffer into records. Copies: receive buffers are
/// plain `Vec<u8>` and carry no alignment guarantee.
pub fn decode_slice<T: Pod>(v: &[u8]) -> Vec<T> {
    bytemuck::pod_collect_to_vec(v)
}

/// Count of records that follow (never a usize on the wire).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    n_le: u32,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A global block id carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireBlockId {
    id_le: u64,
}
impl WireBlockId {
    pub fn of(id: u64) -> Self {
        Self { id_le: id.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.id_le)
    }
}

/// A 0/1 flag (validation-mode need bit).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireFlag {
    v_le: u32,
}
impl WireFlag {
    pub fn of(v: bool) -> Self {
        Self {
            v_le: (v as u32).to_le(),
        }
    }
    pub fn get(&self) -> bool {
        u32::from_le(self.v_le) != 0
    }
}

/// An f64 in IEEE-754 bit form, little-endian.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireScalar {
    bits_le: u64,
}
impl WireScalar {
    pub fn of(v: f64) -> Self {
        Self {
            bits_le: v.to_bits().to_le(),
        }
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(u64::from_le(self.bits_le))
    }
}

const_assert_eq!(std::mem::size_of::<WireCount>(), 4);
const_assert_eq!(std::mem::size_of::<WireBlockId>(), 8);
const_assert_eq!(std::mem::size_of::<WireFlag>(), 4);
const_assert_eq!(std::mem::size_of::<WireScalar>(), 8);
