//! Per-site geometry metadata and the collision-kind classification.
//!
//! The geometry loader stores one packed `u32` per site; that compact form
//! is decoded exactly once at load time into a plain [`SiteRecord`], and all
//! run-time logic works on the decoded form.

pub mod needs;

use crate::flow_error::FlowError;
use serde::{Deserialize, Serialize};

/// Number of non-rest lattice links a site has (D3Q15 minus the rest link).
pub const LINK_COUNT: u32 = 14;

const SITE_TYPE_MASK: u32 = 0x0000_0003;
const UNKNOWN_LINKS_SHIFT: u32 = 2;
const UNKNOWN_LINKS_MASK: u32 = 0x3FFF << UNKNOWN_LINKS_SHIFT;
const BOUNDARY_ID_SHIFT: u32 = 16;
const BOUNDARY_ID_MASK: u32 = 0x3FF << BOUNDARY_ID_SHIFT;

/// What a lattice site is, as far as collision dispatch cares.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SiteKind {
    Fluid,
    Inlet,
    Outlet,
}

/// Decoded per-site geometry record.
///
/// `unknown_links` has bit `l - 1` set when link `l` (1-based, the rest
/// link excluded) crosses a domain or geometry boundary, so the neighbor
/// value streaming in along it is not available.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub kind: SiteKind,
    pub boundary_id: usize,
    pub unknown_links: u16,
}

impl SiteRecord {
    /// Decode the packed storage form. Layout: bits 0–1 site type, bits
    /// 2–15 unknown-links mask, bits 16–25 boundary id.
    pub fn decode(packed: u32) -> Result<Self, FlowError> {
        let kind = match packed & SITE_TYPE_MASK {
            0 => SiteKind::Fluid,
            1 => SiteKind::Inlet,
            2 => SiteKind::Outlet,
            tag => return Err(FlowError::InvalidSiteType(tag)),
        };
        Ok(Self {
            kind,
            boundary_id: ((packed & BOUNDARY_ID_MASK) >> BOUNDARY_ID_SHIFT) as usize,
            unknown_links: ((packed & UNKNOWN_LINKS_MASK) >> UNKNOWN_LINKS_SHIFT) as u16,
        })
    }

    /// Re-encode into the packed storage form.
    pub fn encode(&self) -> u32 {
        let tag = match self.kind {
            SiteKind::Fluid => 0,
            SiteKind::Inlet => 1,
            SiteKind::Outlet => 2,
        };
        tag | ((self.unknown_links as u32) << UNKNOWN_LINKS_SHIFT)
            | ((self.boundary_id as u32) << BOUNDARY_ID_SHIFT)
    }

    pub fn unknown_link_count(&self) -> u32 {
        self.unknown_links.count_ones()
    }
}

/// The collision kernel a site is dispatched to. Selected once at setup and
/// stored as data, never re-derived per step.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CollisionKind {
    /// Plain fluid site: full equilibrium relaxation.
    BulkFluid,
    /// Wall-adjacent fluid: density-only reset, zero velocity.
    WallFluid,
    /// Inlet with few unknown links: reconstruct from density + velocity.
    InletReconstruct,
    /// Outlet with few unknown links.
    OutletReconstruct,
    /// Inlet with many unknown links: pure density reset.
    InletReset,
    /// Outlet with many unknown links.
    OutletReset,
}

/// Number of distinct collision kinds; census arrays are indexed by
/// [`CollisionKind::index`].
pub const COLLISION_KINDS: usize = 6;

impl CollisionKind {
    pub const ALL: [CollisionKind; COLLISION_KINDS] = [
        CollisionKind::BulkFluid,
        CollisionKind::WallFluid,
        CollisionKind::InletReconstruct,
        CollisionKind::OutletReconstruct,
        CollisionKind::InletReset,
        CollisionKind::OutletReset,
    ];

    pub fn index(&self) -> usize {
        match self {
            CollisionKind::BulkFluid => 0,
            CollisionKind::WallFluid => 1,
            CollisionKind::InletReconstruct => 2,
            CollisionKind::OutletReconstruct => 3,
            CollisionKind::InletReset => 4,
            CollisionKind::OutletReset => 5,
        }
    }
}

/// Accuracy/cost knob for boundary sites: up to this many unknown links the
/// boundary distribution is reconstructed from extrapolated velocity, above
/// it the site falls back to a plain density reset.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CollisionPolicy {
    pub max_reconstructed_unknowns: u32,
}

impl Default for CollisionPolicy {
    fn default() -> Self {
        Self {
            max_reconstructed_unknowns: 5,
        }
    }
}

impl CollisionPolicy {
    /// Classify a site into its collision kind.
    pub fn classify(&self, site: &SiteRecord) -> CollisionKind {
        match site.kind {
            SiteKind::Fluid => {
                if site.unknown_links == 0 {
                    CollisionKind::BulkFluid
                } else {
                    CollisionKind::WallFluid
                }
            }
            SiteKind::Inlet => {
                if site.unknown_link_count() <= self.max_reconstructed_unknowns {
                    CollisionKind::InletReconstruct
                } else {
                    CollisionKind::InletReset
                }
            }
            SiteKind::Outlet => {
                if site.unknown_link_count() <= self.max_reconstructed_unknowns {
                    CollisionKind::OutletReconstruct
                } else {
                    CollisionKind::OutletReset
                }
            }
        }
    }
}

/// Extent of the block grid partitioning the domain, in blocks per axis.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockGrid {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl BlockGrid {
    pub fn block_count(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Linear block id of a 3-D block coordinate (x-major, z fastest).
    pub fn linear(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.y + j) * self.z + k
    }

    /// Inverse of [`linear`](Self::linear).
    pub fn coords(&self, block: usize) -> (usize, usize, usize) {
        let k = block % self.z;
        let j = (block / self.z) % self.y;
        let i = block / (self.z * self.y);
        (i, j, k)
    }
}
