//! FlowError: unified error type for lattice-flow public APIs.
//!
//! Used for all fallible *setup* paths (topology wiring, packed-site
//! decoding, communication plumbing). Per-step physical instability is not
//! an error: it is reported through [`crate::engine::StabilityCode`].

use thiserror::Error;

/// Unified error type for lattice-flow operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A packed site word carried a type tag outside Fluid/Inlet/Outlet.
    #[error("invalid site type tag {0:#x} in packed site data")]
    InvalidSiteType(u32),
    /// The reading-group size must be at least one.
    #[error("reading group size must be non-zero")]
    InvalidReadingGroup,
    /// Send/receive index arrays for a neighbor disagree in length.
    #[error(
        "neighbor rank {rank}: send map has {send_len} entries but receive map has {recv_len}"
    )]
    IndexCardinalityMismatch {
        rank: usize,
        send_len: usize,
        recv_len: usize,
    },
    /// A neighbor's halo window lies outside the allocated exchange region.
    #[error(
        "neighbor rank {rank}: halo window at offset {offset} with {count} values exceeds halo length {halo_len}"
    )]
    HaloWindowOutOfBounds {
        rank: usize,
        offset: usize,
        count: usize,
        halo_len: usize,
    },
    /// Two neighbors' halo windows overlap.
    #[error("halo windows of ranks {first_rank} and {second_rank} overlap")]
    HaloWindowOverlap {
        first_rank: usize,
        second_rank: usize,
    },
    /// Two neighbor entries name the same remote rank.
    #[error("duplicate neighbor entry for rank {0}")]
    DuplicateNeighbor(usize),
    /// A stream-map or scatter target points outside the writable buffer.
    #[error("stream target {target} out of range for buffer of {len} values ({context})")]
    StreamTargetOutOfRange {
        target: usize,
        len: usize,
        context: &'static str,
    },
    /// An inner site's stream map routes into the halo window.
    #[error("inner site {site} streams into the halo window (slot {slot})")]
    InnerSiteRoutedToHalo { site: usize, slot: usize },
    /// A buffer handed to the engine has the wrong length.
    #[error("buffer length mismatch ({context}): expected {expected}, got {found}")]
    BufferLengthMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
    /// A communication primitive failed against a specific peer.
    #[error("communication with rank {neighbor} failed: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
