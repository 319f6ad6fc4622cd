//! Neighbor bookkeeping consumed by the cycle engine.
//!
//! The topology builder (an external collaborator: its dominant cost is
//! one-time geometry bookkeeping) hands the engine a [`Topology`]: the site
//! ordering census, one [`NeighborSpec`] per neighboring rank, and the
//! stream map routing every post-collision value to its destination slot.
//! Its output contract is a hard invariant the engine depends on, so
//! construction validates it and fails fast before any step runs.
//!
//! Buffer layout, shared with the engine: each distribution buffer holds
//! `site_count * Q` local values followed by a halo region of
//! `sum(neighbor counts)` values. Each neighbor owns a contiguous window of
//! that region. Boundary-site collisions write through the stream map
//! straight into the windows of the *writable* buffer (packing is implicit
//! in the map); receives land in the same windows of the *readable* buffer
//! and are scattered from there.

use crate::comm::wire::{WireCount, cast_slice, decode_slice};
use crate::comm::{CommTag, Communicator, Wait};
use crate::flow_error::FlowError;
use crate::geometry::{COLLISION_KINDS, CollisionKind};
use crate::lattice::Q;
use itertools::Itertools;
use serde::Serialize;
use std::ops::Range;

const PAIRWISE_TAG: CommTag = CommTag::new(0x0200);

/// Everything needed to exchange halo data with one neighboring rank.
///
/// `send_sources[k]` is the local f-index whose post-collision value fills
/// slot `k` of this neighbor's window; `recv_targets[k]` is the local
/// f-index into which slot `k` of the incoming window is scattered. The two
/// arrays have the same length on both ends of the pair (checked here
/// locally, and across the pair by [`Topology::validate_pairwise`]).
#[derive(Debug, Clone, Serialize)]
pub struct NeighborSpec {
    pub rank: usize,
    /// Start of this neighbor's window, relative to the halo base.
    pub offset: usize,
    pub send_sources: Vec<usize>,
    pub recv_targets: Vec<usize>,
}

impl NeighborSpec {
    /// Number of distribution values exchanged with this neighbor per step.
    pub fn count(&self) -> usize {
        self.send_sources.len()
    }

    pub fn window(&self) -> Range<usize> {
        self.offset..self.offset + self.count()
    }
}

/// Site-index layout fixed at setup: inner sites first, then inter
/// (boundary) sites, each group contiguous and sub-grouped by collision
/// kind in [`CollisionKind::ALL`] order.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SiteOrdering {
    pub inner_counts: [usize; COLLISION_KINDS],
    pub inter_counts: [usize; COLLISION_KINDS],
}

impl SiteOrdering {
    pub fn inner_total(&self) -> usize {
        self.inner_counts.iter().sum()
    }

    pub fn inter_total(&self) -> usize {
        self.inter_counts.iter().sum()
    }

    pub fn total(&self) -> usize {
        self.inner_total() + self.inter_total()
    }

    /// Contiguous site ranges of the inner group, one per collision kind.
    pub fn inner_ranges(&self) -> impl Iterator<Item = (CollisionKind, Range<usize>)> + '_ {
        Self::ranges_from(0, &self.inner_counts)
    }

    /// Contiguous site ranges of the inter group, one per collision kind.
    pub fn inter_ranges(&self) -> impl Iterator<Item = (CollisionKind, Range<usize>)> + '_ {
        Self::ranges_from(self.inner_total(), &self.inter_counts)
    }

    fn ranges_from(
        start: usize,
        counts: &[usize; COLLISION_KINDS],
    ) -> impl Iterator<Item = (CollisionKind, Range<usize>)> + '_ {
        CollisionKind::ALL.into_iter().scan(start, move |cursor, kind| {
            let begin = *cursor;
            *cursor += counts[kind.index()];
            Some((kind, begin..*cursor))
        })
    }
}

/// Validated neighbor topology plus the stream map.
#[derive(Debug, Clone)]
pub struct Topology {
    ordering: SiteOrdering,
    neighbors: Vec<NeighborSpec>,
    stream_map: Vec<usize>,
    halo_len: usize,
}

impl Topology {
    /// Build and validate a topology. `stream_map` must have one entry per
    /// local f-value (`site_count * Q`), each a destination slot in the
    /// writable buffer — a local slot, or a halo-window slot for values
    /// bound for a neighbor.
    pub fn new(
        ordering: SiteOrdering,
        neighbors: Vec<NeighborSpec>,
        stream_map: Vec<usize>,
    ) -> Result<Self, FlowError> {
        let site_count = ordering.total();
        let local_len = site_count * Q;
        let halo_len = neighbors.iter().map(NeighborSpec::count).sum();

        if stream_map.len() != local_len {
            return Err(FlowError::BufferLengthMismatch {
                context: "stream map",
                expected: local_len,
                found: stream_map.len(),
            });
        }

        for pair in neighbors.iter().sorted_by_key(|n| n.rank).tuple_windows() {
            let (a, b): (&NeighborSpec, &NeighborSpec) = pair;
            if a.rank == b.rank {
                return Err(FlowError::DuplicateNeighbor(a.rank));
            }
        }

        for n in &neighbors {
            if n.send_sources.len() != n.recv_targets.len() {
                return Err(FlowError::IndexCardinalityMismatch {
                    rank: n.rank,
                    send_len: n.send_sources.len(),
                    recv_len: n.recv_targets.len(),
                });
            }
            if n.offset + n.count() > halo_len {
                return Err(FlowError::HaloWindowOutOfBounds {
                    rank: n.rank,
                    offset: n.offset,
                    count: n.count(),
                    halo_len,
                });
            }
            for &src in &n.send_sources {
                if src >= local_len {
                    return Err(FlowError::StreamTargetOutOfRange {
                        target: src,
                        len: local_len,
                        context: "send source",
                    });
                }
            }
            // Receives scatter into real sites, never back into the halo.
            for &dst in &n.recv_targets {
                if dst >= local_len {
                    return Err(FlowError::StreamTargetOutOfRange {
                        target: dst,
                        len: local_len,
                        context: "receive target",
                    });
                }
            }
        }

        // Windows must not overlap.
        for pair in neighbors
            .iter()
            .sorted_by_key(|n| n.offset)
            .tuple_windows()
        {
            let (a, b): (&NeighborSpec, &NeighborSpec) = pair;
            if a.window().end > b.window().start {
                return Err(FlowError::HaloWindowOverlap {
                    first_rank: a.rank,
                    second_rank: b.rank,
                });
            }
        }

        let buffer_len = local_len + halo_len;
        for (slot, &target) in stream_map.iter().enumerate() {
            if target >= buffer_len {
                return Err(FlowError::StreamTargetOutOfRange {
                    target,
                    len: buffer_len,
                    context: "stream map",
                });
            }
            let site = slot / Q;
            if site < ordering.inner_total() && target >= local_len {
                return Err(FlowError::InnerSiteRoutedToHalo { site, slot });
            }
        }

        Ok(Self {
            ordering,
            neighbors,
            stream_map,
            halo_len,
        })
    }

    /// Topology of a run with no neighbors (single process, or an interior
    /// partition with no remote contact).
    pub fn serial(ordering: SiteOrdering, stream_map: Vec<usize>) -> Result<Self, FlowError> {
        Self::new(ordering, Vec::new(), stream_map)
    }

    pub fn ordering(&self) -> &SiteOrdering {
        &self.ordering
    }

    pub fn neighbors(&self) -> &[NeighborSpec] {
        &self.neighbors
    }

    pub fn stream_map(&self) -> &[usize] {
        &self.stream_map
    }

    pub fn site_count(&self) -> usize {
        self.ordering.total()
    }

    pub fn halo_len(&self) -> usize {
        self.halo_len
    }

    /// Length of each distribution buffer: local values plus halo region.
    pub fn buffer_len(&self) -> usize {
        self.site_count() * Q + self.halo_len
    }

    /// Absolute buffer index of the first slot of a neighbor's window.
    pub fn halo_base(&self, spec: &NeighborSpec) -> usize {
        self.site_count() * Q + spec.offset
    }

    /// Cross-check exchange cardinalities with every neighbor: my send
    /// count must equal the partner's receive count and vice versa. Any
    /// mismatch is a setup defect reported before the first step.
    pub fn validate_pairwise<C: Communicator>(&self, comm: &C) -> Result<(), FlowError> {
        if self.neighbors.is_empty() {
            return Ok(());
        }
        let mut pending = Vec::with_capacity(self.neighbors.len());
        for n in &self.neighbors {
            let mut buf = vec![0u8; 2 * std::mem::size_of::<WireCount>()];
            let h = comm.irecv(n.rank, PAIRWISE_TAG.as_u16(), &mut buf);
            pending.push((n, h));
        }
        let mine: Vec<[WireCount; 2]> = self
            .neighbors
            .iter()
            .map(|n| [WireCount::new(n.send_sources.len()), WireCount::new(n.recv_targets.len())])
            .collect();
        for (n, counts) in self.neighbors.iter().zip(&mine) {
            let s = comm.isend(n.rank, PAIRWISE_TAG.as_u16(), cast_slice(&counts[..]));
            let _ = s.wait();
        }
        for (n, h) in pending {
            let data = h.wait().ok_or_else(|| FlowError::CommError {
                neighbor: n.rank,
                source: format!("failed to exchange index cardinalities with rank {}", n.rank)
                    .into(),
            })?;
            let theirs: Vec<WireCount> = decode_slice(&data);
            let (their_send, their_recv) = (theirs[0].get(), theirs[1].get());
            if n.send_sources.len() != their_recv || n.recv_targets.len() != their_send {
                return Err(FlowError::IndexCardinalityMismatch {
                    rank: n.rank,
                    send_len: n.send_sources.len(),
                    recv_len: their_recv,
                });
            }
        }
        log::debug!(
            "rank {}: pairwise index cardinalities verified for {} neighbors",
            comm.rank(),
            self.neighbors.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_ordering(inner: usize, inter: usize) -> SiteOrdering {
        let mut ordering = SiteOrdering::default();
        ordering.inner_counts[0] = inner;
        ordering.inter_counts[0] = inter;
        ordering
    }

    fn identity_map(sites: usize) -> Vec<usize> {
        (0..sites * Q).collect()
    }

    #[test]
    fn ranges_walk_the_census_in_kind_order() {
        let mut ordering = SiteOrdering::default();
        ordering.inner_counts[0] = 3;
        ordering.inner_counts[2] = 2;
        ordering.inter_counts[0] = 1;
        let inner: Vec<_> = ordering.inner_ranges().collect();
        assert_eq!(inner[0], (CollisionKind::BulkFluid, 0..3));
        assert_eq!(inner[2], (CollisionKind::InletReconstruct, 3..5));
        let inter: Vec<_> = ordering.inter_ranges().collect();
        assert_eq!(inter[0], (CollisionKind::BulkFluid, 5..6));
        assert_eq!(ordering.total(), 6);
    }

    #[test]
    fn serial_topology_has_no_halo() {
        let topo = Topology::serial(bulk_ordering(4, 0), identity_map(4)).unwrap();
        assert_eq!(topo.halo_len(), 0);
        assert_eq!(topo.buffer_len(), 4 * Q);
    }

    #[test]
    fn cardinality_mismatch_is_fatal_at_setup() {
        let ordering = bulk_ordering(1, 1);
        let spec = NeighborSpec {
            rank: 1,
            offset: 0,
            send_sources: vec![Q, Q + 1],
            recv_targets: vec![Q],
        };
        let err = Topology::new(ordering, vec![spec], identity_map(2)).unwrap_err();
        assert!(matches!(
            err,
            FlowError::IndexCardinalityMismatch {
                rank: 1,
                send_len: 2,
                recv_len: 1,
            }
        ));
    }

    #[test]
    fn inner_site_may_not_stream_into_halo() {
        let ordering = bulk_ordering(1, 1);
        let spec = NeighborSpec {
            rank: 1,
            offset: 0,
            send_sources: vec![Q + 1],
            recv_targets: vec![Q + 2],
        };
        let mut map = identity_map(2);
        map[0] = 2 * Q; // inner site 0 routed into the halo window
        let err = Topology::new(ordering, vec![spec], map).unwrap_err();
        assert!(matches!(
            err,
            FlowError::InnerSiteRoutedToHalo { site: 0, slot: 0 }
        ));
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let ordering = bulk_ordering(0, 2);
        let mk = |rank, offset| NeighborSpec {
            rank,
            offset,
            send_sources: vec![0, 1],
            recv_targets: vec![2, 3],
        };
        let err = Topology::new(ordering, vec![mk(1, 0), mk(2, 1)], identity_map(2)).unwrap_err();
        assert!(matches!(err, FlowError::HaloWindowOverlap { .. }));
    }

    #[test]
    fn duplicate_neighbor_rank_is_rejected() {
        let ordering = bulk_ordering(0, 2);
        let mk = |offset| NeighborSpec {
            rank: 1,
            offset,
            send_sources: vec![0],
            recv_targets: vec![1],
        };
        let err = Topology::new(ordering, vec![mk(0), mk(1)], identity_map(2)).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateNeighbor(1)));
    }

    #[test]
    fn stream_target_bounds_are_checked() {
        let ordering = bulk_ordering(1, 0);
        let mut map = identity_map(1);
        map[3] = Q; // no halo on a serial topology, so Q is out of range
        let err = Topology::serial(ordering, map).unwrap_err();
        assert!(matches!(
            err,
            FlowError::StreamTargetOutOfRange {
                target: 15,
                context: "stream map",
                ..
            }
        ));
    }
}
