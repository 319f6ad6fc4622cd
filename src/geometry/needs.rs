//! Block-need resolution: which processes require a copy of each block.
//!
//! Every block is statically assigned a *reading core* (`block mod
//! readingGroupSize`) — the rank that will source the block from storage.
//! Each rank buckets the block ids it needs by reading core, the counts and
//! then the id lists are gathered onto each core in increasing core order,
//! and the core transposes the concatenated lists into a per-block list of
//! requesting ranks. Traffic is bounded: two small collectives per reading
//! core, once at setup, never per step.

use crate::comm::wire::{WireBlockId, WireCount, WireFlag};
use crate::comm::{CommTag, Communicator};
use crate::flow_error::FlowError;
use serde::Serialize;

/// Base tags for the three resolver exchanges; collectives burn a small tag
/// range above their base.
const COUNT_TAG: CommTag = CommTag::new(0x0100);
const IDS_TAG: CommTag = CommTag::new(0x0110);
const VALIDATE_TAG: CommTag = CommTag::new(0x0120);

/// Immutable block → requesting-ranks mapping. Populated on ranks that act
/// as a reading core; other ranks hold empty lists.
#[derive(Debug, Clone, Serialize)]
pub struct NeedMap {
    ranks_wanting: Vec<Vec<usize>>,
    reading_group_size: usize,
}

impl NeedMap {
    /// The rank responsible for sourcing `block` from storage.
    pub fn reading_core(&self, block: usize) -> usize {
        block % self.reading_group_size
    }

    /// Ranks needing a copy of `block`, in ascending rank order. Meaningful
    /// on the block's reading core.
    pub fn ranks_needing(&self, block: usize) -> &[usize] {
        &self.ranks_wanting[block]
    }

    pub fn block_count(&self) -> usize {
        self.ranks_wanting.len()
    }

    pub fn reading_group_size(&self) -> usize {
        self.reading_group_size
    }
}

/// Resolve the global need mapping for `block_count` blocks.
///
/// `needs_block[b]` says whether this rank requires block `b`. The
/// `reading_group_size` is clamped to the communicator size. With
/// `validate` set, the result is cross-checked against a brute-force
/// per-block gather; mismatches are logged as errors and do not alter the
/// result (a consistency oracle for debug runs, not a recovery path).
pub fn resolve_block_needs<C: Communicator>(
    comm: &C,
    needs_block: &[bool],
    reading_group_size: usize,
    validate: bool,
) -> Result<NeedMap, FlowError> {
    if reading_group_size == 0 {
        return Err(FlowError::InvalidReadingGroup);
    }
    let group = reading_group_size.min(comm.size());
    let block_count = needs_block.len();
    let rank = comm.rank();

    // Compile the local need vector into per-reading-core id buckets.
    let mut needed_here: Vec<Vec<WireBlockId>> = vec![Vec::new(); group];
    for (block, &needed) in needs_block.iter().enumerate() {
        if needed {
            needed_here[block % group].push(WireBlockId::of(block as u64));
        }
    }

    // Share the counts of needed blocks, one gather per reading core.
    let mut counts_here: Vec<usize> = Vec::new();
    for core in 0..group {
        let gathered = comm.gather(
            WireCount::new(needed_here[core].len()),
            core,
            COUNT_TAG,
        )?;
        if rank == core {
            counts_here = gathered
                .expect("gather returns counts on its root")
                .iter()
                .map(WireCount::get)
                .collect();
        }
    }

    // Communicate the actual block-id lists.
    let mut ids_here: Vec<WireBlockId> = Vec::new();
    for core in 0..group {
        let counts = (rank == core).then_some(counts_here.as_slice());
        let gathered = comm.gather_v(&needed_here[core], counts, core, IDS_TAG)?;
        if rank == core {
            ids_here = gathered.expect("gather_v returns ids on its root");
        }
    }

    // Transpose the flat sender-major list into block → requesting ranks.
    // The source rank of each run is implicit from the gathered counts.
    let mut ranks_wanting: Vec<Vec<usize>> = vec![Vec::new(); block_count];
    if rank < group {
        let mut cursor = ids_here.iter();
        for (sender, &count) in counts_here.iter().enumerate() {
            for id in cursor.by_ref().take(count) {
                ranks_wanting[id.get() as usize].push(sender);
            }
        }
        log::debug!(
            "rank {rank}: need map built for {} blocks ({} requests)",
            block_count,
            ids_here.len()
        );
    }

    let map = NeedMap {
        ranks_wanting,
        reading_group_size: group,
    };

    if validate {
        validate_against_brute_force(comm, needs_block, &map)?;
    }

    Ok(map)
}

/// One disagreement between the fast need map and the brute-force flags.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NeedMismatch {
    /// The map lists this rank but its flag denies the need.
    ListedButNotNeeded { rank: usize },
    /// This rank's flag claims the need but the map does not list it.
    NeededButNotListed { rank: usize },
}

/// Membership cross-check for one block.
///
/// The two checks are deliberately asymmetric, matching long-standing
/// behavior: a rank the map lists but the flags deny is always reported; a
/// rank the flags claim but the map misses is reported unless it is the
/// reading core itself.
fn cross_check(listed: &[usize], flags: &[bool], core: usize) -> Vec<NeedMismatch> {
    let mut out = Vec::new();
    for (rank, &flag) in flags.iter().enumerate() {
        let found = listed.contains(&rank);
        if found && !flag {
            out.push(NeedMismatch::ListedButNotNeeded { rank });
        }
        if !found && flag && rank != core {
            out.push(NeedMismatch::NeededButNotListed { rank });
        }
    }
    out
}

/// Brute-force oracle: gather every rank's 0/1 need flag for every block
/// onto the block's reading core and cross-check membership both ways.
fn validate_against_brute_force<C: Communicator>(
    comm: &C,
    needs_block: &[bool],
    map: &NeedMap,
) -> Result<(), FlowError> {
    let rank = comm.rank();
    for (block, &needed) in needs_block.iter().enumerate() {
        let core = map.reading_core(block);
        let flags = comm.gather(WireFlag::of(needed), core, VALIDATE_TAG)?;
        if rank != core {
            continue;
        }
        let flags: Vec<bool> = flags
            .expect("gather returns flags on its root")
            .iter()
            .map(WireFlag::get)
            .collect();
        for mismatch in cross_check(map.ranks_needing(block), &flags, core) {
            match mismatch {
                NeedMismatch::ListedButNotNeeded { rank } => log::error!(
                    "need map lists rank {rank} for block {block}, but that rank does not need it"
                ),
                NeedMismatch::NeededButNotListed { rank } => log::error!(
                    "rank {rank} needs block {block}, but the need map does not list it"
                ),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    #[test]
    fn single_rank_needs_map_is_local() {
        let needs = [true, false, true, true];
        let map = resolve_block_needs(&NoComm, &needs, 1, false).unwrap();
        assert_eq!(map.ranks_needing(0), &[0]);
        assert_eq!(map.ranks_needing(1), &[] as &[usize]);
        assert_eq!(map.ranks_needing(2), &[0]);
        assert_eq!(map.ranks_needing(3), &[0]);
    }

    #[test]
    fn zero_group_size_is_a_setup_error() {
        let err = resolve_block_needs(&NoComm, &[true], 0, false).unwrap_err();
        assert!(matches!(err, FlowError::InvalidReadingGroup));
    }

    #[test]
    fn group_size_is_clamped_to_world() {
        // Asking for a reading group larger than the world must behave as
        // group == world size, not address absent ranks.
        let needs = [true, true, true];
        let map = resolve_block_needs(&NoComm, &needs, 8, false).unwrap();
        assert_eq!(map.reading_group_size(), 1);
        for block in 0..3 {
            assert_eq!(map.reading_core(block), 0);
            assert_eq!(map.ranks_needing(block), &[0]);
        }
    }

    #[test]
    fn validation_mode_accepts_a_consistent_map() {
        let needs = [true, false];
        let map = resolve_block_needs(&NoComm, &needs, 1, true).unwrap();
        assert_eq!(map.ranks_needing(0), &[0]);
    }

    #[test]
    fn cross_check_reports_listed_but_not_needed() {
        // Rank 2 appears in the map but its flag denies the need; the
        // reading core gets no exemption on this side of the check.
        let mismatches = cross_check(&[1, 2], &[false, true, false], 2);
        assert_eq!(
            mismatches,
            vec![NeedMismatch::ListedButNotNeeded { rank: 2 }]
        );
    }

    #[test]
    fn cross_check_reports_needed_but_not_listed() {
        let mismatches = cross_check(&[1], &[false, true, true], 0);
        assert_eq!(
            mismatches,
            vec![NeedMismatch::NeededButNotListed { rank: 2 }]
        );
    }

    #[test]
    fn cross_check_exempts_the_reading_core_from_the_missing_check() {
        // Rank 0 is the reading core: its own unlisted need is not flagged.
        let mismatches = cross_check(&[1], &[true, true, false], 0);
        assert!(mismatches.is_empty());
    }
}
