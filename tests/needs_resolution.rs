//! Multi-rank tests of the block-need resolver.
//!
//! Ranks are simulated with `RayonComm` threads over the shared in-process
//! mailbox, so every test here runs `#[serial]`.

use lattice_flow::comm::RayonComm;
use lattice_flow::geometry::needs::{NeedMap, resolve_block_needs};
use proptest::prelude::*;
use serial_test::serial;

/// Run one closure per simulated rank and collect the results in rank order.
fn run_ranks<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(usize) -> R + Send + Sync + Clone + 'static,
    R: Send + 'static,
{
    RayonComm::reset_mailbox();
    let handles: Vec<_> = (0..size)
        .map(|rank| {
            let f = f.clone();
            std::thread::spawn(move || f(rank))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
#[serial]
fn two_ranks_six_blocks_two_reading_cores() {
    let maps = run_ranks(2, |rank| {
        let comm = RayonComm::new(rank, 2);
        let needs = match rank {
            0 => [true, false, true, false, true, false],
            _ => [false, true, false, true, true, false],
        };
        resolve_block_needs(&comm, &needs, 2, false).unwrap()
    });

    // Blocks 0, 2, 4 read on core 0; blocks 1, 3, 5 on core 1.
    assert_eq!(maps[0].ranks_needing(0), &[0]);
    assert_eq!(maps[0].ranks_needing(2), &[0]);
    assert_eq!(maps[0].ranks_needing(4), &[0, 1]);
    assert_eq!(maps[1].ranks_needing(1), &[1]);
    assert_eq!(maps[1].ranks_needing(3), &[1]);
    assert_eq!(maps[1].ranks_needing(5), &[] as &[usize]);
}

/// The fast resolver must agree with a directly computed need set for every
/// reading-group size from one up to the process count.
#[test]
#[serial]
fn reading_group_size_sweep_matches_direct_computation() {
    const BLOCKS: usize = 10;
    const RANKS: usize = 3;
    let need = |rank: usize, block: usize| (block + rank) % 3 == 0 || block == 7;

    for group in 1..=RANKS {
        let maps: Vec<NeedMap> = run_ranks(RANKS, move |rank| {
            let comm = RayonComm::new(rank, RANKS);
            let needs: Vec<bool> = (0..BLOCKS).map(|b| need(rank, b)).collect();
            resolve_block_needs(&comm, &needs, group, false).unwrap()
        });

        for block in 0..BLOCKS {
            let core = block % group;
            let expected: Vec<usize> = (0..RANKS).filter(|&r| need(r, block)).collect();
            assert_eq!(
                maps[core].ranks_needing(block),
                expected.as_slice(),
                "block {block}, readingGroupSize {group}"
            );
        }
    }
}

#[test]
#[serial]
fn validation_mode_does_not_alter_the_result() {
    let plain = run_ranks(2, |rank| {
        let comm = RayonComm::new(rank, 2);
        let needs = [rank == 0, true, rank == 1, false];
        resolve_block_needs(&comm, &needs, 2, false).unwrap()
    });
    let validated = run_ranks(2, |rank| {
        let comm = RayonComm::new(rank, 2);
        let needs = [rank == 0, true, rank == 1, false];
        resolve_block_needs(&comm, &needs, 2, true).unwrap()
    });
    for block in 0..4 {
        let core = block % 2;
        assert_eq!(
            plain[core].ranks_needing(block),
            validated[core].ranks_needing(block)
        );
    }
}

#[test]
#[serial]
fn non_reading_ranks_hold_empty_lists() {
    let maps = run_ranks(3, |rank| {
        let comm = RayonComm::new(rank, 3);
        let needs = [true, true];
        resolve_block_needs(&comm, &needs, 1, false).unwrap()
    });
    // Only rank 0 acts as a reading core.
    for block in 0..2 {
        assert_eq!(maps[0].ranks_needing(block), &[0, 1, 2]);
        assert_eq!(maps[1].ranks_needing(block), &[] as &[usize]);
        assert_eq!(maps[2].ranks_needing(block), &[] as &[usize]);
    }
}

proptest! {
    /// On a single rank the resolver degenerates to the need vector itself.
    #[test]
    fn single_rank_map_mirrors_need_vector(needs in proptest::collection::vec(any::<bool>(), 1..64)) {
        let map = resolve_block_needs(&lattice_flow::comm::NoComm, &needs, 1, true).unwrap();
        for (block, &needed) in needs.iter().enumerate() {
            let expected: &[usize] = if needed { &[0] } else { &[] };
            prop_assert_eq!(map.ranks_needing(block), expected);
        }
    }
}
