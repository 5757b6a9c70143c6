use pic_index::pic::{ChunkPool, Coord, LIST_CHUNK_OVERHEAD, Layout, ListHead, SparseGrid};
use proptest::prelude::*;
use rayon::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn parallel_appends_keep_every_value(
        per_chunk in 8usize..300,
        count in 0u32..5_000,
    ) {
        let pool = ChunkPool::new("prop", LIST_CHUNK_OVERHEAD + per_chunk, 1 << 16);
        let head = ListHead::new();
        let list = head.bind(&pool, u32::MAX);

        (0..count).into_par_iter().for_each(|v| {
            list.append(v).unwrap();
        });

        let mut values: Vec<u32> = list.iter().collect();
        values.sort_unstable();
        prop_assert_eq!(values, (0..count).collect::<Vec<_>>());
        let chunks = (count as usize).div_ceil(per_chunk);
        prop_assert_eq!(list.chunk_count(), chunks);
        prop_assert_eq!(pool.stats().backed as usize, chunks);

        list.clear();
        prop_assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn deactivation_is_idempotent(points in prop::collection::vec((0i32..256, 0i32..256), 0..400)) {
        let mut grid = SparseGrid::<2>::new(Layout::new(8, 4, 8).unwrap(), 1 << 12, 8, 1 << 12).unwrap();
        for (id, &(x, y)) in points.iter().enumerate() {
            grid.activate_path(Coord([x, y])).unwrap().particles().append(id as u32).unwrap();
        }
        let backed = grid.stats().total_backed();

        grid.deactivate_all();
        let once = grid.stats();
        grid.deactivate_all();
        let twice = grid.stats();
        prop_assert_eq!(once, twice);
        prop_assert_eq!(twice.total_in_use(), 0);
        prop_assert_eq!(twice.total_backed(), backed);
        prop_assert_eq!(grid.active_leaves().count(), 0);
    }
}

#[test]
fn racing_activation_of_one_path_allocates_one_node() {
    let grid = SparseGrid::<3>::new(Layout::new(4, 4, 4).unwrap(), 1 << 20, 256, 1 << 12).unwrap();
    (0..64_000u32).into_par_iter().for_each(|id| {
        let coord = Coord([17 + (id % 3) as i32, 33, 2]);
        grid.activate_path(coord).unwrap().particles().append(id).unwrap();
    });

    let stats = grid.stats();
    assert_eq!(stats.leaves.backed, 1);
    assert_eq!(stats.mids.backed, 1);
    assert_eq!(stats.active_leaves, 1);
    let leaf = grid.leaf_for(Coord([17, 33, 2])).unwrap();
    assert_eq!(leaf.particles().len(), 64_000);
    assert_eq!(stats.lists.backed as usize, 64_000usize.div_ceil(256));
}
