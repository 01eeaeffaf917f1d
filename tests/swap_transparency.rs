//! Swap transparency tests
//!
//! Callers must not be able to tell whether a chunk is resident or swapped,
//! apart from the statistics.

use chunk_store::stats::Summary;
use chunk_store::{ChunkStore, ChunkStoreBuilder, StatsCategory, StatsReport};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

/// Four 256-byte regions: sixteen 60-byte chunks fit in memory
fn paging_store(dir: &TempDir) -> ChunkStore {
    ChunkStoreBuilder::new()
        .region_size(256)
        .max_resident_bytes(1024)
        .max_chunk_len(252)
        .swap_path(dir.path().join("chunkswap"))
        .water_marks(1.0, 1.0)
        .build()
        .unwrap()
}

fn summary(store: &ChunkStore) -> Summary {
    match store.stats(StatsCategory::Summary) {
        StatsReport::Summary(summary) => summary,
        other => panic!("expected summary, got {other:?}"),
    }
}

fn paging(store: &ChunkStore) -> (u64, u64) {
    match store.stats(StatsCategory::Paging) {
        StatsReport::Paging { page_out, page_in } => (page_out, page_in),
        other => panic!("expected paging report, got {other:?}"),
    }
}

#[test]
fn test_random_access_reads_back_everything() {
    let dir = TempDir::new().unwrap();
    let mut store = paging_store(&dir);
    let mut rng = StdRng::seed_from_u64(7);

    let mut chunks: Vec<_> = (0..200)
        .map(|i| {
            let len = rng.gen_range(0..=252);
            let data: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();
            (store.create(&data, 0).unwrap(), data)
        })
        .collect();
    assert!(store.num_swapped() > 150);

    for _ in 0..3 {
        chunks.shuffle(&mut rng);
        for (r, data) in &chunks {
            assert_eq!(&store.fetch_vec(*r).unwrap(), data);
            assert_eq!(store.length(*r).unwrap() as usize, data.len());
        }
    }

    let (page_out, page_in) = paging(&store);
    assert!(page_out > 0);
    assert!(page_in > 0);
}

#[test]
fn test_hot_chunks_stay_resident() {
    let dir = TempDir::new().unwrap();
    let mut store = paging_store(&dir);

    let hot: Vec<_> = (0..8u8)
        .map(|i| store.create(&[i; 60], 0).unwrap())
        .collect();
    for _ in 0..5 {
        for r in &hot {
            store.fetch_vec(*r).unwrap();
        }
    }

    for i in 0..40u8 {
        store.create(&[100 + i; 60], 0).unwrap();
    }
    assert_eq!(store.num_swapped(), 32);

    let (_, page_in_before) = paging(&store);
    for (i, r) in hot.iter().enumerate() {
        assert_eq!(store.fetch_vec(*r).unwrap(), vec![i as u8; 60]);
    }
    let (_, page_in_after) = paging(&store);
    assert_eq!(page_in_before, page_in_after);
}

#[test]
fn test_fetched_chunk_is_paged_back_in() {
    let dir = TempDir::new().unwrap();
    let mut store = paging_store(&dir);

    let first = store.create(&[1; 60], 0).unwrap();
    for i in 0..16u8 {
        store.create(&[i; 60], 0).unwrap();
    }
    // The oldest cold chunk made room for the seventeenth
    assert_eq!(store.num_swapped(), 1);

    assert_eq!(store.fetch_vec(first).unwrap(), vec![1; 60]);
    assert_eq!(store.deref_count(first).unwrap(), 1);
    // It came back by evicting a colder chunk
    assert_eq!(store.num_swapped(), 1);
    assert_eq!(paging(&store), (2, 1));
}

#[test]
fn test_delete_releases_swap_space() {
    let dir = TempDir::new().unwrap();
    let mut store = paging_store(&dir);

    let refs: Vec<_> = (0..48u8)
        .map(|i| store.create(&[i; 60], 0).unwrap())
        .collect();
    assert!(summary(&store).swap_bytes > 0);

    for r in refs {
        store.delete(r).unwrap();
    }
    let summary = summary(&store);
    assert_eq!(summary.swapped_chunks, 0);
    assert_eq!(summary.swap_bytes, 0);
    assert_eq!(summary.used_bytes, 0);
    assert!(store.is_empty());
}

#[test]
fn test_snapshot_does_not_page_in() {
    let dir = TempDir::new().unwrap();
    let mut store = paging_store(&dir);

    let refs: Vec<_> = (0..32u8)
        .map(|i| store.create(&[i; 60], i).unwrap())
        .collect();
    let swapped = store.num_swapped();
    let before = paging(&store);

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.len(), 32);
    for (i, r) in refs.iter().enumerate() {
        assert_eq!(snapshot.get(*r).unwrap(), &[i as u8; 60][..]);
        assert_eq!(store.deref_count(*r).unwrap(), i as u8);
    }
    assert_eq!(store.num_swapped(), swapped);
    assert_eq!(paging(&store), before);
}

#[test]
fn test_summary_tracks_chunk_sizes() {
    let dir = TempDir::new().unwrap();
    let mut store = ChunkStoreBuilder::new()
        .swap_path(dir.path().join("chunkswap"))
        .build()
        .unwrap();

    store.create(&[0; 10], 0).unwrap();
    store.create(&[0; 100], 0).unwrap();
    store.create(&[0; 10_000], 255).unwrap();

    let summary = summary(&store);
    assert_eq!(summary.chunks.short.count, 1);
    assert_eq!(summary.chunks.medium.count, 1);
    assert_eq!(summary.chunks.long.count, 1);
    assert_eq!(summary.chunks.total().bytes, 10_110);
    assert_eq!(summary.maxed_chunks, 1);
    assert_eq!(summary.regions, 1);
    assert!(summary.to_string().contains("Chunks:"));
}
