//! Out-of-space and limit tests

use chunk_store::{ChunkError, ChunkStore, ChunkStoreBuilder, StatsCategory, StatsReport};
use tempfile::TempDir;

/// Sixteen 60-byte chunks in memory, two 65-byte swap records on disk
fn capped_store(dir: &TempDir) -> ChunkStore {
    ChunkStoreBuilder::new()
        .region_size(256)
        .max_resident_bytes(1024)
        .max_chunk_len(252)
        .swap_path(dir.path().join("chunkswap"))
        .swap_limit_bytes(130)
        .water_marks(1.0, 1.0)
        .build()
        .unwrap()
}

fn swap_failures(store: &ChunkStore) -> u64 {
    match store.stats(StatsCategory::Summary) {
        StatsReport::Summary(summary) => summary.swap_failures,
        other => panic!("expected summary, got {other:?}"),
    }
}

#[test]
fn test_full_memory_and_swap_rejects_create() {
    let dir = TempDir::new().unwrap();
    let mut store = capped_store(&dir);

    let refs: Vec<_> = (0..18u8)
        .map(|i| store.create(&[i; 60], 0).unwrap())
        .collect();
    assert_eq!(store.num_swapped(), 2);

    let err = store.create(&[0xFF; 60], 0).unwrap_err();
    assert!(matches!(err, ChunkError::OutOfSpace { requested: 60 }));
    assert!(err.is_recoverable());
    assert!(swap_failures(&store) > 0);

    // Nothing was lost
    assert_eq!(store.len(), 18);
    for (i, r) in refs.iter().enumerate() {
        assert_eq!(store.fetch_vec(*r).unwrap(), vec![i as u8; 60]);
    }
}

#[test]
fn test_delete_makes_room_again() {
    let dir = TempDir::new().unwrap();
    let mut store = capped_store(&dir);

    let refs: Vec<_> = (0..18u8)
        .map(|i| store.create(&[i; 60], 0).unwrap())
        .collect();
    assert!(store.create(&[0xFF; 60], 0).is_err());

    store.delete(refs[17]).unwrap();
    let r = store.create(&[0xFF; 60], 0).unwrap();
    assert_eq!(store.fetch_vec(r).unwrap(), vec![0xFF; 60]);
}

#[test]
fn test_fetch_of_swapped_chunk_works_with_full_swap() {
    let dir = TempDir::new().unwrap();
    let mut store = capped_store(&dir);

    let refs: Vec<_> = (0..18u8)
        .map(|i| store.create(&[i; 60], 0).unwrap())
        .collect();
    // The two oldest were paged out; promoting them needs a colder
    // chunk to go to a swap file that is already full
    assert_eq!(store.fetch_vec(refs[0]).unwrap(), vec![0; 60]);
    assert_eq!(store.fetch_vec(refs[1]).unwrap(), vec![1; 60]);
    assert_eq!(store.num_swapped(), 2);
}

#[test]
fn test_too_long_chunk_rejected_up_front() {
    let dir = TempDir::new().unwrap();
    let mut store = capped_store(&dir);

    match store.create(&[0; 253], 0) {
        Err(ChunkError::ChunkTooLong { len, max }) => {
            assert_eq!(len, 253);
            assert_eq!(max, 252);
        }
        other => panic!("expected ChunkTooLong, got {other:?}"),
    }
    assert!(store.is_empty());
}

#[test]
fn test_largest_chunk_with_default_limits() {
    let dir = TempDir::new().unwrap();
    let mut store = ChunkStoreBuilder::new()
        .swap_path(dir.path().join("chunkswap"))
        .build()
        .unwrap();

    let data: Vec<u8> = (0..65_535u32).map(|i| (i % 251) as u8).collect();
    let r = store.create(&data, 0).unwrap();
    assert_eq!(store.length(r).unwrap(), 65_535);
    assert_eq!(store.fetch_vec(r).unwrap(), data);
    assert!(store.create(&vec![0; 65_536], 0).is_err());
}
