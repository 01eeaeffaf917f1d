//! Property-based tests for store correctness
//!
//! Runs random operation sequences against both engines with a tiny memory
//! budget (so the paging engine swaps constantly) and checks every result
//! against a plain map.

use chunk_store::{ChunkError, ChunkReference, ChunkStore, ChunkStoreBuilder, EngineKind};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Create { len: usize, byte: u8, derefs: u8 },
    Fetch(usize),
    Length(usize),
    Delete(usize),
    Migrate(Vec<usize>),
    NewPeriod,
    Evict,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..=252, any::<u8>(), any::<u8>())
            .prop_map(|(len, byte, derefs)| Op::Create { len, byte, derefs }),
        4 => any::<usize>().prop_map(Op::Fetch),
        1 => any::<usize>().prop_map(Op::Length),
        2 => any::<usize>().prop_map(Op::Delete),
        1 => prop::collection::vec(any::<usize>(), 1..8).prop_map(Op::Migrate),
        1 => Just(Op::NewPeriod),
        1 => Just(Op::Evict),
    ]
}

fn tiny_store(dir: &TempDir, engine: EngineKind) -> ChunkStore {
    ChunkStoreBuilder::new()
        .engine(engine)
        .region_size(256)
        .max_resident_bytes(1024)
        .max_chunk_len(252)
        .swap_path(dir.path().join("chunkswap"))
        .water_marks(0.9, 0.6)
        .build()
        .unwrap()
}

fn pick(model: &BTreeMap<ChunkReference, Vec<u8>>, i: usize) -> Option<ChunkReference> {
    if model.is_empty() {
        None
    } else {
        model.keys().nth(i % model.len()).copied()
    }
}

fn run_ops(engine: EngineKind, ops: &[Op]) -> Result<(), TestCaseError> {
    let dir = TempDir::new().unwrap();
    let mut store = tiny_store(&dir, engine);
    let mut model: BTreeMap<ChunkReference, Vec<u8>> = BTreeMap::new();
    let mut dead: Vec<ChunkReference> = Vec::new();

    for op in ops {
        match op {
            Op::Create { len, byte, derefs } => {
                let data = vec![*byte; *len];
                let r = store.create(&data, *derefs).unwrap();
                prop_assert!(!r.is_null());
                prop_assert!(!model.contains_key(&r), "{} handed out twice", r);
                prop_assert_eq!(store.deref_count(r).unwrap(), *derefs);
                model.insert(r, data);
            }
            Op::Fetch(i) => {
                if let Some(r) = pick(&model, *i) {
                    let before = store.deref_count(r).unwrap();
                    prop_assert_eq!(&store.fetch_vec(r).unwrap(), &model[&r]);
                    prop_assert_eq!(store.deref_count(r).unwrap(), before.saturating_add(1));
                }
            }
            Op::Length(i) => {
                if let Some(r) = pick(&model, *i) {
                    prop_assert_eq!(store.length(r).unwrap() as usize, model[&r].len());
                }
            }
            Op::Delete(i) => {
                if let Some(r) = pick(&model, *i) {
                    store.delete(r).unwrap();
                    model.remove(&r);
                    dead.push(r);
                }
            }
            Op::Migrate(indices) => {
                let refs: Vec<ChunkReference> =
                    indices.iter().filter_map(|&i| pick(&model, i)).collect();
                store.migrate(&refs).unwrap();
            }
            Op::NewPeriod => store.new_period().unwrap(),
            Op::Evict => {
                store.consider_eviction().unwrap();
            }
        }
        prop_assert_eq!(store.len(), model.len());
        prop_assert!(store.num_swapped() <= model.len());
    }

    // Everything still reads back, whether resident or swapped
    for (r, data) in &model {
        let mut buffer = vec![0u8; 252];
        let len = store.fetch(*r, &mut buffer).unwrap();
        prop_assert_eq!(&buffer[..len], &data[..]);
    }
    prop_assert_eq!(store.references(), model.keys().copied().collect::<Vec<_>>());

    // Handles of deleted chunks never come back to life
    let live: HashSet<ChunkReference> = model.keys().copied().collect();
    for r in dead.iter().filter(|r| !live.contains(r)) {
        prop_assert!(matches!(
            store.fetch_vec(*r),
            Err(ChunkError::InvalidReference(_))
        ));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_paging_matches_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        run_ops(EngineKind::Paging, &ops)?;
    }

    #[test]
    fn prop_pass_through_matches_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        run_ops(EngineKind::PassThrough, &ops)?;
    }

    #[test]
    fn prop_new_period_halves_every_counter(
        derefs in prop::collection::vec(any::<u8>(), 1..40)
    ) {
        let dir = TempDir::new().unwrap();
        let mut store = tiny_store(&dir, EngineKind::Paging);
        let refs: Vec<_> = derefs
            .iter()
            .map(|&d| store.create(&[d; 40], d).unwrap())
            .collect();

        store.new_period().unwrap();
        for (r, d) in refs.iter().zip(&derefs) {
            prop_assert_eq!(store.deref_count(*r).unwrap(), d / 2);
        }
    }
}
