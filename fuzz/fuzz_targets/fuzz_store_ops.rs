#![no_main]
use chunk_store::{ChunkReference, ChunkStoreBuilder, EngineKind};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug, Arbitrary)]
enum StoreOp {
    Create { data: Vec<u8>, derefs: u8 },
    Fetch(u8),
    Delete(u8),
    Migrate(Vec<u8>),
    NewPeriod,
    RawFetch(u32),
}

// Random operation sequences against a store that swaps constantly
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let paging: bool = match u.arbitrary() {
        Ok(paging) => paging,
        Err(_) => return,
    };
    let ops: Vec<StoreOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let dir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let engine = if paging {
        EngineKind::Paging
    } else {
        EngineKind::PassThrough
    };
    let mut store = match ChunkStoreBuilder::new()
        .engine(engine)
        .region_size(256)
        .max_resident_bytes(1024)
        .max_chunk_len(252)
        .swap_path(dir.path().join("chunkswap"))
        .build()
    {
        Ok(store) => store,
        Err(_) => return,
    };

    let mut live: Vec<(ChunkReference, Vec<u8>)> = Vec::new();
    for op in ops.into_iter().take(256) {
        match op {
            StoreOp::Create { data, derefs } => {
                if let Ok(r) = store.create(&data, derefs) {
                    live.push((r, data));
                }
            }
            StoreOp::Fetch(i) if !live.is_empty() => {
                let (r, data) = &live[i as usize % live.len()];
                assert_eq!(&store.fetch_vec(*r).unwrap(), data);
            }
            StoreOp::Delete(i) if !live.is_empty() => {
                let (r, _) = live.swap_remove(i as usize % live.len());
                store.delete(r).unwrap();
            }
            StoreOp::Migrate(indices) if !live.is_empty() => {
                let refs: Vec<_> = indices
                    .iter()
                    .map(|&i| live[i as usize % live.len()].0)
                    .collect();
                store.migrate(&refs).unwrap();
            }
            StoreOp::NewPeriod => store.new_period().unwrap(),
            StoreOp::RawFetch(raw) => {
                // Forged handles must be rejected, never crash
                let r = ChunkReference::from_raw(raw);
                if !live.iter().any(|(l, _)| *l == r) {
                    assert!(store.fetch_vec(r).map_or(true, |v| v.is_empty()));
                }
            }
            _ => {}
        }
    }
    assert_eq!(store.len(), live.len());
});
