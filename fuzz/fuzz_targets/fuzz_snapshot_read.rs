#![no_main]
use chunk_store::Snapshot;
use libfuzzer_sys::fuzz_target;

// Malformed snapshot files must produce errors, not panics
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return,
    };

    let count = data.len() as u64 / 8;
    let metadata = format!(
        "{{\"created_at\":0,\"chunk_count\":{},\"payload_bytes\":0}}",
        count
    );
    if std::fs::write(dir.path().join("metadata.json"), metadata).is_err()
        || std::fs::write(dir.path().join("chunks.bin"), data).is_err()
    {
        return;
    }

    if let Ok(snapshot) = Snapshot::read_from(dir.path()) {
        assert_eq!(snapshot.len() as u64, snapshot.metadata().chunk_count);
    }
});
