//! chunkstat
//!
//! Drives a chunk store with a synthetic attribute workload and prints its
//! statistics. Handy for sizing regions and water marks before deploying a
//! configuration.

use anyhow::{bail, Context, Result};
use chunk_store::{
    ChunkError, ChunkReference, ChunkStore, EngineKind, StatsCategory, StoreConfig,
};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chunkstat")]
#[command(about = "Run a synthetic attribute workload against a chunk store and report statistics")]
struct Args {
    /// TOML store configuration (defaults are used when omitted)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the engine (paging, pass-through)
    #[arg(short = 'e', long, value_parser = parse_engine)]
    engine: Option<EngineKind>,

    /// Override the swap file location
    #[arg(long)]
    swap_path: Option<PathBuf>,

    /// Number of workload operations
    #[arg(short = 'n', long, default_value = "100000")]
    ops: u64,

    /// Start a new aging period every this many operations
    #[arg(long, default_value = "10000")]
    period: u64,

    /// Migrate a sample of live chunks every this many operations
    #[arg(long, default_value = "2500")]
    migrate_every: u64,

    /// Random seed for the workload
    #[arg(short = 's', long, default_value = "1")]
    seed: u64,

    /// Statistics to print (summary, region-histogram, paging-histogram,
    /// freespace-histogram, regions, paging); may be repeated
    #[arg(short = 'r', long = "report", value_parser = parse_category, default_value = "summary")]
    reports: Vec<StatsCategory>,

    /// Print reports as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Export an in-process snapshot to this directory after the workload
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Export from a forked child to this directory after the workload
    #[arg(long)]
    fork_dump: Option<PathBuf>,
}

/// Parse engine kind from CLI string
fn parse_engine(s: &str) -> Result<EngineKind, String> {
    match s.to_lowercase().as_str() {
        "paging" => Ok(EngineKind::Paging),
        "pass-through" | "pass_through" | "passthrough" => Ok(EngineKind::PassThrough),
        _ => Err(format!(
            "Invalid engine '{}'. Valid options: paging, pass-through",
            s
        )),
    }
}

/// Parse stats category from CLI string
fn parse_category(s: &str) -> Result<StatsCategory, String> {
    s.to_lowercase().parse().map_err(|_| {
        let valid: Vec<&str> = StatsCategory::ALL.iter().map(|c| c.as_str()).collect();
        format!(
            "Invalid report '{}'. Valid options: {}",
            s,
            valid.join(", ")
        )
    })
}

/// Workload tallies
#[derive(Debug, Default)]
struct Tally {
    creates: u64,
    fetches: u64,
    deletes: u64,
    migrated: u64,
    evicted: u64,
    rejected: u64,
}

/// A chunk the workload created, with the byte it was filled with
struct LiveChunk {
    reference: ChunkReference,
    fill: u8,
    len: usize,
}

/// Attribute-like length: mostly short, some medium, a few long
fn chunk_len(rng: &mut StdRng, max: usize) -> usize {
    let len = match rng.gen_range(0..100) {
        0..=69 => rng.gen_range(1..64),
        70..=94 => rng.gen_range(64..2048),
        _ => rng.gen_range(2048..16384),
    };
    len.min(max)
}

/// Pick a live chunk, favouring the oldest tenth as the hot set
fn pick(rng: &mut StdRng, live: &[LiveChunk]) -> usize {
    let hot = (live.len() / 10).max(1);
    if rng.gen_bool(0.8) {
        rng.gen_range(0..hot)
    } else {
        rng.gen_range(0..live.len())
    }
}

fn run_workload(store: &mut ChunkStore, args: &Args) -> Result<Tally> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let max_len = store.config().max_chunk_len;
    let mut live: Vec<LiveChunk> = Vec::new();
    let mut tally = Tally::default();
    let mut buffer = vec![0u8; max_len];

    for op in 1..=args.ops {
        let roll = rng.gen_range(0..100);
        if roll < 35 || live.is_empty() {
            let len = chunk_len(&mut rng, max_len);
            let fill: u8 = rng.gen();
            match store.create(&vec![fill; len], 0) {
                Ok(reference) => {
                    live.push(LiveChunk { reference, fill, len });
                    tally.creates += 1;
                }
                Err(err @ ChunkError::OutOfSpace { .. }) => {
                    warn!("{}", err);
                    tally.rejected += 1;
                }
                Err(err) => return Err(err).context("create failed"),
            }
        } else if roll < 85 {
            let chunk = &live[pick(&mut rng, &live)];
            let len = store
                .fetch(chunk.reference, &mut buffer)
                .with_context(|| format!("fetch of {} failed", chunk.reference))?;
            if len != chunk.len || buffer[..len].iter().any(|&b| b != chunk.fill) {
                bail!("{} came back corrupted", chunk.reference);
            }
            tally.fetches += 1;
        } else {
            let chunk = live.swap_remove(rng.gen_range(0..live.len()));
            store.delete(chunk.reference)?;
            tally.deletes += 1;
        }

        if args.migrate_every > 0 && op % args.migrate_every == 0 && !live.is_empty() {
            let sample: Vec<ChunkReference> = (0..64)
                .map(|_| live[rng.gen_range(0..live.len())].reference)
                .collect();
            tally.migrated += store.migrate(&sample)? as u64;
        }

        if args.period > 0 && op % args.period == 0 {
            store.new_period()?;
            tally.evicted += store.consider_eviction()? as u64;
        }
    }

    Ok(tally)
}

#[cfg(unix)]
fn fork_dump(mut store: ChunkStore, dir: PathBuf) -> Result<ChunkStore> {
    use chunk_store::ForkOutcome;

    // SAFETY: chunkstat is single-threaded
    match unsafe { store.fork() }? {
        ForkOutcome::Child => {
            let code = match store
                .after_fork_in_child()
                .and_then(|child| child.export(&dir))
            {
                Ok(_) => 0,
                Err(err) => {
                    eprintln!("fork dump failed: {}", err);
                    1
                }
            };
            // SAFETY: leave without running the parent's destructors
            unsafe { libc::_exit(code) }
        }
        ForkOutcome::Parent { child_pid } => {
            let mut status = 0;
            // SAFETY: waiting on our own child
            let waited = unsafe { libc::waitpid(child_pid, &mut status, 0) };
            store.fork_done()?;
            if waited != child_pid || !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
                bail!("fork dump child {} did not finish cleanly", child_pid);
            }
            info!("Fork dump written to {:?}", dir);
            Ok(store)
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("cannot load configuration {:?}", path))?,
        None => StoreConfig::default(),
    };
    if let Some(engine) = args.engine {
        config.engine = engine;
    }
    if let Some(path) = &args.swap_path {
        config.swap_path = path.clone();
    }

    let mut store = ChunkStore::new(config).context("cannot start chunk store")?;
    info!("Running {} operations (seed {})", args.ops, args.seed);
    let tally = run_workload(&mut store, &args)?;
    info!("Workload finished: {:?}", tally);

    if let Some(dir) = &args.snapshot {
        let bytes = store.snapshot()?.write_to(dir)?;
        info!("Snapshot of {} bytes written to {:?}", bytes, dir);
    }

    if let Some(dir) = args.fork_dump.clone() {
        #[cfg(unix)]
        {
            store = fork_dump(store, dir)?;
        }
        #[cfg(not(unix))]
        bail!("--fork-dump to {:?} needs fork(), which this platform lacks", dir);
    }

    for &category in &args.reports {
        let report = store.stats(category);
        if args.json {
            println!("{}", report.to_json()?);
        } else {
            println!("{}", report);
        }
    }

    Ok(())
}
