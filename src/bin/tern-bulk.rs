use std::path::PathBuf;
use std::process;
use std::thread;

use clap::Parser;
use tracing::{error, info};

use tern::bulk::{BulkLoader, BulkOptions};
use tern::{Result, RocksStore};

/// Offline map/reduce loader: ingests a directory of `.rdf` / `.rdf.gz`
/// files and bulk-builds the byte store the instances serve from.
#[derive(Parser, Debug)]
#[command(name = "tern-bulk", version, about)]
struct Args {
    /// Directory of input RDF files.
    #[arg(long)]
    rdf_dir: PathBuf,

    /// Optional schema file with typed predicates and directives.
    #[arg(long)]
    schema_file: Option<PathBuf>,

    /// Output directory; one store per shard lands under it.
    #[arg(long)]
    out_dir: PathBuf,

    /// Lease file; defaults to <out-dir>/LEASE.
    #[arg(long)]
    lease_file: Option<PathBuf>,

    /// Spill directory; defaults to <out-dir>/tmp.
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Worker pool size; defaults to the CPU count.
    #[arg(long)]
    num_threads: Option<usize>,

    /// Per-shard mapper buffer budget before a sorted run is spilled.
    #[arg(long, default_value_t = 64)]
    map_buf_size_mb: usize,

    #[arg(long, default_value_t = 1)]
    num_shards: u64,

    /// Skip the map phase and reduce existing .map files (rerun after a
    /// crash between phases).
    #[arg(long)]
    skip_map: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run(args: Args) -> Result<()> {
    let num_threads = args.num_threads.unwrap_or_else(|| {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    });
    let opts = BulkOptions {
        rdf_dir: args.rdf_dir,
        schema_file: args.schema_file,
        tmp_dir: args.tmp_dir.unwrap_or_else(|| args.out_dir.join("tmp")),
        lease_file: args.lease_file.unwrap_or_else(|| args.out_dir.join("LEASE")),
        num_threads,
        map_buf_size: args.map_buf_size_mb << 20,
        num_shards: args.num_shards,
    };
    let num_shards = opts.num_shards;
    let out_dir = args.out_dir;
    let loader = BulkLoader::new(opts)?;

    if args.skip_map {
        info!("skipping map phase, reducing existing spill files");
    } else {
        loader.map_stage()?;
    }

    for shard in 0..num_shards {
        let dir = if num_shards == 1 {
            out_dir.join("p")
        } else {
            out_dir.join(format!("p{shard}"))
        };
        std::fs::create_dir_all(&dir)?;
        let store = RocksStore::open_bulk(&dir)?;
        let written = loader.reduce_stage(shard, &store)?;
        info!(shard, keys = written, dir = %dir.display(), "shard store built");
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(err) = tern::logging::init_logging(&args.log_level) {
        eprintln!("could not initialize logging: {err}");
        process::exit(1);
    }
    if let Err(err) = run(args) {
        error!(error = %err, "bulk load failed");
        process::exit(1);
    }
}
