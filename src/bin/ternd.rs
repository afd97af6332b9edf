use std::fs::File;
use std::io::BufReader;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tern::loader::{self, LocalResolver};
use tern::store::ByteStore;
use tern::uid::ListStore;
use tern::{CancelToken, Postings, Result, RocksStore, ShardRouter, TernError, UidAssigner, Worker};

const MIN_LRU_MB: usize = 1024;

/// One storage instance: serves the worker RPC endpoint and owns every
/// posting list whose predicate fingerprints to its shard.
#[derive(Parser, Debug)]
#[command(name = "ternd", version, about)]
struct Args {
    /// Address advertised to peers (informational).
    #[arg(long, default_value = "")]
    my: String,

    /// Address of the uid-lead instance (informational).
    #[arg(long, default_value = "")]
    zero: String,

    /// Comma-separated peer worker addresses, indexed by shard.
    #[arg(long, default_value = "")]
    workers: String,

    /// Port for internal worker communication.
    #[arg(long, default_value_t = 12345)]
    workerport: u16,

    /// Memory budget for the posting-list cache, in MB. Minimum 1024.
    #[arg(long)]
    lru_mb: usize,

    /// Directory for the posting store.
    #[arg(long, default_value = "p")]
    posting_dir: PathBuf,

    /// Directory for the mutation (write-ahead) store.
    #[arg(long, default_value = "w")]
    wal_dir: PathBuf,

    #[arg(long, default_value_t = 2000)]
    num_pending_proposals: usize,

    /// Performance hint; does not change results.
    #[arg(long, default_value_t = true)]
    expand_edge: bool,

    #[arg(long, default_value = "export")]
    export_path: PathBuf,

    /// This instance's shard index.
    #[arg(long, default_value_t = 0)]
    shard: u64,

    #[arg(long, default_value_t = 1)]
    num_shards: u64,

    /// Optional N-Quads file to live-load at startup.
    #[arg(long)]
    rdf: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn validate(args: &Args) -> Result<()> {
    if args.lru_mb < MIN_LRU_MB {
        return Err(TernError::InvalidOp(format!(
            "--lru-mb must be at least {MIN_LRU_MB}, got {}",
            args.lru_mb
        )));
    }
    let posting = args.posting_dir.canonicalize().unwrap_or_else(|_| args.posting_dir.clone());
    let wal = args.wal_dir.canonicalize().unwrap_or_else(|_| args.wal_dir.clone());
    if posting == wal {
        return Err(TernError::InvalidOp(
            "posting and wal directories cannot be the same".into(),
        ));
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    validate(&args)?;
    info!(
        my = %args.my,
        zero = %args.zero,
        shard = args.shard,
        num_shards = args.num_shards,
        num_pending_proposals = args.num_pending_proposals,
        expand_edge = args.expand_edge,
        export_path = %args.export_path.display(),
        "starting instance"
    );

    let pstore: Arc<dyn ByteStore> = Arc::new(RocksStore::open(&args.posting_dir)?);
    let mstore: Arc<dyn ByteStore> = Arc::new(RocksStore::open(&args.wal_dir)?);
    let postings = Arc::new(Postings::new(pstore, mstore, args.lru_mb));
    let assigner = Arc::new(UidAssigner::new(
        Arc::clone(&postings) as Arc<dyn ListStore>
    ));
    let router = ShardRouter::new(args.shard, args.num_shards);

    let cancel = CancelToken::new();
    let mut worker = Worker::new(Arc::clone(&postings), Arc::clone(&assigner), router);
    let peers: Vec<String> = args
        .workers
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    if peers.iter().any(|p| !p.is_empty()) {
        worker.connect(&peers, &cancel)?;
    }
    let worker = Arc::new(worker);

    let listener = TcpListener::bind(("0.0.0.0", args.workerport))?;
    let server = Arc::clone(&worker).serve(listener, cancel.clone());
    info!(port = args.workerport, "server started, clients connected");

    if let Some(path) = &args.rdf {
        let reader = BufReader::new(File::open(path)?);
        let resolver = LocalResolver {
            assigner: Arc::clone(&assigner),
            router,
        };
        let processed = loader::load_edges(reader, &postings, &resolver, router, &cancel)?;
        postings.commit_all()?;
        info!(processed, path = %path.display(), "live load complete");
    }

    server
        .join()
        .map_err(|_| TernError::FatalStore("server thread panicked".into()))?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(err) = tern::logging::init_logging(&args.log_level) {
        eprintln!("could not initialize logging: {err}");
        process::exit(1);
    }
    if let Err(err) = run(args) {
        error!(error = %err, "instance failed");
        process::exit(1);
    }
}
