//! Offline bulk loading: a map phase turning RDF files into per-shard
//! sorted spill files, and a reduce phase merging those into posting
//! lists written straight to the byte store. The output is the same
//! on-disk format the live mutation path produces.

pub mod map;
pub mod reduce;
pub mod xidmap;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::schema::{self, SchemaStore};
use crate::store::ByteStore;
use reduce::CountIndexer;
use xidmap::XidMap;

#[derive(Clone)]
pub struct BulkOptions {
    pub rdf_dir: PathBuf,
    pub schema_file: Option<PathBuf>,
    pub tmp_dir: PathBuf,
    pub lease_file: PathBuf,
    pub num_threads: usize,
    /// Per-shard spill budget for each mapper, in bytes.
    pub map_buf_size: usize,
    pub num_shards: u64,
}

pub struct BulkLoader {
    opts: BulkOptions,
    xidmap: Arc<XidMap>,
    schema: Arc<SchemaStore>,
}

impl BulkLoader {
    pub fn new(opts: BulkOptions) -> Result<Self> {
        let schema = match &opts.schema_file {
            Some(path) => SchemaStore::new(schema::parse(&fs::read_to_string(path)?)?),
            None => SchemaStore::empty(),
        };
        fs::create_dir_all(&opts.tmp_dir)?;
        Ok(BulkLoader {
            opts,
            xidmap: Arc::new(XidMap::new()),
            schema: Arc::new(schema),
        })
    }

    pub fn options(&self) -> &BulkOptions {
        &self.opts
    }

    /// Phase one: RDF -> sorted `.map` spill files plus the lease file.
    pub fn map_stage(&self) -> Result<()> {
        map::map_stage(&self.opts, &self.xidmap, &self.schema)
    }

    /// Phase two for one shard: merge its spill files into `store`, then
    /// land the count index and the schema table and sync. Idempotent
    /// against intact spill files and a fresh store.
    pub fn reduce_stage(&self, shard: u64, store: &dyn ByteStore) -> Result<u64> {
        let shard_dir = self.opts.tmp_dir.join(format!("shard_{shard}"));
        let counts = CountIndexer::new();
        let written = reduce::reduce_shard(&shard_dir, store, self.opts.num_threads, &counts)?;
        counts.write(store)?;
        self.schema.write(store)?;
        store.sync()?;
        info!(shard, keys = written, "reduce stage done");
        Ok(written)
    }
}
