pub mod bulk;
pub mod cancel;
pub mod codec;
pub mod conn;
pub mod error;
pub mod keys;
pub mod loader;
pub mod logging;
pub mod model;
pub mod posting;
pub mod rdf;
pub mod schema;
pub mod shard;
pub mod store;
pub mod uid;
pub mod worker;

pub use crate::cancel::CancelToken;
pub use crate::error::{Result, TernError};
pub use crate::model::{DirectedEdge, NQuad, Op, TypedValue, MAX_UID};
pub use crate::posting::{PostingList, Postings};
pub use crate::shard::ShardRouter;
pub use crate::store::{ByteStore, MemStore, RocksStore};
pub use crate::uid::UidAssigner;
pub use crate::worker::Worker;
