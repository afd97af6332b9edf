//! The posting-list engine: lazy per-key lists, a striped LRU cache with
//! a byte budget, and commit fan-out.

mod list;

pub use list::PostingList;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::shard::fingerprint64;
use crate::store::ByteStore;

const STRIPES: usize = 32;

struct Stripe {
    lists: Mutex<LruCache<Vec<u8>, Arc<PostingList>>>,
}

/// Handle to every live posting list of one instance. Lookup is striped;
/// list contents are guarded by each list's own lock.
pub struct Postings {
    pstore: Arc<dyn ByteStore>,
    mstore: Arc<dyn ByteStore>,
    stripes: Vec<Stripe>,
    /// Byte budget for cached lists; 0 disables eviction.
    budget: usize,
    used: AtomicUsize,
}

impl Postings {
    pub fn new(pstore: Arc<dyn ByteStore>, mstore: Arc<dyn ByteStore>, lru_mb: usize) -> Self {
        let stripes = (0..STRIPES)
            .map(|_| Stripe {
                lists: Mutex::new(LruCache::unbounded()),
            })
            .collect();
        Postings {
            pstore,
            mstore,
            stripes,
            budget: lru_mb * (1 << 20),
            used: AtomicUsize::new(0),
        }
    }

    /// Returns the cached list for `key`, loading it from the byte store
    /// on first reference.
    pub fn get_or_create(&self, key: &[u8]) -> Arc<PostingList> {
        let at = (fingerprint64(key) as usize) % STRIPES;
        let stripe = &self.stripes[at];
        {
            let mut cache = stripe.lists.lock();
            if let Some(list) = cache.get(key) {
                return Arc::clone(list);
            }
            let list = PostingList::open(
                key.to_vec(),
                Arc::clone(&self.pstore),
                Arc::clone(&self.mstore),
            );
            self.used.fetch_add(list.approx_size(), Ordering::Relaxed);
            cache.put(key.to_vec(), Arc::clone(&list));
            drop(cache);
            self.maybe_evict(at);
            list
        }
    }

    /// Evicts least-recently-used clean lists until the budget holds.
    /// Dirty lists are pinned; each stripe lock is held only while that
    /// stripe is inspected.
    fn maybe_evict(&self, start: usize) {
        if self.budget == 0 {
            return;
        }
        for step in 0..STRIPES {
            if self.used.load(Ordering::Relaxed) <= self.budget {
                return;
            }
            let stripe = &self.stripes[(start + step) % STRIPES];
            let mut cache = stripe.lists.lock();
            let mut pinned = Vec::new();
            while self.used.load(Ordering::Relaxed) > self.budget {
                match cache.pop_lru() {
                    Some((key, list)) if list.is_dirty() => pinned.push((key, list)),
                    Some((_, list)) => {
                        let size = list.approx_size();
                        let _ = self.used.fetch_update(
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                            |used| Some(used.saturating_sub(size)),
                        );
                        debug!(bytes = size, "evicted clean posting list");
                    }
                    None => break,
                }
            }
            // Re-insert pinned entries in popped (least-recent-first)
            // order so their relative recency survives.
            for (key, list) in pinned {
                cache.put(key, list);
            }
        }
    }

    /// Commits every dirty cached list. Used at shutdown and by the live
    /// loader's periodic flush.
    pub fn commit_all(&self) -> Result<()> {
        for stripe in &self.stripes {
            let lists: Vec<Arc<PostingList>> = {
                let cache = stripe.lists.lock();
                cache.iter().map(|(_, l)| Arc::clone(l)).collect()
            };
            for list in lists {
                list.commit_if_dirty()?;
            }
        }
        Ok(())
    }

    pub fn cached_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn cached_lists(&self) -> usize {
        self.stripes.iter().map(|s| s.lists.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DirectedEdge, Op};
    use crate::store::MemStore;

    fn engine(lru_mb: usize) -> Postings {
        Postings::new(
            Arc::new(MemStore::new()) as Arc<dyn ByteStore>,
            Arc::new(MemStore::new()) as Arc<dyn ByteStore>,
            lru_mb,
        )
    }

    #[test]
    fn get_or_create_returns_the_same_list() {
        let postings = engine(0);
        let a = postings.get_or_create(b"key");
        let b = postings.get_or_create(b"key");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn commit_all_flushes_dirty_lists() {
        let postings = engine(0);
        let list = postings.get_or_create(b"key");
        let edge = DirectedEdge::to_uid(1, "friend", 9, "test", 1);
        list.add_mutation(&edge, Op::Set).unwrap();
        assert!(list.is_dirty());
        postings.commit_all().unwrap();
        assert!(!list.is_dirty());
    }

    #[test]
    fn dirty_lists_survive_eviction_pressure() {
        let postings = engine(1);
        let dirty = postings.get_or_create(b"dirty");
        dirty
            .add_mutation(&DirectedEdge::to_uid(1, "friend", 5, "test", 1), Op::Set)
            .unwrap();

        // Blow far past the 1 MB budget with clean lists; the dirty one
        // must stay pinned while clean ones get evicted.
        for i in 0..20_000u64 {
            let key = format!("clean-{i}").into_bytes();
            postings.get_or_create(&key);
        }
        assert!(postings.cached_lists() < 20_001);

        let again = postings.get_or_create(b"dirty");
        assert!(again.is_dirty());
        assert!(Arc::ptr_eq(&dirty, &again));
    }
}
