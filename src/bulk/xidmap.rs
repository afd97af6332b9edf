//! In-process monotonic uid assignment for the bulk loader.
//!
//! Unlike the live assigner, bulk uids are lease-based: the first sight
//! of an xid takes the next lease value. The lease is persisted at the
//! end of the map phase so a later live cluster can allocate above it.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Result, TernError};

pub struct XidMap {
    map: DashMap<String, u64>,
    lease: AtomicU64,
}

impl Default for XidMap {
    fn default() -> Self {
        Self::new()
    }
}

impl XidMap {
    pub fn new() -> Self {
        XidMap {
            map: DashMap::new(),
            // uid 0 stays unassigned.
            lease: AtomicU64::new(1),
        }
    }

    /// The uid for `xid`, assigning the next lease on first sight.
    /// Returns `(uid, fresh)`; a uid is assigned at most once per run.
    pub fn assign(&self, xid: &str) -> (u64, bool) {
        if let Some(uid) = self.map.get(xid) {
            return (*uid, false);
        }
        match self.map.entry(xid.to_string()) {
            Entry::Occupied(entry) => (*entry.get(), false),
            Entry::Vacant(entry) => {
                let uid = self.lease.fetch_add(1, Ordering::Relaxed);
                entry.insert(uid);
                (uid, true)
            }
        }
    }

    /// The next unassigned uid.
    pub fn lease(&self) -> u64 {
        self.lease.load(Ordering::Relaxed)
    }

    pub fn assigned(&self) -> usize {
        self.map.len()
    }

    /// Writes the lease atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn write_lease_file(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, format!("{}\n", self.lease()))?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_lease_file(path: &Path) -> Result<u64> {
        let text = fs::read_to_string(path)?;
        text.trim()
            .parse::<u64>()
            .map_err(|_| TernError::Corruption(format!("bad lease file {}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_sight_assigns_once() {
        let map = XidMap::new();
        let (a, fresh_a) = map.assign("alice");
        assert!(fresh_a);
        let (a2, fresh_a2) = map.assign("alice");
        assert!(!fresh_a2);
        assert_eq!(a, a2);
        let (b, _) = map.assign("bob");
        assert_ne!(a, b);
        assert_eq!(map.lease(), 3);
    }

    #[test]
    fn concurrent_assignment_is_unique_per_xid() {
        let map = Arc::new(XidMap::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                (0..100)
                    .map(|i| map.assign(&format!("xid-{}", i % 10)).0)
                    .collect::<Vec<u64>>()
            }));
        }
        let results: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for per_thread in &results {
            assert_eq!(per_thread, &results[0]);
        }
        assert_eq!(map.assigned(), 10);
    }

    #[test]
    fn lease_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lease");
        let map = XidMap::new();
        map.assign("a");
        map.assign("b");
        map.write_lease_file(&path).unwrap();
        assert_eq!(XidMap::read_lease_file(&path).unwrap(), 3);
    }
}
