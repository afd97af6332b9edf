use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::codec::{empty_list, ListBuilder, ListReader, Posting, PostingRef};
use crate::error::{Result, TernError};
use crate::model::{DirectedEdge, Op, MAX_UID};
use crate::store::ByteStore;

/// One element of the merged view during a merge walk: either a committed
/// record kept as-is (appended by copy) or a pending Set.
enum Merged<'a, 'b> {
    Kept(PostingRef<'a>),
    New(&'b Posting),
}

/// One pending mutation's place in the merged view.
///
/// `slot` links occupy a merged index (Sets, inserting or replacing);
/// non-slot links are the holes left by Dels of committed uids. The
/// prefix counters make `get` a binary search: for a merged index `i`
/// past the last link `l` with `l.idx <= i`, the committed index is
/// `i - l.slots_upto + l.cskip_upto`.
struct MutationLink {
    idx: usize,
    slot: bool,
    posting: Option<Posting>,
    slots_upto: usize,
    cskip_upto: usize,
}

#[derive(Default)]
struct MutationIndex {
    links: Vec<MutationLink>,
    merged_len: usize,
}

struct ListInner {
    buffer: Vec<u8>,
    mbuffer: Vec<u8>,
    index: MutationIndex,
    dirty: bool,
    /// Set when the mutation buffer failed to parse; every operation
    /// reports it until the buffer is repaired out of band.
    corrupt: Option<String>,
}

/// The in-memory merged view of one key's postings: the committed,
/// uid-sorted `buffer` with the pending `mbuffer` layered on top.
pub struct PostingList {
    key: Vec<u8>,
    pstore: Arc<dyn ByteStore>,
    mstore: Arc<dyn ByteStore>,
    inner: RwLock<ListInner>,
}

/// Pending mutations folded down to one effective op per uid; within one
/// commit window the last writer wins.
fn effective_muts(mbuffer: &[u8]) -> Result<BTreeMap<u64, Posting>> {
    let mreader = ListReader::new(mbuffer)?;
    let mut eff = BTreeMap::new();
    for p in mreader.iter() {
        let p = p?.to_owned()?;
        eff.insert(p.uid, p);
    }
    Ok(eff)
}

/// Walks the merged view in uid order. For each mutation the committed
/// cursor advances to the first committed uid >= the mutation's; on a tie
/// the mutation wins (Set replaces, Del removes).
fn merge<'a, 'b>(
    creader: &ListReader<'a>,
    eff: &'b BTreeMap<u64, Posting>,
    mut emit: impl FnMut(Merged<'a, 'b>) -> Result<()>,
) -> Result<()> {
    let clen = creader.len();
    let mut ci = 0;
    for (uid, m) in eff {
        while ci < clen {
            let cp = creader.get(ci)?;
            if cp.uid() >= *uid {
                break;
            }
            emit(Merged::Kept(cp))?;
            ci += 1;
        }
        if ci < clen && creader.get(ci)?.uid() == *uid {
            ci += 1;
        }
        if m.op == Op::Set {
            emit(Merged::New(m))?;
        }
    }
    while ci < clen {
        emit(Merged::Kept(creader.get(ci)?))?;
        ci += 1;
    }
    Ok(())
}

fn rebuild_index(buffer: &[u8], mbuffer: &[u8]) -> Result<MutationIndex> {
    let creader = ListReader::new(buffer)?;
    let clen = creader.len();
    let eff = effective_muts(mbuffer)?;
    if eff.is_empty() {
        return Ok(MutationIndex {
            links: Vec::new(),
            merged_len: clen,
        });
    }

    let mut links = Vec::new();
    let mut ci = 0usize;
    let mut merged = 0usize;
    let mut slots = 0usize;
    let mut cskip = 0usize;
    for (uid, m) in eff {
        while ci < clen && creader.get(ci)?.uid() < uid {
            ci += 1;
            merged += 1;
        }
        let hit = ci < clen && creader.get(ci)?.uid() == uid;
        match m.op {
            Op::Set => {
                if hit {
                    ci += 1;
                    cskip += 1;
                }
                slots += 1;
                links.push(MutationLink {
                    idx: merged,
                    slot: true,
                    posting: Some(m),
                    slots_upto: slots,
                    cskip_upto: cskip,
                });
                merged += 1;
            }
            Op::Del => {
                if hit {
                    ci += 1;
                    cskip += 1;
                    links.push(MutationLink {
                        idx: merged,
                        slot: false,
                        posting: None,
                        slots_upto: slots,
                        cskip_upto: cskip,
                    });
                }
            }
        }
    }
    Ok(MutationIndex {
        links,
        merged_len: merged + (clen - ci),
    })
}

impl PostingList {
    /// Loads the list for `key`. A missing entry in either store defaults
    /// to the canonical empty encoding; an unreadable mutation buffer
    /// poisons the list rather than failing the open.
    pub fn open(
        key: Vec<u8>,
        pstore: Arc<dyn ByteStore>,
        mstore: Arc<dyn ByteStore>,
    ) -> Arc<PostingList> {
        let buffer = match pstore.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => empty_list(),
            Err(err) => {
                warn!(error = %err, "could not read posting list, defaulting to empty");
                empty_list()
            }
        };
        let mbuffer = match mstore.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => empty_list(),
            Err(err) => {
                debug!(error = %err, "could not read mutation list, defaulting to empty");
                empty_list()
            }
        };

        let (index, dirty, corrupt) = match rebuild_index(&buffer, &mbuffer) {
            Ok(index) => {
                let dirty = !index.links.is_empty();
                (index, dirty, None)
            }
            Err(err) => (MutationIndex::default(), false, Some(err.to_string())),
        };
        Arc::new(PostingList {
            key,
            pstore,
            mstore,
            inner: RwLock::new(ListInner {
                buffer,
                mbuffer,
                index,
                dirty,
                corrupt,
            }),
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Rough in-memory footprint, for the cache's byte accounting.
    pub fn approx_size(&self) -> usize {
        let inner = self.inner.read();
        self.key.len() + inner.buffer.len() + inner.mbuffer.len() + 64
    }

    /// Appends a pending mutation, persists the new mutation buffer, and
    /// marks the list dirty. A failed store write leaves the in-memory
    /// state untouched.
    pub fn add_mutation(&self, edge: &DirectedEdge, op: Op) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(msg) = &inner.corrupt {
            return Err(TernError::Corruption(msg.clone()));
        }

        let posting = Posting::from_edge(edge, op);
        let mreader = ListReader::new(&inner.mbuffer)?;
        let mut builder = ListBuilder::new();
        for p in mreader.iter() {
            builder.push_ref(&p?);
        }
        builder.push(&posting);
        let mbuffer = builder.finish();

        self.mstore.set_one(&self.key, &mbuffer)?;
        inner.index = rebuild_index(&inner.buffer, &mbuffer)?;
        inner.mbuffer = mbuffer;
        inner.dirty = true;
        Ok(())
    }

    /// Length of the merged view: committed entries plus inserted Sets,
    /// minus Dels of existing uids; replacing Sets are neutral.
    pub fn length(&self) -> Result<usize> {
        let inner = self.inner.read();
        if let Some(msg) = &inner.corrupt {
            return Err(TernError::Corruption(msg.clone()));
        }
        Ok(inner.index.merged_len)
    }

    /// The `i`th posting of the merged view in uid order, or `None` past
    /// the end.
    pub fn get(&self, i: usize) -> Result<Option<Posting>> {
        let inner = self.inner.read();
        if let Some(msg) = &inner.corrupt {
            return Err(TernError::Corruption(msg.clone()));
        }
        let index = &inner.index;
        if i >= index.merged_len {
            return Ok(None);
        }
        let creader = ListReader::new(&inner.buffer)?;
        let pos = index.links.partition_point(|l| l.idx <= i);
        if pos == 0 {
            return creader.get(i)?.to_owned().map(Some);
        }
        let link = &index.links[pos - 1];
        if link.idx == i && link.slot {
            return Ok(link.posting.clone());
        }
        let cidx = i - link.slots_upto + link.cskip_upto;
        creader.get(cidx)?.to_owned().map(Some)
    }

    /// For a scalar-valued key (exactly one posting, the scalar sentinel
    /// uid), the value bytes.
    pub fn value(&self) -> Result<Vec<u8>> {
        if self.length()? != 1 {
            return Err(TernError::NotFound("scalar value"));
        }
        match self.get(0)? {
            Some(p) if p.uid == MAX_UID => Ok(p.value),
            _ => Err(TernError::NotFound("scalar value")),
        }
    }

    /// Ascending uids of the merged view, scalar postings filtered out.
    pub fn uids(&self) -> Result<Vec<u64>> {
        let inner = self.inner.read();
        if let Some(msg) = &inner.corrupt {
            return Err(TernError::Corruption(msg.clone()));
        }
        let creader = ListReader::new(&inner.buffer)?;
        let eff = effective_muts(&inner.mbuffer)?;
        let mut out = Vec::new();
        merge(&creader, &eff, |item| {
            let uid = match item {
                Merged::Kept(p) => p.uid(),
                Merged::New(p) => p.uid,
            };
            if uid != MAX_UID {
                out.push(uid);
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Atomically replaces the committed buffer with the merged view and
    /// clears the mutation buffer. Idempotent; a failure leaves the list
    /// dirty and a retry recomputes the same result.
    pub fn commit_if_dirty(&self) -> Result<()> {
        if !self.inner.read().dirty {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if !inner.dirty {
            return Ok(());
        }
        if let Some(msg) = &inner.corrupt {
            return Err(TernError::Corruption(msg.clone()));
        }

        let creader = ListReader::new(&inner.buffer)?;
        let eff = effective_muts(&inner.mbuffer)?;
        let mut builder = ListBuilder::new();
        merge(&creader, &eff, |item| {
            match item {
                Merged::Kept(p) => builder.push_ref(&p),
                Merged::New(p) => builder.push(p),
            }
            Ok(())
        })?;
        let merged_len = builder.len();
        let buffer = builder.finish();

        self.pstore.set_one(&self.key, &buffer)?;
        self.mstore.delete(&self.key)?;
        inner.buffer = buffer;
        inner.mbuffer = empty_list();
        inner.index = MutationIndex {
            links: Vec::new(),
            merged_len,
        };
        inner.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TypedValue;
    use crate::store::MemStore;

    fn stores() -> (Arc<MemStore>, Arc<MemStore>) {
        (Arc::new(MemStore::new()), Arc::new(MemStore::new()))
    }

    fn list_with(pstore: &Arc<MemStore>, mstore: &Arc<MemStore>) -> Arc<PostingList> {
        PostingList::open(
            b"test-key".to_vec(),
            Arc::clone(pstore) as Arc<dyn ByteStore>,
            Arc::clone(mstore) as Arc<dyn ByteStore>,
        )
    }

    fn uid_edge(uid: u64, ts: i64) -> DirectedEdge {
        DirectedEdge::to_uid(1, "friend", uid, "test", ts)
    }

    fn value_edge(text: &str, ts: i64) -> DirectedEdge {
        DirectedEdge::to_value(1, "name", TypedValue::Str(text.into()), "test", ts)
    }

    #[test]
    fn empty_list_has_no_postings() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        assert_eq!(list.length().unwrap(), 0);
        assert!(list.get(0).unwrap().is_none());
        assert!(!list.is_dirty());
    }

    #[test]
    fn mutations_merge_sorted_with_last_write_winning() {
        // Set(10, ts=1), Set(5, ts=2), Set(10, ts=3): two postings,
        // uids [5, 10], uid 10 carries ts 3.
        let (p, m) = stores();
        let list = list_with(&p, &m);
        list.add_mutation(&uid_edge(10, 1), Op::Set).unwrap();
        list.add_mutation(&uid_edge(5, 2), Op::Set).unwrap();
        list.add_mutation(&uid_edge(10, 3), Op::Set).unwrap();

        assert_eq!(list.length().unwrap(), 2);
        assert_eq!(list.uids().unwrap(), vec![5, 10]);

        list.commit_if_dirty().unwrap();
        assert_eq!(list.length().unwrap(), 2);
        assert_eq!(list.get(0).unwrap().unwrap().uid, 5);
        let second = list.get(1).unwrap().unwrap();
        assert_eq!(second.uid, 10);
        assert_eq!(second.ts, 3);
        assert!(!list.is_dirty());
    }

    #[test]
    fn reads_see_pending_mutations_before_commit() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        for uid in [20u64, 40, 60] {
            list.add_mutation(&uid_edge(uid, 1), Op::Set).unwrap();
        }
        list.commit_if_dirty().unwrap();

        list.add_mutation(&uid_edge(30, 2), Op::Set).unwrap();
        list.add_mutation(&uid_edge(40, 2), Op::Del).unwrap();
        list.add_mutation(&uid_edge(70, 2), Op::Set).unwrap();

        assert_eq!(list.uids().unwrap(), vec![20, 30, 60, 70]);
        assert_eq!(list.length().unwrap(), 4);
        for (i, want) in [20u64, 30, 60, 70].iter().enumerate() {
            assert_eq!(list.get(i).unwrap().unwrap().uid, *want, "index {i}");
        }
        assert!(list.get(4).unwrap().is_none());
    }

    #[test]
    fn set_then_del_removes_and_del_then_set_keeps() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        list.add_mutation(&uid_edge(7, 1), Op::Set).unwrap();
        list.add_mutation(&uid_edge(7, 2), Op::Del).unwrap();
        assert_eq!(list.length().unwrap(), 0);

        list.add_mutation(&uid_edge(9, 3), Op::Del).unwrap();
        list.add_mutation(&uid_edge(9, 4), Op::Set).unwrap();
        assert_eq!(list.uids().unwrap(), vec![9]);
        assert_eq!(list.get(0).unwrap().unwrap().ts, 4);
    }

    #[test]
    fn delete_all_committed_entries() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        for uid in [1u64, 2, 3] {
            list.add_mutation(&uid_edge(uid, 1), Op::Set).unwrap();
        }
        list.commit_if_dirty().unwrap();
        for uid in [1u64, 2, 3] {
            list.add_mutation(&uid_edge(uid, 2), Op::Del).unwrap();
        }
        assert_eq!(list.length().unwrap(), 0);
        list.commit_if_dirty().unwrap();
        assert_eq!(list.length().unwrap(), 0);
    }

    #[test]
    fn del_of_missing_uid_is_a_noop() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        list.add_mutation(&uid_edge(5, 1), Op::Set).unwrap();
        list.add_mutation(&uid_edge(99, 1), Op::Del).unwrap();
        assert_eq!(list.uids().unwrap(), vec![5]);
    }

    #[test]
    fn scalar_value_roundtrip() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        list.add_mutation(&value_edge("Alice", 1), Op::Set).unwrap();
        assert_eq!(list.value().unwrap(), b"Alice".to_vec());
        // Scalar postings are invisible to the uid projection.
        assert!(list.uids().unwrap().is_empty());

        list.commit_if_dirty().unwrap();
        assert_eq!(list.value().unwrap(), b"Alice".to_vec());
    }

    #[test]
    fn value_on_uid_list_is_not_found() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        list.add_mutation(&uid_edge(3, 1), Op::Set).unwrap();
        assert!(matches!(list.value(), Err(TernError::NotFound(_))));
    }

    #[test]
    fn committed_order_is_strictly_ascending() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        for uid in [9u64, 3, 7, 3, 1, 9, 5] {
            list.add_mutation(&uid_edge(uid, 1), Op::Set).unwrap();
        }
        list.commit_if_dirty().unwrap();
        let len = list.length().unwrap();
        for i in 0..len.saturating_sub(1) {
            let a = list.get(i).unwrap().unwrap().uid;
            let b = list.get(i + 1).unwrap().unwrap().uid;
            assert!(a < b, "postings out of order at {i}");
        }
    }

    #[test]
    fn commit_then_merge_is_stable() {
        // Once committed, merging an empty mutation set reproduces the
        // buffer byte for byte.
        let (p, m) = stores();
        let list = list_with(&p, &m);
        for uid in [4u64, 2, 8] {
            list.add_mutation(&uid_edge(uid, 1), Op::Set).unwrap();
        }
        list.commit_if_dirty().unwrap();
        let first = p.get(b"test-key").unwrap().unwrap();
        // No-op commit must not rewrite anything.
        list.commit_if_dirty().unwrap();
        assert_eq!(p.get(b"test-key").unwrap().unwrap(), first);
    }

    #[test]
    fn mutations_survive_reopen() {
        let (p, m) = stores();
        {
            let list = list_with(&p, &m);
            list.add_mutation(&uid_edge(11, 1), Op::Set).unwrap();
        }
        // The mutation buffer was persisted; a fresh open sees it and is
        // dirty until committed.
        let list = list_with(&p, &m);
        assert!(list.is_dirty());
        assert_eq!(list.uids().unwrap(), vec![11]);
        list.commit_if_dirty().unwrap();
        assert!(m.get(b"test-key").unwrap().is_none());
    }

    #[test]
    fn corrupt_mutation_buffer_is_reported_but_committed_data_survives() {
        let (p, m) = stores();
        {
            let list = list_with(&p, &m);
            list.add_mutation(&uid_edge(1, 1), Op::Set).unwrap();
            list.commit_if_dirty().unwrap();
        }
        m.set_one(b"test-key", b"\xde\xad\xbe\xef\xff").unwrap();

        let list = list_with(&p, &m);
        assert!(matches!(list.get(0), Err(TernError::Corruption(_))));
        assert!(matches!(list.length(), Err(TernError::Corruption(_))));

        // Bypassing the mutation layer, the committed buffer still reads.
        let raw = p.get(b"test-key").unwrap().unwrap();
        let reader = ListReader::new(&raw).unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.get(0).unwrap().uid(), 1);
    }

    #[test]
    fn scalar_sentinel_set_is_allowed() {
        let (p, m) = stores();
        let list = list_with(&p, &m);
        list.add_mutation(&value_edge("v", 1), Op::Set).unwrap();
        list.add_mutation(&uid_edge(5, 1), Op::Set).unwrap();
        // The sentinel sorts last.
        assert_eq!(list.length().unwrap(), 2);
        assert_eq!(list.get(1).unwrap().unwrap().uid, MAX_UID);
    }
}
