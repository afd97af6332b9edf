//! End-to-end bulk loader scenarios against an in-memory byte store.

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use tern::bulk::xidmap::XidMap;
use tern::bulk::{BulkLoader, BulkOptions};
use tern::keys;
use tern::model::{DirectedEdge, Op, TypedValue, ASSIGNER_SOURCE, MAX_UID, XID_ATTR};
use tern::store::{ByteStore, MemStore};
use tern::{Postings, TernError};

const INPUT: &str = "\
_:a <name> \"Alice\" .
_:a <friend> _:b .
_:b <name> \"Bob\" .
";

struct Fixture {
    _dir: TempDir,
    opts: BulkOptions,
}

fn fixture(input: &str, schema: Option<&str>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let rdf_dir = dir.path().join("rdf");
    fs::create_dir_all(&rdf_dir).unwrap();
    fs::write(rdf_dir.join("input.rdf"), input).unwrap();
    let schema_file = schema.map(|text| {
        let path = dir.path().join("schema.txt");
        fs::write(&path, text).unwrap();
        path
    });
    let opts = BulkOptions {
        rdf_dir,
        schema_file,
        tmp_dir: dir.path().join("tmp"),
        lease_file: dir.path().join("LEASE"),
        num_threads: 1,
        map_buf_size: 64 << 20,
        num_shards: 1,
    };
    Fixture { _dir: dir, opts }
}

#[test]
fn bulk_load_builds_expected_posting_lists() {
    let fx = fixture(INPUT, None);
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    loader.map_stage().unwrap();

    let store = Arc::new(MemStore::new());
    loader.reduce_stage(0, store.as_ref()).unwrap();

    // The lease file records both blank-node assignments.
    let lease = XidMap::read_lease_file(&fx.opts.lease_file).unwrap();
    assert_eq!(lease, 3);

    // The bulk output opens straight into the posting engine.
    let postings = Postings::new(
        Arc::clone(&store) as Arc<dyn ByteStore>,
        Arc::new(MemStore::new()) as Arc<dyn ByteStore>,
        0,
    );

    // First-seen order assigns _:a then _:b.
    let (a, b) = (1u64, 2u64);
    assert_ne!(a, 0);
    assert_ne!(a, MAX_UID);
    assert_ne!(a, b);

    let name_a = postings.get_or_create(&keys::data_key(a, "name"));
    assert_eq!(name_a.value().unwrap(), b"Alice".to_vec());
    let name_b = postings.get_or_create(&keys::data_key(b, "name"));
    assert_eq!(name_b.value().unwrap(), b"Bob".to_vec());
    let friend = postings.get_or_create(&keys::data_key(a, "friend"));
    assert_eq!(friend.uids().unwrap(), vec![b]);

    // Both reverse records are present and round-trip the xids.
    let xid_a = postings.get_or_create(&keys::data_key(a, XID_ATTR));
    assert_eq!(xid_a.value().unwrap(), b"_:a".to_vec());
    let xid_b = postings.get_or_create(&keys::data_key(b, XID_ATTR));
    assert_eq!(xid_b.value().unwrap(), b"_:b".to_vec());
}

#[test]
fn rerunning_reduce_is_idempotent() {
    // A crash between phases leaves the .map files intact; reducing them
    // again into a fresh store reproduces the same bytes.
    let fx = fixture(INPUT, None);
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    loader.map_stage().unwrap();

    let first = MemStore::new();
    loader.reduce_stage(0, &first).unwrap();

    // A relaunched loader knows nothing of the first run.
    let relaunched = BulkLoader::new(fx.opts.clone()).unwrap();
    let second = MemStore::new();
    relaunched.reduce_stage(0, &second).unwrap();

    assert_eq!(first.dump(), second.dump());
    assert!(!first.is_empty());
}

#[test]
fn bulk_output_matches_online_mutations() {
    let fx = fixture(INPUT, None);
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    loader.map_stage().unwrap();
    let bulk = MemStore::new();
    loader.reduce_stage(0, &bulk).unwrap();

    // Replay the same triples through the live mutation path with the
    // same uid assignments and timestamps, then commit.
    let pstore = Arc::new(MemStore::new());
    let postings = Postings::new(
        Arc::clone(&pstore) as Arc<dyn ByteStore>,
        Arc::new(MemStore::new()) as Arc<dyn ByteStore>,
        0,
    );
    let (a, b) = (1u64, 2u64);
    for (uid, xid) in [(a, "_:a"), (b, "_:b")] {
        let edge = DirectedEdge::to_value(
            uid,
            XID_ATTR,
            TypedValue::Str(xid.into()),
            ASSIGNER_SOURCE,
            0,
        );
        postings
            .get_or_create(&keys::data_key(uid, XID_ATTR))
            .add_mutation(&edge, Op::Set)
            .unwrap();
    }
    for (uid, attr, value) in [(a, "name", "Alice"), (b, "name", "Bob")] {
        let edge = DirectedEdge::to_value(uid, attr, TypedValue::Str(value.into()), "rdf", 0);
        postings
            .get_or_create(&keys::data_key(uid, attr))
            .add_mutation(&edge, Op::Set)
            .unwrap();
    }
    let friend = DirectedEdge::to_uid(a, "friend", b, "rdf", 0);
    postings
        .get_or_create(&keys::data_key(a, "friend"))
        .add_mutation(&friend, Op::Set)
        .unwrap();
    postings.commit_all().unwrap();

    // Every data-namespace key the bulk load produced is byte-identical
    // to the online commit's output.
    let mut data_keys = 0;
    for (key, value) in bulk.dump() {
        if key[0] != keys::DATA_TAG {
            continue;
        }
        data_keys += 1;
        assert_eq!(
            pstore.get(&key).unwrap().as_deref(),
            Some(value.as_slice()),
            "bulk and online disagree on key {key:?}"
        );
    }
    assert_eq!(data_keys, 5);
}

#[test]
fn duplicate_triples_collapse_to_the_last_posting() {
    let fx = fixture(
        "_:a <name> \"Alice\" .\n_:a <name> \"Alice\" .\n_:a <name> \"Alicia\" .\n",
        None,
    );
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    loader.map_stage().unwrap();
    let store = Arc::new(MemStore::new());
    loader.reduce_stage(0, store.as_ref()).unwrap();

    let postings = Postings::new(
        Arc::clone(&store) as Arc<dyn ByteStore>,
        Arc::new(MemStore::new()) as Arc<dyn ByteStore>,
        0,
    );
    let name = postings.get_or_create(&keys::data_key(1, "name"));
    // All three postings share the scalar sentinel uid; the last write
    // survives.
    assert_eq!(name.length().unwrap(), 1);
    assert_eq!(name.value().unwrap(), b"Alicia".to_vec());
}

#[test]
fn last_duplicate_wins_even_when_it_sorts_lower() {
    // "Amy" < "Zed" byte-wise, so any value-ordered tie-break would keep
    // "Zed"; input position has to decide.
    let fx = fixture("_:a <name> \"Zed\" .\n_:a <name> \"Amy\" .\n", None);
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    loader.map_stage().unwrap();
    let bulk = Arc::new(MemStore::new());
    loader.reduce_stage(0, bulk.as_ref()).unwrap();

    let postings = Postings::new(
        Arc::clone(&bulk) as Arc<dyn ByteStore>,
        Arc::new(MemStore::new()) as Arc<dyn ByteStore>,
        0,
    );
    let name = postings.get_or_create(&keys::data_key(1, "name"));
    assert_eq!(name.length().unwrap(), 1);
    assert_eq!(name.value().unwrap(), b"Amy".to_vec());

    // The same two mutations replayed sequentially through the live
    // path commit to the identical bytes.
    let pstore = Arc::new(MemStore::new());
    let online = Postings::new(
        Arc::clone(&pstore) as Arc<dyn ByteStore>,
        Arc::new(MemStore::new()) as Arc<dyn ByteStore>,
        0,
    );
    let key = keys::data_key(1, "name");
    let list = online.get_or_create(&key);
    for value in ["Zed", "Amy"] {
        let edge = DirectedEdge::to_value(1, "name", TypedValue::Str(value.into()), "rdf", 0);
        list.add_mutation(&edge, Op::Set).unwrap();
    }
    online.commit_all().unwrap();
    assert_eq!(bulk.get(&key).unwrap(), pstore.get(&key).unwrap());
}

#[test]
fn count_index_tallies_postings_per_predicate() {
    let fx = fixture(INPUT, None);
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    loader.map_stage().unwrap();
    let store = MemStore::new();
    loader.reduce_stage(0, &store).unwrap();

    let name_count = store.get(&keys::count_pred_key("name")).unwrap().unwrap();
    assert_eq!(u64::from_le_bytes(name_count.try_into().unwrap()), 2);
    let friend_count = store.get(&keys::count_pred_key("friend")).unwrap().unwrap();
    assert_eq!(u64::from_le_bytes(friend_count.try_into().unwrap()), 1);
    let xid_count = store.get(&keys::count_pred_key(XID_ATTR)).unwrap().unwrap();
    assert_eq!(u64::from_le_bytes(xid_count.try_into().unwrap()), 2);
}

#[test]
fn schema_violations_abort_the_map_phase() {
    let fx = fixture("_:a <age> \"not a number\" .\n", Some("age: int .\n"));
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    assert!(matches!(
        loader.map_stage(),
        Err(TernError::SchemaViolation(_))
    ));
}

#[test]
fn schema_table_lands_in_the_store() {
    let fx = fixture(INPUT, Some("name: string @index(exact) .\nfriend: uid @reverse .\n"));
    let loader = BulkLoader::new(fx.opts.clone()).unwrap();
    loader.map_stage().unwrap();
    let store = MemStore::new();
    loader.reduce_stage(0, &store).unwrap();
    assert!(store.get(&keys::schema_key("name")).unwrap().is_some());
    assert!(store.get(&keys::schema_key("friend")).unwrap().is_some());
}
