use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

use super::node::{frame_kind, NodeValue, PageKind, RecordId, SortedPage};
use super::BTree;
use crate::storage::{PageId, INVALID_PAGE};

fn open_tree(dir: &TempDir, name: &str) -> BTree {
    let _ = env_logger::builder().is_test(true).try_init();
    BTree::open(dir.path().join("store.db"), name).unwrap()
}

fn pad4(k: u32) -> Vec<u8> {
    format!("{k:04}").into_bytes()
}

fn pad5(k: u32) -> Vec<u8> {
    format!("{k:05}").into_bytes()
}

fn pad20(k: u32) -> Vec<u8> {
    format!("{k:020}").into_bytes()
}

fn rid_for(k: u32) -> RecordId {
    RecordId::new(k + 1, k as i32 + 2)
}

fn rid_off(k: u32, offset: u32) -> RecordId {
    RecordId::new(k + offset, (k + offset) as i32)
}

fn collect(
    tree: &mut BTree,
    low: Option<&[u8]>,
    high: Option<&[u8]>,
) -> Vec<(Vec<u8>, RecordId)> {
    tree.open_scan(low, high)
        .unwrap()
        .map(|(k, v)| (k.to_vec(), v))
        .collect()
}

fn assert_pin_balance(tree: &mut BTree) {
    // Only the header page stays pinned between operations.
    assert_eq!(tree.buf.pinned_pages(), 1, "pin leak detected");
}

/// Page ids of the leaf chain, left to right.
fn leaf_pids(tree: &mut BTree) -> Vec<PageId> {
    let mut out = Vec::new();
    let mut pid = tree.leftmost_leaf().unwrap();
    while pid != INVALID_PAGE {
        out.push(pid);
        let mut page = tree.buf.pin(pid).unwrap();
        let next = SortedPage::<RecordId>::open(page.data_mut())
            .unwrap()
            .next_page();
        tree.buf.unpin(page, false).unwrap();
        pid = next;
    }
    out
}

fn leaf_free_space(tree: &mut BTree, pid: PageId) -> usize {
    let mut page = tree.buf.pin(pid).unwrap();
    let free = SortedPage::<RecordId>::open(page.data_mut())
        .unwrap()
        .free_space();
    tree.buf.unpin(page, false).unwrap();
    free
}

fn leaf_keys(tree: &mut BTree, pid: PageId) -> Vec<Vec<u8>> {
    let mut page = tree.buf.pin(pid).unwrap();
    let leaf = SortedPage::<RecordId>::open(page.data_mut()).unwrap();
    let keys = (0..leaf.record_count())
        .map(|s| leaf.key_at(s).unwrap().to_vec())
        .collect();
    tree.buf.unpin(page, false).unwrap();
    keys
}

/// Checks per-page sortedness, space accounting, and the leaf chain
/// ordering and back-links.
fn check_leaf_invariants(tree: &mut BTree) {
    let pids = leaf_pids(tree);
    let mut prev_pid = INVALID_PAGE;
    let mut prev_max: Option<Vec<u8>> = None;
    for &pid in &pids {
        let mut page = tree.buf.pin(pid).unwrap();
        let leaf = SortedPage::<RecordId>::open(page.data_mut()).unwrap();

        for slot in 1..leaf.record_count() {
            assert!(
                leaf.key_at(slot - 1).unwrap() < leaf.key_at(slot).unwrap(),
                "keys out of order on leaf {pid}"
            );
        }

        let record_bytes: usize = (0..leaf.record_count())
            .map(|s| leaf.record_bytes(s).unwrap().len())
            .sum();
        let slots = leaf.record_count().max(1);
        assert_eq!(
            record_bytes + slots * super::node::SLOT_SIZE + leaf.free_space(),
            super::node::DATA_SIZE,
            "space accounting broken on leaf {pid}"
        );

        assert_eq!(leaf.prev_page(), prev_pid, "broken back-link on leaf {pid}");
        if let (Some(prev_max), Some(min)) = (&prev_max, leaf.min_key().unwrap()) {
            assert!(
                prev_max.as_slice() <= min,
                "leaf chain out of order at leaf {pid}"
            );
        }
        prev_max = leaf.max_key().unwrap().map(<[u8]>::to_vec).or(prev_max);
        prev_pid = pid;
        tree.buf.unpin(page, false).unwrap();
    }
}

/// Recursively checks the separator invariant: every key under a child
/// lies inside the half-open window its parent assigns to it. Only valid
/// for workloads with unique keys.
fn check_separators(tree: &mut BTree, pid: PageId, low: Option<&[u8]>, high: Option<&[u8]>) {
    let mut page = tree.buf.pin(pid).unwrap();
    match frame_kind(page.data()).unwrap() {
        PageKind::Leaf => {
            let leaf = SortedPage::<RecordId>::open(page.data_mut()).unwrap();
            for slot in 0..leaf.record_count() {
                let key = leaf.key_at(slot).unwrap();
                if let Some(low) = low {
                    assert!(key >= low, "leaf {pid} key below its subtree window");
                }
                if let Some(high) = high {
                    assert!(key < high, "leaf {pid} key above its subtree window");
                }
            }
            tree.buf.unpin(page, false).unwrap();
        }
        PageKind::Index => {
            let (leftmost, entries) = {
                let idx = SortedPage::<PageId>::open(page.data_mut()).unwrap();
                let mut entries = Vec::new();
                for slot in 0..idx.record_count() {
                    entries.push((
                        idx.key_at(slot).unwrap().to_vec(),
                        idx.first_value_at(slot).unwrap(),
                    ));
                }
                (idx.prev_page(), entries)
            };
            tree.buf.unpin(page, false).unwrap();

            let first_key = entries.first().map(|(k, _)| k.clone());
            check_separators(tree, leftmost, low, first_key.as_deref());
            for (i, (key, child)) in entries.iter().enumerate() {
                let upper = entries.get(i + 1).map(|(k, _)| k.as_slice());
                check_separators(tree, *child, Some(key), upper);
            }
        }
    }
}

#[test]
fn single_leaf_holds_59_entries_and_clips_ranges() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "single-leaf");
    for k in 1..=59 {
        tree.insert(&pad4(k), rid_for(k)).unwrap();
    }
    assert_pin_balance(&mut tree);
    assert_eq!(leaf_pids(&mut tree).len(), 1);

    let all = collect(&mut tree, None, None);
    assert_eq!(all.len(), 59);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(all[0], (pad4(1), rid_for(1)));

    assert_eq!(
        collect(&mut tree, Some(b"0005"), Some(b"0015")).len(),
        11
    );
    assert_eq!(collect(&mut tree, Some(b"0058"), Some(b"0064")).len(), 2);
    assert_eq!(collect(&mut tree, Some(b"0000"), Some(b"0005")).len(), 5);

    // Absent keys come back empty; present keys as exact matches.
    assert!(collect(&mut tree, Some(b"0000"), Some(b"0000")).is_empty());
    assert!(collect(&mut tree, Some(b"0060"), Some(b"0060")).is_empty());
    assert_eq!(
        collect(&mut tree, Some(b"0002"), Some(b"0002")),
        vec![(pad4(2), rid_for(2))]
    );
    assert_eq!(
        collect(&mut tree, Some(b"0059"), Some(b"0059")),
        vec![(pad4(59), rid_for(59))]
    );

    check_leaf_invariants(&mut tree);
    assert_pin_balance(&mut tree);
}

#[test]
fn one_key_accumulates_124_duplicates_on_one_leaf() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "dups");
    for i in 1..=124u32 {
        tree.insert(b"0003", RecordId::new(3 + i, 4 + i as i32))
            .unwrap();
    }
    assert_eq!(leaf_pids(&mut tree).len(), 1);

    let all = collect(&mut tree, Some(b"0003"), Some(b"0003"));
    assert_eq!(all.len(), 124);
    assert!(all.iter().all(|(k, _)| k == b"0003"));

    // Values under one key are unordered; compare as sets.
    let mut got: Vec<RecordId> = all.into_iter().map(|(_, v)| v).collect();
    got.sort_by_key(|r| (r.page, r.slot));
    let expected: Vec<RecordId> = (1..=124u32)
        .map(|i| RecordId::new(3 + i, 4 + i as i32))
        .collect();
    assert_eq!(got, expected);

    check_leaf_invariants(&mut tree);
    assert_pin_balance(&mut tree);
}

#[test]
fn appending_past_a_full_leaf_splits_to_the_right() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "split-right");
    for k in 1..=30 {
        tree.insert(&pad20(k), rid_for(k)).unwrap();
    }
    assert_eq!(leaf_pids(&mut tree).len(), 1);

    tree.insert(&pad20(31), rid_for(31)).unwrap();
    let pids = leaf_pids(&mut tree);
    assert_eq!(pids.len(), 2);
    assert_eq!(collect(&mut tree, None, None).len(), 31);

    // The split leaves the free space of the two siblings within one
    // entry's worth on each side (20-byte key + NUL + rid + slot).
    let bound = 2 * (20 + 1 + RecordId::SIZE + super::node::SLOT_SIZE);
    let free_left = leaf_free_space(&mut tree, pids[0]);
    let free_right = leaf_free_space(&mut tree, pids[1]);
    assert!(
        free_left.abs_diff(free_right) <= bound,
        "unbalanced split: {free_left} vs {free_right}"
    );

    // The new greatest key went right.
    assert!(leaf_keys(&mut tree, pids[1]).contains(&pad20(31)));
    check_leaf_invariants(&mut tree);
    let root = tree.root().unwrap();
    check_separators(&mut tree, root, None, None);
    assert_pin_balance(&mut tree);
}

#[test]
fn inserting_below_minimum_lands_on_the_left_leaf() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "split-left");
    for k in 2..=31 {
        tree.insert(&pad20(k), rid_for(k)).unwrap();
    }
    tree.insert(&pad20(1), rid_for(1)).unwrap();

    let pids = leaf_pids(&mut tree);
    assert_eq!(pids.len(), 2);
    assert_eq!(collect(&mut tree, None, None).len(), 31);
    assert!(leaf_keys(&mut tree, pids[0]).contains(&pad20(1)));

    check_leaf_invariants(&mut tree);
    let root = tree.root().unwrap();
    check_separators(&mut tree, root, None, None);
    assert_pin_balance(&mut tree);
}

#[test]
fn index_split_leaves_a_single_entry_root() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "index-split");

    let mut split_at = None;
    for k in 1..=1200u32 {
        tree.insert(&pad20(k), rid_for(k)).unwrap();

        let root = tree.root().unwrap();
        let mut page = tree.buf.pin(root).unwrap();
        let info = match frame_kind(page.data()).unwrap() {
            PageKind::Leaf => None,
            PageKind::Index => {
                let idx = SortedPage::<PageId>::open(page.data_mut()).unwrap();
                Some((idx.prev_page(), idx.record_count(), idx.first_value_at(0).unwrap()))
            }
        };
        tree.buf.unpin(page, false).unwrap();

        if let Some((leftmost, records, first_child)) = info {
            let mut child = tree.buf.pin(leftmost).unwrap();
            let child_kind = frame_kind(child.data()).unwrap();
            tree.buf.unpin(child, false).unwrap();
            if child_kind == PageKind::Index {
                // The root of roots was just created by an index split: it
                // carries exactly one separator record plus the leftmost
                // child pointer.
                assert_eq!(records, 1);
                split_at = Some((k, leftmost, first_child));
                break;
            }
        }
    }

    let (inserted, left_child, right_child) =
        split_at.expect("no index split within 1200 inserts");

    // Both index children respect the balance bound.
    let free_of = |tree: &mut BTree, pid: PageId| {
        let mut page = tree.buf.pin(pid).unwrap();
        let free = SortedPage::<PageId>::open(page.data_mut())
            .unwrap()
            .free_space();
        tree.buf.unpin(page, false).unwrap();
        free
    };
    let bound = 2 * (20 + 1 + PageId::SIZE + super::node::SLOT_SIZE);
    let free_left = free_of(&mut tree, left_child);
    let free_right = free_of(&mut tree, right_child);
    assert!(
        free_left.abs_diff(free_right) <= bound,
        "unbalanced index split: {free_left} vs {free_right}"
    );

    // Nothing went missing on the way.
    let all = collect(&mut tree, None, None);
    assert_eq!(all.len(), inserted as usize);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

    check_leaf_invariants(&mut tree);
    let root = tree.root().unwrap();
    check_separators(&mut tree, root, None, None);
    assert_pin_balance(&mut tree);
}

#[test]
fn large_mixed_workload_with_duplicates() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "mixed");

    for k in 1..=1000 {
        tree.insert(&pad5(k), rid_off(k, 1)).unwrap();
    }
    for k in 1..=1000 {
        tree.insert(&pad5(k), rid_off(k, 2)).unwrap();
    }
    for k in 501..=1500 {
        tree.insert(&pad5(k), rid_off(k, 3)).unwrap();
    }
    for k in 2001..=4000 {
        tree.insert(&pad5(k), rid_off(k, 1)).unwrap();
    }
    assert_pin_balance(&mut tree);

    let all = collect(&mut tree, None, None);
    assert_eq!(all.len(), 5000);
    assert!(all.windows(2).all(|w| w[0].0 <= w[1].0));

    assert_eq!(collect(&mut tree, Some(b"01000"), Some(b"01000")).len(), 3);
    assert_eq!(collect(&mut tree, Some(b"03000"), Some(b"03000")).len(), 1);

    // Key 1700 falls in none of the insert ranges.
    let at_1700 = collect(&mut tree, Some(b"01700"), Some(b"01700"));
    assert!(at_1700.is_empty());

    check_leaf_invariants(&mut tree);
    assert_pin_balance(&mut tree);
}

#[test]
fn scan_deletes_entries_in_place() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "scan-delete");
    for k in 1..=300 {
        tree.insert(&pad4(k), rid_for(k)).unwrap();
    }
    assert!(leaf_pids(&mut tree).len() > 1);

    let mut scan = tree.open_scan(None, None).unwrap();
    while let Some((key, _)) = scan.next() {
        let k: u32 = String::from_utf8_lossy(&key).parse().unwrap();
        if k % 2 == 0 {
            scan.delete_current().unwrap();
        }
    }
    drop(scan);
    assert_pin_balance(&mut tree);

    let rest = collect(&mut tree, None, None);
    assert_eq!(rest.len(), 150);
    assert!(rest.iter().all(|(k, _)| {
        let k: u32 = String::from_utf8_lossy(k).parse().unwrap();
        k % 2 == 1
    }));

    // Leaves may be under-full now, but the chain stays intact.
    check_leaf_invariants(&mut tree);
}

#[test]
fn draining_the_tree_keeps_it_usable() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "drain");
    for k in 1..=150 {
        tree.insert(&pad4(k), rid_for(k)).unwrap();
    }

    let mut scan = tree.open_scan(None, None).unwrap();
    while scan.next().is_some() {
        scan.delete_current().unwrap();
    }
    drop(scan);
    assert!(collect(&mut tree, None, None).is_empty());
    assert_pin_balance(&mut tree);

    // Empty leaves stay in the chain; the tree still accepts inserts.
    tree.insert(b"0042", rid_for(42)).unwrap();
    assert_eq!(
        collect(&mut tree, None, None),
        vec![(pad4(42), rid_for(42))]
    );
    check_leaf_invariants(&mut tree);
}

#[test]
fn deleting_duplicates_one_at_a_time() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "dup-delete");
    for i in 0..5u32 {
        tree.insert(b"dup", RecordId::new(10 + i, i as i32)).unwrap();
    }
    tree.insert(b"after", rid_for(1)).unwrap();

    let mut scan = tree.open_scan(Some(b"dup"), Some(b"dup")).unwrap();
    let mut deleted = 0;
    while scan.next().is_some() {
        scan.delete_current().unwrap();
        deleted += 1;
        if deleted == 3 {
            break;
        }
    }
    drop(scan);

    assert_eq!(collect(&mut tree, Some(b"dup"), Some(b"dup")).len(), 2);
    assert_eq!(collect(&mut tree, None, None).len(), 3);
    assert_pin_balance(&mut tree);
}

#[test]
fn destroy_frees_the_tree_and_reopen_is_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let mut tree = BTree::open(&path, "doomed").unwrap();
    for k in 1..=500 {
        tree.insert(&pad20(k), rid_for(k)).unwrap();
    }
    tree.destroy().unwrap();

    let mut tree = BTree::open(&path, "doomed").unwrap();
    assert!(collect(&mut tree, None, None).is_empty());
    tree.insert(b"fresh", rid_for(1)).unwrap();
    assert_eq!(collect(&mut tree, None, None).len(), 1);
    assert_pin_balance(&mut tree);
}

#[test]
fn destroying_an_empty_tree_succeeds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let tree = BTree::open(&path, "empty").unwrap();
    tree.destroy().unwrap();

    let mut tree = BTree::open(&path, "empty").unwrap();
    assert!(collect(&mut tree, None, None).is_empty());
}

#[test]
fn close_persists_and_reopen_reads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let mut tree = BTree::open(&path, "persist").unwrap();
    for k in 1..=400 {
        tree.insert(&pad4(k), rid_for(k)).unwrap();
    }
    tree.close().unwrap();

    let mut tree = BTree::open(&path, "persist").unwrap();
    let all = collect(&mut tree, None, None);
    assert_eq!(all.len(), 400);
    assert_eq!(all[0], (pad4(1), rid_for(1)));
    assert_eq!(all[399], (pad4(400), rid_for(400)));
    check_leaf_invariants(&mut tree);
}

#[test]
fn two_indexes_share_one_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let mut a = BTree::open(&path, "a").unwrap();
    a.insert(b"shared", rid_for(1)).unwrap();
    a.close().unwrap();

    let mut b = BTree::open(&path, "b").unwrap();
    assert!(collect(&mut b, None, None).is_empty());
    b.insert(b"other", rid_for(2)).unwrap();
    b.close().unwrap();

    let mut a = BTree::open(&path, "a").unwrap();
    assert_eq!(collect(&mut a, None, None).len(), 1);
}

#[test]
fn randomized_workload_matches_a_model() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "random");
    let mut model: BTreeMap<Vec<u8>, Vec<RecordId>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(7);

    for i in 0..2000u32 {
        let len = rng.gen_range(1..=8);
        let key: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        let rid = RecordId::new(i, rng.gen_range(0..1000));
        tree.insert(&key, rid).unwrap();
        model.entry(key).or_default().push(rid);
    }
    assert_pin_balance(&mut tree);

    let mut got: BTreeMap<Vec<u8>, Vec<RecordId>> = BTreeMap::new();
    for (k, v) in tree.open_scan(None, None).unwrap() {
        got.entry(k.to_vec()).or_default().push(v);
    }
    let sort_values = |m: &mut BTreeMap<Vec<u8>, Vec<RecordId>>| {
        for v in m.values_mut() {
            v.sort_by_key(|r| (r.page, r.slot));
        }
    };
    sort_values(&mut got);
    sort_values(&mut model);
    assert_eq!(got, model);

    // A random window agrees with the model too.
    let mut bounds: Vec<Vec<u8>> = model.keys().cloned().collect();
    let a = bounds.remove(rng.gen_range(0..bounds.len()));
    let b = bounds.remove(rng.gen_range(0..bounds.len()));
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let expected: usize = model
        .range(low.clone()..=high.clone())
        .map(|(_, v)| v.len())
        .sum();
    assert_eq!(
        collect(&mut tree, Some(&low), Some(&high)).len(),
        expected
    );

    check_leaf_invariants(&mut tree);
    assert_pin_balance(&mut tree);
}

#[test]
fn dump_renders_every_level() {
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir, "dump");
    assert_eq!(tree.dump().unwrap(), "<empty tree>");

    for k in 1..=80 {
        tree.insert(&pad20(k), rid_for(k)).unwrap();
    }
    let rendered = tree.dump().unwrap();
    assert!(rendered.contains("kind=Index"));
    assert!(rendered.contains("kind=Leaf"));
    assert_pin_balance(&mut tree);
}
