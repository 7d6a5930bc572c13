//! Cross-backend equivalence: any sequence of tree mutations must leave a
//! storage indistinguishable, fingerprint for fingerprint, from a sealed
//! vector built from the surviving item set. These run against the
//! production node occupancy bounds.

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rangesync::{
    BTreeMem, BTreePersist, Bound, Id, MemKv, Storage, SubRange, VectorStorage, ID_SIZE,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

fn id(n: u64) -> Id {
    let digest = Sha256::digest(n.to_le_bytes());
    let mut bytes = [0u8; ID_SIZE];
    bytes.copy_from_slice(&digest);
    Id::new(bytes)
}

fn timestamp(n: u64) -> u64 {
    100 + (n % 5000)
}

fn vector_of(ns: impl IntoIterator<Item = u64>) -> VectorStorage {
    let mut storage = VectorStorage::new();
    for n in ns {
        storage.insert(timestamp(n), id(n)).unwrap();
    }
    storage.seal().unwrap();
    storage
}

fn collect_items<S: Storage>(storage: &S) -> Vec<(u64, Id, usize)> {
    let mut items = Vec::new();
    storage
        .iterate(0, storage.size(), |item, index| {
            items.push((item.timestamp, item.id, index));
            true
        })
        .unwrap();
    items
}

fn assert_storages_equivalent<A: Storage, B: Storage>(a: &A, b: &B, probes: &mut StdRng) {
    assert_eq!(a.size(), b.size());
    assert_eq!(collect_items(a), collect_items(b));

    let size = a.size();
    assert_eq!(
        a.fingerprint(0, size).unwrap(),
        b.fingerprint(0, size).unwrap()
    );

    for _ in 0..200 {
        let begin = probes.random_range(0..=size);
        let end = probes.random_range(begin..=size);
        assert_eq!(
            a.fingerprint(begin, end).unwrap(),
            b.fingerprint(begin, end).unwrap(),
            "fingerprint {begin}..{end}"
        );
    }

    for _ in 0..200 {
        let probe = probes.random_range(0..6000u64);
        let bound = Bound::with_timestamp(probe);
        assert_eq!(
            a.find_lower_bound(0, &bound).unwrap(),
            b.find_lower_bound(0, &bound).unwrap(),
            "lower bound at {probe}"
        );
    }

    if size > 0 {
        for _ in 0..50 {
            let index = probes.random_range(0..size);
            assert_eq!(a.get_item(index).unwrap(), b.get_item(index).unwrap());
        }
    }
}

#[test]
fn test_btree_random_mutations_match_vector() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut tree = BTreeMem::new();
    let mut reference: BTreeSet<u64> = BTreeSet::new();

    for _ in 0..3000 {
        let n = rng.random_range(0..2000u64);
        if rng.random_range(0..4) == 0 {
            assert_eq!(
                tree.erase(timestamp(n), id(n)).unwrap(),
                reference.remove(&n)
            );
        } else {
            assert_eq!(
                tree.insert(timestamp(n), id(n)).unwrap(),
                reference.insert(n)
            );
        }
    }
    tree.check_invariants().unwrap();

    let vector = vector_of(reference.iter().copied());
    assert_storages_equivalent(&tree, &vector, &mut rng);
}

#[test]
fn test_insertion_order_does_not_matter() {
    let forward: Vec<u64> = (0..1000).collect();
    let backward: Vec<u64> = (0..1000).rev().collect();
    let strided: Vec<u64> = (0..1000).map(|n| (n * 769) % 1000).collect();

    let mut fingerprints = Vec::new();
    for order in [forward, backward, strided] {
        let mut tree = BTreeMem::new();
        for n in order {
            assert!(tree.insert(timestamp(n), id(n)).unwrap());
        }
        tree.check_invariants().unwrap();
        fingerprints.push(tree.fingerprint(0, tree.size()).unwrap());
    }

    assert_eq!(fingerprints[0], fingerprints[1]);
    assert_eq!(fingerprints[0], fingerprints[2]);
}

#[test]
fn test_persistent_tree_matches_vector_after_reopen() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut kv = MemKv::new();
    let mut reference: BTreeSet<u64> = BTreeSet::new();

    // build across several separately committed batches
    for batch in 0..5 {
        let mut tree = BTreePersist::open(&mut kv, 3).unwrap();
        for _ in 0..300 {
            let n = rng.random_range(0..1500u64);
            if batch > 0 && rng.random_range(0..5) == 0 {
                assert_eq!(
                    tree.erase(timestamp(n), id(n)).unwrap(),
                    reference.remove(&n)
                );
            } else {
                assert_eq!(
                    tree.insert(timestamp(n), id(n)).unwrap(),
                    reference.insert(n)
                );
            }
        }
        tree.check_invariants().unwrap();
        tree.commit().unwrap();
    }

    let tree = BTreePersist::open(&mut kv, 3).unwrap();
    tree.check_invariants().unwrap();
    let vector = vector_of(reference.iter().copied());
    assert_storages_equivalent(&tree, &vector, &mut rng);
}

#[test]
fn test_uncommitted_batch_is_invisible() {
    let mut kv = MemKv::new();
    {
        let mut tree = BTreePersist::open(&mut kv, 1).unwrap();
        for n in 0..100 {
            tree.insert(timestamp(n), id(n)).unwrap();
        }
        tree.commit().unwrap();
    }
    {
        let mut tree = BTreePersist::open(&mut kv, 1).unwrap();
        for n in 100..200 {
            tree.insert(timestamp(n), id(n)).unwrap();
        }
        assert_eq!(tree.size(), 200);
        // dropped without commit
    }

    let tree = BTreePersist::open(&mut kv, 1).unwrap();
    assert_eq!(tree.size(), 100);
    tree.check_invariants().unwrap();
}

#[test]
fn test_subrange_over_any_backend() {
    let mut rng = StdRng::seed_from_u64(11);

    let big_vector = vector_of(0..1000);
    let mut big_tree = BTreeMem::new();
    for n in 0..1000 {
        big_tree.insert(timestamp(n), id(n)).unwrap();
    }

    let small = vector_of(400..600);

    let lower = Bound::with_timestamp(timestamp(400));
    let upper = Bound::with_timestamp(timestamp(600));

    let vector_window = SubRange::new(&big_vector, lower, upper).unwrap();
    assert_storages_equivalent(&vector_window, &small, &mut rng);

    let tree_window = SubRange::new(&big_tree, lower, upper).unwrap();
    assert_storages_equivalent(&tree_window, &small, &mut rng);
}
