mod common;

use common::with_map;

use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bucketmap::HashMap;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn new() {
    with_map::<usize, usize>(|map| drop(map()));
}

#[test]
fn insert() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        let old = map.insert(42, 0);
        assert!(old.is_none());
        assert_eq!(map.len(), 1);
    });
}

#[test]
fn get_empty() {
    with_map::<usize, usize>(|map| {
        let map = map();
        assert!(map.get(&42).is_none());
        assert!(map.is_empty());
    });
}

#[test]
fn remove_empty() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        assert!(map.remove(&42).is_none());
    });
}

#[test]
fn insert_and_remove() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        map.insert(42, 0);
        assert_eq!(map.remove(&42), Some(0));
        assert!(map.get(&42).is_none());
        assert!(map.is_empty());
    });
}

#[test]
fn insert_and_get() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        map.insert(42, 0);
        assert_eq!(map.get(&42), Some(&0));
        assert!(map.contains_key(&42));
        assert!(!map.contains_key(&43));
    });
}

#[test]
fn insert_and_get_key_value() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        map.insert(42, 0);
        assert_eq!(map.get_key_value(&42), Some((&42, &0)));
        assert_eq!(map.get_key_value(&43), None);
    });
}

#[test]
fn reinsert() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        map.insert(42, 0);
        assert_eq!(map.insert(42, 1), Some(0));
        assert_eq!(map.get(&42), Some(&1));
        assert_eq!(map.len(), 1);
    });
}

#[test]
fn remove_entry() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        map.insert(42, 7);
        assert_eq!(map.remove_entry(&42), Some((42, 7)));
        assert_eq!(map.remove_entry(&42), None);
    });
}

#[test]
fn clear() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        for i in 0..100 {
            map.insert(i, i);
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.get(&3), None);

        // The map stays usable after a clear.
        map.insert(3, 30);
        assert_eq!(map.get(&3), Some(&30));
        assert_eq!(map.len(), 1);
    });
}

#[test]
fn round_trip() {
    with_map::<i32, i32>(|map| {
        let mut map = map();
        map.insert(1, 100);
        map.insert(2, 200);
        map.insert(3, 300);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&2), Some(&200));
        assert_eq!(map.get(&4), None);

        map.remove(&2);
        assert_eq!(map.len(), 2);

        let mut entries: Vec<_> = map.iter().map(|(&k, &v)| (k, v)).collect();
        entries.sort_unstable();
        assert_eq!(entries, [(1, 100), (3, 300)]);
    });
}

#[test]
fn grow() {
    // Forces at least one doubling from the smallest table.
    let mut map = HashMap::new();
    for i in 0..64usize {
        map.insert(i, i * 10);
    }
    assert_eq!(map.len(), 64);
    for i in 0..64 {
        assert_eq!(map.get(&i), Some(&(i * 10)));
    }
}

#[test]
fn many_entries() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        for i in 0..4096 {
            map.insert(i, !i);
        }
        assert_eq!(map.len(), 4096);
        for i in 0..4096 {
            assert_eq!(map.get(&i), Some(&!i));
        }

        // Remove the odd half, keep the even half.
        for i in (1..4096).step_by(2) {
            assert_eq!(map.remove(&i), Some(!i));
        }
        assert_eq!(map.len(), 2048);
        for i in 0..4096 {
            if i % 2 == 0 {
                assert_eq!(map.get(&i), Some(&!i));
            } else {
                assert_eq!(map.get(&i), None);
            }
        }
    });
}

#[test]
fn mixed_against_oracle() {
    with_map::<u16, u32>(|map| {
        let mut map = map();
        let mut oracle = StdHashMap::new();
        let mut rng = StdRng::seed_from_u64(0xB1C2_D3E4);

        for step in 0..10_000 {
            let key = rng.gen_range(0..800u16);
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let value: u32 = rng.gen();
                    assert_eq!(map.insert(key, value), oracle.insert(key, value));
                }
                2 => assert_eq!(map.remove(&key), oracle.remove(&key)),
                _ => assert_eq!(map.get(&key), oracle.get(&key)),
            }
            if step % 512 == 0 {
                assert_eq!(map.len(), oracle.len());
            }
        }

        assert_eq!(map.len(), oracle.len());
        for (key, value) in map.iter() {
            assert_eq!(oracle.get(key), Some(value));
        }
    });
}

#[test]
fn iterate() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        for i in 0..32 {
            map.insert(i, i + 1);
        }

        let mut seen = vec![0u32; 32];
        for (&k, &v) in map.iter() {
            assert_eq!(v, k + 1);
            seen[k] += 1;
        }
        assert!(seen.iter().all(|&n| n == 1));
        assert_eq!(map.iter().count(), map.len());
    });
}

#[test]
fn iterate_empty() {
    with_map::<usize, usize>(|map| {
        let map = map();
        assert_eq!(map.iter().next(), None);
        assert_eq!(map.keys().next(), None);
        assert_eq!(map.values().next(), None);
    });
}

#[test]
fn keys_and_values() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        for i in 0..16 {
            map.insert(i, 100 + i);
        }
        let mut keys: Vec<_> = map.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..16).collect::<Vec<_>>());

        let mut values: Vec<_> = map.values().copied().collect();
        values.sort_unstable();
        assert_eq!(values, (100..116).collect::<Vec<_>>());
    });
}

#[test]
fn iteration_order_is_randomized() {
    let mut map = HashMap::new();
    for i in 0..32usize {
        map.insert(i, i);
    }

    // The first key yielded must not be concentrated on one entry over
    // repeated iterations.
    let mut firsts = StdHashMap::new();
    for _ in 0..100 {
        let (&first, _) = map.iter().next().unwrap();
        *firsts.entry(first).or_insert(0u32) += 1;
    }
    assert!(
        firsts.len() >= 4,
        "100 iterations started on only {} distinct keys",
        firsts.len()
    );
}

#[test]
fn into_iter_drains() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        for i in 0..100 {
            map.insert(i, i * 2);
        }

        let mut entries: Vec<_> = map.into_iter().collect();
        entries.sort_unstable();
        assert_eq!(entries.len(), 100);
        for (i, entry) in entries.into_iter().enumerate() {
            assert_eq!(entry, (i, i * 2));
        }
    });
}

/// A value whose drops are tallied, to account for every entry the map owns.
struct Counted {
    value: usize,
    drops: Arc<AtomicUsize>,
}

impl Counted {
    fn new(value: usize, drops: &Arc<AtomicUsize>) -> Counted {
        Counted {
            value,
            drops: drops.clone(),
        }
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn drops_are_balanced() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut created = 0;

    {
        let mut map = HashMap::new();
        for i in 0..200usize {
            map.insert(i, Counted::new(i, &drops));
            created += 1;
        }
        // Overwrites release the old values.
        for i in 0..50usize {
            map.insert(i, Counted::new(i, &drops));
            created += 1;
        }
        assert_eq!(drops.load(Ordering::SeqCst), 50);

        // Removed values drop with the caller.
        for i in 50..100usize {
            let value = map.remove(&i).unwrap();
            assert_eq!(value.value, i);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 100);

        // A clear drops the 150 entries still stored.
        map.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 250);

        for i in 0..30usize {
            map.insert(i, Counted::new(i, &drops));
            created += 1;
        }
        // The rest drop with the map itself.
    }

    assert_eq!(drops.load(Ordering::SeqCst), created);
}

#[test]
fn into_iter_partial_consumption() {
    let drops = Arc::new(AtomicUsize::new(0));

    {
        let mut map = HashMap::new();
        for i in 0..32usize {
            map.insert(i, Counted::new(i, &drops));
        }

        let mut iter = map.into_iter();
        for _ in 0..5 {
            let (key, value) = iter.next().unwrap();
            assert_eq!(key, value.value);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
        // Dropping the iterator drops the undrained rest exactly once.
    }

    assert_eq!(drops.load(Ordering::SeqCst), 32);
}

#[test]
fn string_keys() {
    with_map::<String, String>(|map| {
        let mut map = map();
        for i in 0..300 {
            map.insert(format!("key-{i}"), format!("value-{i}"));
        }
        assert_eq!(map.len(), 300);
        assert_eq!(map.get(&"key-7".to_string()), Some(&"value-7".to_string()));
        assert_eq!(
            map.insert("key-7".into(), "updated".into()),
            Some("value-7".to_string())
        );
        assert_eq!(map.remove(&"key-8".to_string()), Some("value-8".into()));
        assert_eq!(map.get(&"key-8".to_string()), None);
        assert_eq!(map.len(), 299);
    });
}

#[test]
fn large_keys_and_values() {
    // Over the inline threshold on both sides, forcing indirect storage.
    type BigKey = [u64; 32];
    type BigValue = [u8; 200];

    let big_key = |i: u64| -> BigKey { [i; 32] };
    let big_value = |i: u64| -> BigValue { [i as u8; 200] };

    with_map::<BigKey, BigValue>(|map| {
        let mut map = map();
        for i in 0..100 {
            map.insert(big_key(i), big_value(i));
        }
        assert_eq!(map.len(), 100);
        for i in 0..100 {
            assert_eq!(map.get(&big_key(i)), Some(&big_value(i)));
        }
        assert_eq!(map.insert(big_key(4), big_value(44)), Some(big_value(4)));
        assert_eq!(map.remove(&big_key(5)), Some(big_value(5)));
        assert_eq!(map.get(&big_key(5)), None);
        assert_eq!(map.len(), 99);
    });
}

#[test]
fn zero_sized_values() {
    let mut map = HashMap::new();
    for i in 0..100usize {
        map.insert(i, ());
    }
    assert_eq!(map.len(), 100);
    assert_eq!(map.get(&7), Some(&()));
    assert_eq!(map.remove(&7), Some(()));
    assert_eq!(map.len(), 99);
}

#[test]
fn extend_and_collect() {
    let mut map: HashMap<usize, usize> = (0..10).map(|i| (i, i)).collect();
    map.extend((10..20).map(|i| (i, i)));
    assert_eq!(map.len(), 20);
    for i in 0..20 {
        assert_eq!(map.get(&i), Some(&i));
    }
}

#[test]
fn eq_ignores_order() {
    let forward: HashMap<usize, usize> = (0..100).map(|i| (i, i)).collect();
    let backward: HashMap<usize, usize> = (0..100).rev().map(|i| (i, i)).collect();
    assert_eq!(forward, backward);

    let mut changed = backward;
    changed.insert(3, 999);
    assert_ne!(forward, changed);
}

#[test]
fn debug() {
    let mut map = HashMap::new();
    map.insert(1usize, 2usize);
    assert_eq!(format!("{map:?}"), "{1: 2}");
}
