use std::hash::Hash;

use bucketmap::HashMap;

// Run the test on different configurations of a `HashMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V>))
where
    K: Hash + Eq,
{
    // Lazy allocation: buckets appear on the first insert.
    test(&HashMap::new);

    // Pre-sized with a single bucket's worth of capacity.
    test(&(|| HashMap::with_capacity(8)));

    // Pre-sized large enough to carry a pre-allocated overflow pool.
    test(&(|| HashMap::with_capacity(1_000)));
}
