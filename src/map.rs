use crate::raw::{zero_val, RawIter, RawMap, TypeDesc};

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;

/// A hash map with incrementally rehashed storage.
///
/// The map is backed by an array of eight-entry buckets with overflow
/// chaining. Growing the table never moves all entries at once: writes
/// migrate a couple of bucket chains each until the old array drains, so
/// no single insert pays for a full rehash. Iteration order is randomized
/// on every iterator; do not depend on it.
///
/// Unlike the standard library map, lookups take the key type itself
/// (`&K`): every key operation funnels through a per-instantiation type
/// descriptor, which has no way to hash or compare borrowed forms of the
/// key.
pub struct HashMap<K, V, S = RandomState> {
    raw: RawMap,
    desc: TypeDesc,
    /// Boxed for a stable address: the descriptor's hash hook refers to it.
    hash_builder: Box<S>,
    _kv: PhantomData<(K, V)>,
}

// Safety: we only hand out &K/&V through shared references to the map, and
// mutation requires &mut. The raw pointers inside `desc` refer to the boxed
// hash builder owned by this map.
unsafe impl<K: Send, V: Send, S: Send> Send for HashMap<K, V, S> {}
unsafe impl<K: Sync, V: Sync, S: Sync> Sync for HashMap<K, V, S> {}

impl<K, V> HashMap<K, V>
where
    K: Hash + Eq,
{
    /// Creates an empty `HashMap`.
    ///
    /// The map does not allocate until it is first inserted into.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// ```
    pub fn new() -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(0, RandomState::new())
    }

    /// Creates an empty `HashMap` that can hold at least `capacity` elements
    /// before growing.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::with_capacity(10);
    /// ```
    pub fn with_capacity(capacity: usize) -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an empty `HashMap` which will use the given hash builder to
    /// hash keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is
    /// designed to allow maps to be resistant to attacks that cause many
    /// collisions and very poor performance. Setting it manually using this
    /// function can expose a DoS attack vector.
    pub fn with_hasher(hash_builder: S) -> HashMap<K, V, S> {
        HashMap::with_capacity_and_hasher(0, hash_builder)
    }

    /// Creates an empty `HashMap` with at least the specified capacity,
    /// using `hash_builder` to hash the keys.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> HashMap<K, V, S> {
        let hash_builder = Box::new(hash_builder);
        let desc = TypeDesc::new::<K, V, S>(&hash_builder);
        let raw = if capacity == 0 {
            RawMap::new_small()
        } else {
            RawMap::with_capacity(&desc, capacity)
        };

        HashMap {
            raw,
            desc,
            hash_builder,
            _kv: PhantomData,
        }
    }

    /// Returns a reference to the map's [`BuildHasher`].
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Returns the number of entries in the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// map.insert(2, "b");
    /// assert_eq!(map.len(), 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.get(&1), Some(&"a"));
    /// assert_eq!(map.get(&2), None);
    /// ```
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        // Safety: `desc` is this map's descriptor and `key` is a live `K`.
        unsafe {
            let (value, present) = self.raw.get_present(&self.desc, (key as *const K).cast());
            present.then(|| &*value.cast::<V>())
        }
    }

    /// Returns the key-value pair corresponding to the key, with the
    /// returned key being the one stored in the map.
    #[inline]
    pub fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        // Safety: as for `get`.
        unsafe {
            let (k, v) = self.raw.get_key_value(&self.desc, (key as *const K).cast());
            if k.is_null() {
                return None;
            }
            Some((&*k.cast::<K>(), &*v.cast::<V>()))
        }
    }

    /// Returns `true` if the map contains a value for the key.
    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        // Safety: as for `get`. A hit can never alias the zero block.
        unsafe { self.raw.get(&self.desc, (key as *const K).cast()) != zero_val() }
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the key was already present the value is replaced and the old
    /// value returned; the key itself is not updated.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// assert_eq!(map.insert(37, "a"), None);
    /// assert_eq!(map.insert(37, "b"), Some("a"));
    /// assert_eq!(map.get(&37), Some(&"b"));
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        // Safety: `desc` is this map's descriptor; the slot returned by
        // `put` is ours to initialize before any other map operation runs.
        unsafe {
            let (slot, existed) = self.raw.put(&self.desc, (&key as *const K).cast());
            let slot = slot.cast::<V>();
            if existed {
                // The table kept its own key; ours drops here.
                let old = slot.read();
                slot.write(value);
                Some(old)
            } else {
                // The table took the key's bytes; don't drop them twice.
                mem::forget(key);
                slot.write(value);
                None
            }
        }
    }

    /// Removes a key from the map, returning the stored value if the key
    /// was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove(&1), Some("a"));
    /// assert_eq!(map.remove(&1), None);
    /// ```
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let mut value = MaybeUninit::<V>::uninit();
        // Safety: as for `get`; the out pointer is valid for a `V` write.
        unsafe {
            self.raw
                .delete(
                    &self.desc,
                    (key as *const K).cast(),
                    ptr::null_mut(),
                    value.as_mut_ptr().cast(),
                )
                .then(|| value.assume_init())
        }
    }

    /// Removes a key from the map, returning the stored key and value if
    /// the key was present.
    pub fn remove_entry(&mut self, key: &K) -> Option<(K, V)> {
        let mut stored_key = MaybeUninit::<K>::uninit();
        let mut value = MaybeUninit::<V>::uninit();
        // Safety: as for `remove`.
        unsafe {
            self.raw
                .delete(
                    &self.desc,
                    (key as *const K).cast(),
                    stored_key.as_mut_ptr().cast(),
                    value.as_mut_ptr().cast(),
                )
                .then(|| (stored_key.assume_init(), value.assume_init()))
        }
    }

    /// Clears the map, removing all key-value pairs while keeping the
    /// allocated bucket array for reuse.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// map.clear();
    /// assert!(map.is_empty());
    /// ```
    pub fn clear(&mut self) {
        // Safety: `&mut self` guarantees no live iterator.
        unsafe { self.raw.clear(&self.desc) }
    }

    /// An iterator visiting all key-value pairs in arbitrary order, as
    /// `(&K, &V)`.
    ///
    /// The traversal order is randomized each time an iterator is created.
    ///
    /// # Examples
    ///
    /// ```
    /// use bucketmap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert("a", 1);
    /// map.insert("b", 2);
    ///
    /// for (key, value) in map.iter() {
    ///     println!("{key}: {value}");
    /// }
    /// ```
    pub fn iter(&self) -> Iter<'_, K, V> {
        // Safety: `desc` is this map's descriptor, and the iterator borrows
        // the map, so it cannot outlive it nor overlap a mutation.
        Iter {
            it: unsafe { self.raw.iter(&self.desc) },
            raw: &self.raw,
            desc: &self.desc,
            _kv: PhantomData,
        }
    }

    /// An iterator visiting all keys in arbitrary order.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { iter: self.iter() }
    }

    /// An iterator visiting all values in arbitrary order.
    pub fn values(&self) -> Values<'_, K, V> {
        Values { iter: self.iter() }
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // Safety: the descriptor matches; the arrays are freed right after.
        unsafe { self.raw.drop_entries(&self.desc) }
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn default() -> HashMap<K, V, S> {
        HashMap::with_hasher(S::default())
    }
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: Hash + Eq + fmt::Debug,
    V: fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.iter()
            .all(|(key, value)| other.get(key) == Some(value))
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Extend<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for HashMap<K, V, S>
where
    K: Hash + Eq + Copy,
    V: Copy,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        for (&key, &value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> HashMap<K, V, S> {
        let mut iter = iter.into_iter();
        let (lower, _) = iter.size_hint();
        let mut map = HashMap::with_capacity_and_hasher(lower, S::default());
        for (key, value) in &mut iter {
            map.insert(key, value);
        }
        map
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

impl<K, V, S> IntoIterator for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = IntoIter<K, V, S>;

    /// Creates a consuming iterator visiting all key-value pairs in
    /// arbitrary order.
    fn into_iter(self) -> IntoIter<K, V, S> {
        // Safety: the iterator owns the map and drains entries through it.
        let it = unsafe { self.raw.iter(&self.desc) };
        IntoIter { map: self, it }
    }
}

/// An iterator over a map's entries.
///
/// This struct is created by the [`iter`](HashMap::iter) method on
/// [`HashMap`]. See its documentation for details.
pub struct Iter<'a, K, V> {
    it: RawIter,
    raw: &'a RawMap,
    desc: &'a TypeDesc,
    _kv: PhantomData<(&'a K, &'a V)>,
}

impl<'a, K: 'a, V: 'a> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<(&'a K, &'a V)> {
        if self.it.key.is_null() {
            return None;
        }
        // Safety: non-null iterator pointers refer to a live entry, valid
        // for `'a` since the map is borrowed and cannot be mutated.
        unsafe {
            let key = &*self.it.key.cast::<K>();
            let value = &*self.it.value.cast::<V>();
            self.it.next(self.raw, self.desc);
            Some((key, value))
        }
    }
}

impl<K, V> fmt::Debug for Iter<'_, K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(Iter::<K, V> {
                it: self.it.clone(),
                raw: self.raw,
                desc: self.desc,
                _kv: PhantomData,
            })
            .finish()
    }
}

/// An iterator over a map's keys.
///
/// This struct is created by the [`keys`](HashMap::keys) method on
/// [`HashMap`]. See its documentation for details.
pub struct Keys<'a, K, V> {
    iter: Iter<'a, K, V>,
}

impl<'a, K: 'a, V: 'a> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    #[inline]
    fn next(&mut self) -> Option<&'a K> {
        let (key, _) = self.iter.next()?;
        Some(key)
    }
}

/// An iterator over a map's values.
///
/// This struct is created by the [`values`](HashMap::values) method on
/// [`HashMap`]. See its documentation for details.
pub struct Values<'a, K, V> {
    iter: Iter<'a, K, V>,
}

impl<'a, K: 'a, V: 'a> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    #[inline]
    fn next(&mut self) -> Option<&'a V> {
        let (_, value) = self.iter.next()?;
        Some(value)
    }
}

/// An owning iterator over a map's entries.
///
/// This struct is created by the `into_iter` method on [`HashMap`]. Yielded
/// entries are removed from the map as the iterator advances; dropping the
/// iterator early drops the remaining entries with the map.
pub struct IntoIter<K, V, S = RandomState> {
    map: HashMap<K, V, S>,
    it: RawIter,
}

impl<K, V, S> Iterator for IntoIter<K, V, S> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if self.it.key.is_null() {
                return None;
            }
            // Safety: the yielded key pointer stays valid across the
            // advance (which only reads), and `delete` moves the entry out
            // before any later mutation.
            unsafe {
                let key_ptr = self.it.key;
                self.it.next(&self.map.raw, &self.map.desc);

                let mut key = MaybeUninit::<K>::uninit();
                let mut value = MaybeUninit::<V>::uninit();
                if self.map.raw.delete(
                    &self.map.desc,
                    key_ptr,
                    key.as_mut_ptr().cast(),
                    value.as_mut_ptr().cast(),
                ) {
                    return Some((key.assume_init(), value.assume_init()));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.map.raw.len();
        (len, Some(len))
    }
}
