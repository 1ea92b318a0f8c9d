use std::alloc::Layout;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem;

use super::alloc::{BucketLayout, BUCKET_ALIGN};
use super::{MAX_KEY_INLINE, MAX_VALUE_INLINE};

/// Everything the raw table needs to know about one `(K, V)` instantiation.
///
/// The table itself stores untyped bytes; all sizes, offsets, and per-type
/// operations flow through this record. The generic facade builds one
/// descriptor per map and passes it to every raw call.
pub(crate) struct TypeDesc {
    /// Per-bucket address arithmetic derived from the slot sizes.
    pub bucket: BucketLayout,

    /// True size and alignment of the key type, independent of how the
    /// slot stores it.
    pub key_size: usize,
    pub key_align: usize,
    pub val_size: usize,
    pub val_align: usize,

    /// Whether the key slot holds a pointer to a separate allocation rather
    /// than the key itself. Set for types too large (or too aligned) to
    /// store inline.
    pub indirect_key: bool,
    pub indirect_value: bool,

    /// Whether `equal(k, k)` always holds. False for NaN-like key types,
    /// which need special handling during evacuation and iteration.
    pub reflexive_key: bool,

    /// Whether an insert over an existing key must overwrite the stored key
    /// with the caller's bytes (key types with distinguishable equal
    /// representations).
    pub needs_key_update: bool,

    /// Whether the hash hook may panic on some inputs. If set, lookups on an
    /// empty table still invoke the hook to preserve the panic.
    pub hash_may_panic: bool,

    /// Whether any slot owns resources: a drop hook or an indirect
    /// allocation. Controls whether evacuated bucket memory is scrubbed.
    pub owned_slots: bool,

    /// Type-erased pointer to the map's `BuildHasher`, passed back to
    /// `hash` on every call.
    pub hasher: *const (),

    /// `hash(hasher, key, seed)`: the full hash of the key behind `key`.
    pub hash: unsafe fn(*const (), *const u8, u32) -> u64,

    /// Key equality. Both pointers refer to actual keys, never to
    /// indirect slots.
    pub equal: unsafe fn(*const u8, *const u8) -> bool,

    /// Drop hooks, absent for plain-data types.
    pub drop_key: Option<unsafe fn(*mut u8)>,
    pub drop_value: Option<unsafe fn(*mut u8)>,
}

/// Whether a type of this size and alignment is stored inline in the bucket.
/// Types over the size threshold, or aligned stricter than the bucket
/// blocks, live behind a pointer instead.
fn inline(size: usize, align: usize, max: usize) -> bool {
    size <= max && align <= BUCKET_ALIGN
}

unsafe fn hash_key<K: Hash, S: BuildHasher>(hasher: *const (), key: *const u8, seed: u32) -> u64 {
    let build_hasher = unsafe { &*hasher.cast::<S>() };
    let mut h = build_hasher.build_hasher();
    // Folding the per-map seed in first randomizes hashes (and therefore
    // bucket placement and iteration order) across map instances even under
    // a deterministic build hasher.
    h.write_u32(seed);
    unsafe { &*key.cast::<K>() }.hash(&mut h);
    h.finish()
}

unsafe fn equal_key<K: PartialEq>(a: *const u8, b: *const u8) -> bool {
    unsafe { &*a.cast::<K>() == &*b.cast::<K>() }
}

unsafe fn drop_erased<T>(p: *mut u8) {
    unsafe { p.cast::<T>().drop_in_place() }
}

impl TypeDesc {
    /// Builds the descriptor for a `(K, V)` map hashed by `S`.
    ///
    /// The caller keeps `build_hasher` at a stable address (the facade boxes
    /// it) for as long as the descriptor is used.
    pub(crate) fn new<K, V, S>(build_hasher: &S) -> TypeDesc
    where
        K: Hash + PartialEq,
        S: BuildHasher,
    {
        let (key_size, key_align) = (mem::size_of::<K>(), mem::align_of::<K>());
        let (val_size, val_align) = (mem::size_of::<V>(), mem::align_of::<V>());

        let indirect_key = !inline(key_size, key_align, MAX_KEY_INLINE);
        let indirect_value = !inline(val_size, val_align, MAX_VALUE_INLINE);

        let key_slot = if indirect_key {
            mem::size_of::<*mut u8>()
        } else {
            key_size
        };
        let val_slot = if indirect_value {
            mem::size_of::<*mut u8>()
        } else {
            val_size
        };

        TypeDesc {
            bucket: BucketLayout::new(key_slot, val_slot),
            key_size,
            key_align,
            val_size,
            val_align,
            indirect_key,
            indirect_value,
            // `K: Eq` at the facade boundary; only hand-built descriptors
            // (for NaN-like keys) clear this.
            reflexive_key: true,
            needs_key_update: false,
            hash_may_panic: false,
            owned_slots: indirect_key
                || indirect_value
                || mem::needs_drop::<K>()
                || mem::needs_drop::<V>(),
            hasher: (build_hasher as *const S).cast(),
            hash: hash_key::<K, S>,
            equal: equal_key::<K>,
            drop_key: mem::needs_drop::<K>().then_some(drop_erased::<K> as unsafe fn(*mut u8)),
            drop_value: mem::needs_drop::<V>().then_some(drop_erased::<V> as unsafe fn(*mut u8)),
        }
    }

    #[inline]
    pub(crate) unsafe fn hash_of(&self, key: *const u8, seed: u32) -> u64 {
        unsafe { (self.hash)(self.hasher, key, seed) }
    }

    /// Allocation layout of an indirect key referent.
    #[inline]
    pub(crate) fn key_layout(&self) -> Layout {
        Layout::from_size_align(self.key_size, self.key_align).unwrap()
    }

    /// Allocation layout of an indirect value referent.
    #[inline]
    pub(crate) fn value_layout(&self) -> Layout {
        Layout::from_size_align(self.val_size, self.val_align).unwrap()
    }
}
