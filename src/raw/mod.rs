//! The core hash table.
//!
//! Data is arranged into an array of buckets, each holding up to
//! [`BUCKET_CNT`] key/value pairs. The low-order bits of a key's hash select
//! a bucket; each bucket keeps one byte of high-order hash bits ("tophash")
//! per entry to cheapen comparisons within the bucket. Buckets that fill up
//! chain onto overflow buckets.
//!
//! When the table outgrows its load factor the bucket array is doubled and
//! entries are migrated incrementally, a bucket chain at a time, by
//! subsequent writes. A table drowning in sparse overflow chains is instead
//! rebuilt at the same size to compact them. Iterators walk the bucket array
//! in a randomized order and know how to traverse a half-migrated table.
//!
//! Everything here is type-erased: buckets are raw byte buffers and the
//! per-type sizes and operations come in through a [`TypeDesc`]. The safe,
//! generic view lives in `crate::map`.

mod alloc;
mod desc;
mod utils;

pub(crate) use desc::TypeDesc;

use std::alloc as heap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use self::alloc::{BucketArray, BucketLayout, OverflowRegistry};
use utils::{bucket_mask, bucket_shift, rand32};

pub(crate) use self::alloc::zero_val;

/// Maximum number of key/value pairs a bucket can hold.
pub(crate) const BUCKET_CNT_BITS: u32 = 3;
pub(crate) const BUCKET_CNT: usize = 1 << BUCKET_CNT_BITS;

/// Maximum average load of a bucket that triggers growth is 6.5,
/// represented as a fraction to allow integer math.
const LOAD_FACTOR_NUM: usize = 13;
const LOAD_FACTOR_DEN: usize = 2;

/// Maximum key or value size to keep inline (instead of allocating per
/// entry).
pub(crate) const MAX_KEY_INLINE: usize = 128;
pub(crate) const MAX_VALUE_INLINE: usize = 128;

// Possible tophash values. A few low values are reserved as markers; a cell
// holding a real entry always carries a byte >= MIN_TOP_HASH. A bucket
// (including its overflow chain) has either all or none of its entries in
// the evacuated states, except transiently inside `evacuate`, which runs
// under writer exclusivity.

/// This cell is empty, and there are no more non-empty cells at higher
/// indexes or overflows.
pub(crate) const EMPTY_REST: u8 = 0;
/// This cell is empty.
pub(crate) const EMPTY_ONE: u8 = 1;
/// Entry was valid and has been evacuated to the first half of the larger
/// table.
pub(crate) const EVACUATED_X: u8 = 2;
/// Same, but evacuated to the second half.
pub(crate) const EVACUATED_Y: u8 = 3;
/// Cell was empty when its bucket was evacuated.
pub(crate) const EVACUATED_EMPTY: u8 = 4;
/// Minimum tophash for a normal filled cell.
pub(crate) const MIN_TOP_HASH: u8 = 5;

// The iterator mirrors evacuation decisions for NaN-like keys off the low
// bit of these markers.
const _: () = assert!(EVACUATED_X + 1 == EVACUATED_Y && EVACUATED_X ^ 1 == EVACUATED_Y);

// Header flags.

/// There may be an iterator using the bucket array.
const ITERATOR: u8 = 1;
/// There may be an iterator using the old bucket array.
const OLD_ITERATOR: u8 = 2;
/// A writer is inside a mutating operation.
const WRITING: u8 = 4;
/// The grow in progress keeps the bucket count unchanged.
const SAME_SIZE_GROW: u8 = 8;

/// Sentinel bucket index for iterators that need no destination check.
const NO_CHECK: usize = usize::MAX;

/// Reports whether a tophash byte represents an empty cell.
#[inline]
fn is_empty_cell(x: u8) -> bool {
    x <= EMPTY_ONE
}

/// The tophash byte for a full hash, biased past the marker range.
#[inline]
fn top_hash(hash: u64) -> u8 {
    let top = (hash >> (u64::BITS - 8)) as u8;
    if top < MIN_TOP_HASH {
        top + MIN_TOP_HASH
    } else {
        top
    }
}

/// Reports whether the bucket at `b` has been evacuated.
///
/// # Safety
///
/// `b` must point at a live bucket laid out by `bl`.
#[inline]
unsafe fn evacuated(bl: &BucketLayout, b: *mut u8) -> bool {
    let h = unsafe { *bl.tophash(b, 0) };
    h > EMPTY_ONE && h < MIN_TOP_HASH
}

/// Reports whether `count` items placed in `1 << b` buckets exceed the load
/// factor.
#[inline]
fn over_load_factor(count: usize, b: u8) -> bool {
    count > BUCKET_CNT && count > LOAD_FACTOR_NUM * (bucket_shift(b) / LOAD_FACTOR_DEN)
}

/// Reports whether `noverflow` overflow buckets is too many for a table with
/// `1 << b` buckets: approximately as many overflow buckets as regular
/// buckets. Most of these must be in sparse use, otherwise the load factor
/// would already have forced a regular grow.
#[inline]
fn too_many_overflow_buckets(noverflow: u16, b: u8) -> bool {
    noverflow as usize >= 1 << b.min(15)
}

/// Optional header fields: the overflow registries and the cursor into the
/// pre-allocated overflow pool.
struct MapExtra {
    /// Owns individually allocated overflow buckets of `buckets`.
    overflow: Option<Arc<OverflowRegistry>>,
    /// Owns individually allocated overflow buckets of `old_buckets`.
    old_overflow: Option<Arc<OverflowRegistry>>,
    /// The next free pre-allocated overflow bucket, if any remain.
    next_overflow: Option<NonNull<u8>>,
}

// Safety: the pool cursor is only touched by the single active writer.
unsafe impl Send for MapExtra {}
unsafe impl Sync for MapExtra {}

/// The table header.
///
/// All operations take the [`TypeDesc`] of the instantiation that created
/// the table; passing any other descriptor is undefined behavior. Callers
/// must uphold the single-writer contract: at most one mutating operation at
/// a time, and no reads or iteration concurrent with it. Violations are
/// detected on a best-effort basis and abort via panic.
pub(crate) struct RawMap {
    /// Live entry count.
    count: usize,
    flags: AtomicU8,
    /// log2 of the bucket count.
    b: u8,
    /// Approximate number of overflow buckets; see `incr_noverflow`.
    noverflow: u16,
    /// Hash seed, folded into every key hash for this table.
    seed: u32,

    /// The bucket array, `1 << b` buckets. None until the first insert.
    buckets: Option<Arc<BucketArray>>,
    /// The previous bucket array, present only while growing.
    old_buckets: Option<Arc<BucketArray>>,
    /// Evacuation progress: old buckets below this index have been drained.
    nevacuate: usize,

    extra: Option<Box<MapExtra>>,
}

impl RawMap {
    /// Creates a table with no buckets; they are allocated on first insert.
    pub(crate) fn new_small() -> RawMap {
        RawMap {
            count: 0,
            flags: AtomicU8::new(0),
            b: 0,
            noverflow: 0,
            seed: rand32(),
            buckets: None,
            old_buckets: None,
            nevacuate: 0,
            extra: None,
        }
    }

    /// Creates a table sized so `hint` entries fit under the load factor.
    pub(crate) fn with_capacity(desc: &TypeDesc, hint: usize) -> RawMap {
        let mut h = RawMap::new_small();

        // An unsatisfiable hint falls back to lazy allocation.
        let hint = if hint.checked_mul(desc.bucket.size).is_some() {
            hint
        } else {
            0
        };

        let mut b = 0;
        while over_load_factor(hint, b) {
            b += 1;
        }
        h.b = b;

        if b != 0 {
            let (array, next_overflow) = BucketArray::alloc(&desc.bucket, b);
            h.buckets = Some(Arc::new(array));
            h.extra = Some(Box::new(MapExtra {
                overflow: Some(Arc::new(OverflowRegistry::new(&desc.bucket))),
                old_overflow: None,
                next_overflow,
            }));
        }

        h
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[inline]
    fn flag(&self, f: u8) -> bool {
        self.flags.load(Ordering::Relaxed) & f != 0
    }

    #[inline]
    fn set_flag(&self, f: u8) {
        self.flags.fetch_or(f, Ordering::Relaxed);
    }

    #[inline]
    fn clear_flag(&self, f: u8) {
        self.flags.fetch_and(!f, Ordering::Relaxed);
    }

    /// Reports whether a grow is in progress, to the same or a bigger size.
    #[inline]
    fn growing(&self) -> bool {
        self.old_buckets.is_some()
    }

    #[inline]
    fn same_size_grow(&self) -> bool {
        self.flag(SAME_SIZE_GROW)
    }

    /// The number of buckets prior to the current grow.
    #[inline]
    fn nold_buckets(&self) -> usize {
        let mut b = self.b;
        if !self.same_size_grow() {
            b -= 1;
        }
        bucket_shift(b)
    }

    #[inline]
    fn old_bucket_mask(&self) -> usize {
        self.nold_buckets() - 1
    }

    /// Returns a pointer to the value stored for `key`, or the shared zero
    /// block if the key is absent. Never returns null; the returned pointer
    /// must not be written through and is invalidated by the next mutation.
    ///
    /// # Safety
    ///
    /// `desc` is the table's descriptor and `key` points at a live key.
    pub(crate) unsafe fn get(&self, desc: &TypeDesc, key: *const u8) -> *const u8 {
        unsafe { self.get_present(desc, key).0 }
    }

    /// [`get`](Self::get) with an explicit presence flag.
    pub(crate) unsafe fn get_present(&self, desc: &TypeDesc, key: *const u8) -> (*const u8, bool) {
        let bl = &desc.bucket;

        if self.count == 0 {
            if desc.hash_may_panic {
                // Preserve the panic the hash hook would raise on this key.
                unsafe { desc.hash_of(key, 0) };
            }
            return (zero_val(), false);
        }
        if self.flag(WRITING) {
            panic!("concurrent map read and map write");
        }

        let hash = unsafe { desc.hash_of(key, self.seed) };
        let mut m = bucket_mask(self.b);
        let buckets = self.buckets.clone().unwrap();
        let mut b = unsafe { buckets.bucket(hash as usize & m) };

        if let Some(old) = &self.old_buckets {
            if !self.same_size_grow() {
                // There used to be half as many buckets; mask down one more
                // power of two.
                m >>= 1;
            }
            let oldb = unsafe { old.bucket(hash as usize & m) };
            if !unsafe { evacuated(bl, oldb) } {
                b = oldb;
            }
        }

        let top = top_hash(hash);
        'bucketloop: loop {
            for i in 0..BUCKET_CNT {
                let th = unsafe { *bl.tophash(b, i) };
                if th != top {
                    if th == EMPTY_REST {
                        break 'bucketloop;
                    }
                    continue;
                }
                unsafe {
                    let mut k = bl.key(b, i);
                    if desc.indirect_key {
                        k = k.cast::<*mut u8>().read();
                    }
                    if (desc.equal)(key, k) {
                        let mut e = bl.value(b, i);
                        if desc.indirect_value {
                            e = e.cast::<*mut u8>().read();
                        }
                        return (e, true);
                    }
                }
            }
            let ovf = unsafe { bl.overflow(b) };
            if ovf.is_null() {
                break;
            }
            b = ovf;
        }

        (zero_val(), false)
    }

    /// Returns pointers to the stored key and value for `key`, or a pair of
    /// nulls. Used by the iterator to resolve evacuated entries to their
    /// live (canonical) location.
    pub(crate) unsafe fn get_key_value(
        &self,
        desc: &TypeDesc,
        key: *const u8,
    ) -> (*const u8, *const u8) {
        let bl = &desc.bucket;

        if self.count == 0 {
            return (ptr::null(), ptr::null());
        }

        let hash = unsafe { desc.hash_of(key, self.seed) };
        let mut m = bucket_mask(self.b);
        let buckets = self.buckets.clone().unwrap();
        let mut b = unsafe { buckets.bucket(hash as usize & m) };

        if let Some(old) = &self.old_buckets {
            if !self.same_size_grow() {
                m >>= 1;
            }
            let oldb = unsafe { old.bucket(hash as usize & m) };
            if !unsafe { evacuated(bl, oldb) } {
                b = oldb;
            }
        }

        let top = top_hash(hash);
        'bucketloop: loop {
            for i in 0..BUCKET_CNT {
                let th = unsafe { *bl.tophash(b, i) };
                if th != top {
                    if th == EMPTY_REST {
                        break 'bucketloop;
                    }
                    continue;
                }
                unsafe {
                    let mut k = bl.key(b, i);
                    if desc.indirect_key {
                        k = k.cast::<*mut u8>().read();
                    }
                    if (desc.equal)(key, k) {
                        let mut e = bl.value(b, i);
                        if desc.indirect_value {
                            e = e.cast::<*mut u8>().read();
                        }
                        return (k, e);
                    }
                }
            }
            let ovf = unsafe { bl.overflow(b) };
            if ovf.is_null() {
                break;
            }
            b = ovf;
        }

        (ptr::null(), ptr::null())
    }

    /// Finds or allocates the slot for `key` and returns a pointer to its
    /// value cell, which the caller must initialize.
    ///
    /// On a fresh insert (`false` in the returned flag) the caller's key
    /// bytes have been moved into the table and must be forgotten, and the
    /// value cell is uninitialized. If the key already existed the cell
    /// holds the live value, and the caller's key was consumed only when
    /// the descriptor requests key updates.
    ///
    /// # Safety
    ///
    /// As for [`get`](Self::get); additionally requires writer exclusivity.
    pub(crate) unsafe fn put(&mut self, desc: &TypeDesc, key: *const u8) -> (*mut u8, bool) {
        let bl = desc.bucket;

        if self.flag(WRITING) {
            panic!("concurrent map writes");
        }
        let hash = unsafe { desc.hash_of(key, self.seed) };

        // Set WRITING only after calling the hash hook: it may panic, in
        // which case we have not actually done a write.
        self.set_flag(WRITING);

        if self.buckets.is_none() {
            let (array, _) = BucketArray::alloc(&bl, 0);
            self.buckets = Some(Arc::new(array));
            self.extra = Some(Box::new(MapExtra {
                overflow: Some(Arc::new(OverflowRegistry::new(&bl))),
                old_overflow: None,
                next_overflow: None,
            }));
        }

        let top = top_hash(hash);
        loop {
            let bucket = hash as usize & bucket_mask(self.b);
            if self.growing() {
                unsafe { self.grow_work(desc, bucket) };
            }
            // Recompute the bucket address after helping the grow along:
            // evacuation may have swapped the arrays out from under us.
            let buckets = self.buckets.clone().unwrap();
            let mut b = unsafe { buckets.bucket(bucket) };

            let mut insert_top: *mut u8 = ptr::null_mut();
            let mut insert_k: *mut u8 = ptr::null_mut();
            let mut insert_v: *mut u8 = ptr::null_mut();

            'bucketloop: loop {
                for i in 0..BUCKET_CNT {
                    let th = unsafe { *bl.tophash(b, i) };
                    if th != top {
                        if is_empty_cell(th) && insert_top.is_null() {
                            unsafe {
                                insert_top = bl.tophash(b, i);
                                insert_k = bl.key(b, i);
                                insert_v = bl.value(b, i);
                            }
                        }
                        if th == EMPTY_REST {
                            // No cell at a higher index in this chain can
                            // hold the key; an EMPTY_ONE could, further on.
                            break 'bucketloop;
                        }
                        continue;
                    }
                    unsafe {
                        let mut k = bl.key(b, i);
                        if desc.indirect_key {
                            k = k.cast::<*mut u8>().read();
                        }
                        if !(desc.equal)(key, k) {
                            continue;
                        }
                        // Already have a mapping for the key. Update it.
                        if desc.needs_key_update {
                            if let Some(drop_key) = desc.drop_key {
                                drop_key(k);
                            }
                            ptr::copy_nonoverlapping(key, k, desc.key_size);
                        }
                        let e = bl.value(b, i);
                        return (self.put_done(desc, e), true);
                    }
                }
                let ovf = unsafe { bl.overflow(b) };
                if ovf.is_null() {
                    break;
                }
                b = ovf;
            }

            // Did not find a mapping for the key. If we hit the load factor
            // or have too many overflow buckets, and we are not already
            // growing, start growing; that invalidates everything, so retry.
            if !self.growing()
                && (over_load_factor(self.count + 1, self.b)
                    || too_many_overflow_buckets(self.noverflow, self.b))
            {
                unsafe { self.hash_grow(desc) };
                continue;
            }

            unsafe {
                if insert_top.is_null() {
                    // The whole chain is full; hang a new overflow bucket
                    // off its tail and take the first slot.
                    let newb = self.new_overflow(desc, b);
                    insert_top = bl.tophash(newb, 0);
                    insert_k = bl.key(newb, 0);
                    insert_v = bl.value(newb, 0);
                }

                // Store the new key at the insert position.
                if desc.indirect_key {
                    let kmem = heap::alloc(desc.key_layout());
                    if kmem.is_null() {
                        heap::handle_alloc_error(desc.key_layout());
                    }
                    insert_k.cast::<*mut u8>().write(kmem);
                    insert_k = kmem;
                }
                if desc.indirect_value {
                    let vmem = heap::alloc(desc.value_layout());
                    if vmem.is_null() {
                        heap::handle_alloc_error(desc.value_layout());
                    }
                    insert_v.cast::<*mut u8>().write(vmem);
                }
                ptr::copy_nonoverlapping(key, insert_k, desc.key_size);
                *insert_top = top;
            }
            self.count += 1;

            return (unsafe { self.put_done(desc, insert_v) }, false);
        }
    }

    /// Common exit for `put`: clears the write flag and resolves indirect
    /// value slots to the referent.
    unsafe fn put_done(&mut self, desc: &TypeDesc, mut elem: *mut u8) -> *mut u8 {
        if !self.flag(WRITING) {
            panic!("concurrent map writes");
        }
        self.clear_flag(WRITING);
        if desc.indirect_value {
            elem = unsafe { elem.cast::<*mut u8>().read() };
        }
        elem
    }

    /// Removes `key` from the table. Returns whether it was present.
    ///
    /// A present entry's key and value are moved into `out_key`/`out_val`
    /// when those are non-null and dropped in place otherwise.
    ///
    /// # Safety
    ///
    /// As for [`put`](Self::put). Non-null out pointers must be valid for
    /// writes of the key and value types respectively.
    pub(crate) unsafe fn delete(
        &mut self,
        desc: &TypeDesc,
        key: *const u8,
        out_key: *mut u8,
        out_val: *mut u8,
    ) -> bool {
        let bl = desc.bucket;

        if self.count == 0 {
            if desc.hash_may_panic {
                unsafe { desc.hash_of(key, 0) };
            }
            return false;
        }
        if self.flag(WRITING) {
            panic!("concurrent map writes");
        }

        let hash = unsafe { desc.hash_of(key, self.seed) };

        // Set WRITING only after hashing; a panicking hash hook has not
        // actually done a write.
        self.set_flag(WRITING);

        let bucket = hash as usize & bucket_mask(self.b);
        if self.growing() {
            unsafe { self.grow_work(desc, bucket) };
        }
        let buckets = self.buckets.clone().unwrap();
        let b_orig = unsafe { buckets.bucket(bucket) };
        let mut b = b_orig;
        let top = top_hash(hash);
        let mut found = false;

        'search: loop {
            for mut i in 0..BUCKET_CNT {
                let th = unsafe { *bl.tophash(b, i) };
                if th != top {
                    if th == EMPTY_REST {
                        break 'search;
                    }
                    continue;
                }
                unsafe {
                    let k_slot = bl.key(b, i);
                    let mut k = k_slot;
                    if desc.indirect_key {
                        k = k.cast::<*mut u8>().read();
                    }
                    if !(desc.equal)(key, k) {
                        continue;
                    }

                    // Clear the key slot, moving the key out if requested.
                    if !out_key.is_null() {
                        ptr::copy_nonoverlapping(k, out_key, desc.key_size);
                        if desc.indirect_key {
                            heap::dealloc(k, desc.key_layout());
                            k_slot.cast::<*mut u8>().write(ptr::null_mut());
                        }
                    } else if desc.indirect_key {
                        if let Some(drop_key) = desc.drop_key {
                            drop_key(k);
                        }
                        heap::dealloc(k, desc.key_layout());
                        k_slot.cast::<*mut u8>().write(ptr::null_mut());
                    } else if let Some(drop_key) = desc.drop_key {
                        drop_key(k_slot);
                    }

                    // And the value slot.
                    let e_slot = bl.value(b, i);
                    let mut e = e_slot;
                    if desc.indirect_value {
                        e = e.cast::<*mut u8>().read();
                    }
                    if !out_val.is_null() {
                        ptr::copy_nonoverlapping(e, out_val, desc.val_size);
                        if desc.indirect_value {
                            heap::dealloc(e, desc.value_layout());
                            e_slot.cast::<*mut u8>().write(ptr::null_mut());
                        } else {
                            ptr::write_bytes(e_slot, 0, desc.val_size);
                        }
                    } else if desc.indirect_value {
                        if let Some(drop_value) = desc.drop_value {
                            drop_value(e);
                        }
                        heap::dealloc(e, desc.value_layout());
                        e_slot.cast::<*mut u8>().write(ptr::null_mut());
                    } else if let Some(drop_value) = desc.drop_value {
                        drop_value(e_slot);
                        ptr::write_bytes(e_slot, 0, desc.val_size);
                    } else {
                        ptr::write_bytes(e_slot, 0, desc.val_size);
                    }

                    *bl.tophash(b, i) = EMPTY_ONE;

                    // If the bucket now ends in a run of EMPTY_ONE cells,
                    // promote them to EMPTY_REST so chain walks keep their
                    // short-circuit.
                    'not_last: {
                        if i == BUCKET_CNT - 1 {
                            let ovf = bl.overflow(b);
                            if !ovf.is_null() && *bl.tophash(ovf, 0) != EMPTY_REST {
                                break 'not_last;
                            }
                        } else if *bl.tophash(b, i + 1) != EMPTY_REST {
                            break 'not_last;
                        }
                        loop {
                            *bl.tophash(b, i) = EMPTY_REST;
                            if i == 0 {
                                if b == b_orig {
                                    // Beginning of the initial bucket, done.
                                    break;
                                }
                                // The chain is singly linked; rewalk it from
                                // the head to find the previous bucket.
                                let c = b;
                                b = b_orig;
                                while bl.overflow(b) != c {
                                    b = bl.overflow(b);
                                }
                                i = BUCKET_CNT - 1;
                            } else {
                                i -= 1;
                            }
                            if *bl.tophash(b, i) != EMPTY_ONE {
                                break;
                            }
                        }
                    }

                    self.count -= 1;
                    found = true;
                    break 'search;
                }
            }
            let ovf = unsafe { bl.overflow(b) };
            if ovf.is_null() {
                break;
            }
            b = ovf;
        }

        if !self.flag(WRITING) {
            panic!("concurrent map writes");
        }
        self.clear_flag(WRITING);
        found
    }

    /// Drops every key-value pair and resets the table for reuse, keeping
    /// the bucket array (the backing memory is re-zeroed and the overflow
    /// pool regenerated, as a fresh allocation would be).
    ///
    /// # Safety
    ///
    /// As for [`put`](Self::put). Invalidates any live raw iterator.
    pub(crate) unsafe fn clear(&mut self, desc: &TypeDesc) {
        if self.count == 0 {
            return;
        }
        if self.flag(WRITING) {
            panic!("concurrent map writes");
        }
        self.set_flag(WRITING);

        unsafe { self.drop_entries(desc) };

        self.clear_flag(SAME_SIZE_GROW);
        self.old_buckets = None;
        self.nevacuate = 0;
        self.noverflow = 0;
        self.count = 0;

        let buckets = self.buckets.clone().unwrap();
        let next_overflow = unsafe { buckets.reset(&desc.bucket) };

        // Keep the extra allocation but start fresh registries.
        let extra = self.extra.as_mut().unwrap();
        extra.overflow = Some(Arc::new(OverflowRegistry::new(&desc.bucket)));
        extra.old_overflow = None;
        extra.next_overflow = next_overflow;

        if !self.flag(WRITING) {
            panic!("concurrent map writes");
        }
        self.clear_flag(WRITING);
    }

    /// Drops all live entries, leaving the bucket metadata stale. Only
    /// called on the way out: from `clear` (which then resets the metadata)
    /// and from the owning map's `Drop` (which then frees the arrays).
    pub(crate) unsafe fn drop_entries(&mut self, desc: &TypeDesc) {
        if !desc.owned_slots {
            return;
        }
        let bl = &desc.bucket;

        unsafe {
            if let Some(buckets) = &self.buckets {
                for i in 0..buckets.base() {
                    drop_chain(desc, bl, buckets.bucket(i));
                }
            }
            if let Some(old) = &self.old_buckets {
                for i in 0..old.base() {
                    let b = old.bucket(i);
                    // An evacuated bucket's entries already moved to the
                    // current array; cells are markers only.
                    if !evacuated(bl, b) {
                        drop_chain(desc, bl, b);
                    }
                }
            }
        }
    }

    /// Allocates (or takes from the pre-allocated pool) a new overflow
    /// bucket and links it behind `b`.
    unsafe fn new_overflow(&mut self, desc: &TypeDesc, b: *mut u8) -> *mut u8 {
        let bl = &desc.bucket;
        let extra = self.extra.as_mut().unwrap();

        let ovf = match extra.next_overflow {
            Some(next) => unsafe {
                let ovf = next.as_ptr();
                if bl.overflow(ovf).is_null() {
                    // Not the last pre-allocated bucket; bump the cursor.
                    extra.next_overflow = Some(NonNull::new_unchecked(ovf.add(bl.size)));
                } else {
                    // The last pre-allocated bucket: its overflow link holds
                    // the end-of-pool sentinel. Reset it.
                    bl.set_overflow(ovf, ptr::null_mut());
                    extra.next_overflow = None;
                }
                ovf
            },
            // The pool is exhausted; allocate one owned by the registry.
            None => unsafe { extra.overflow.as_ref().unwrap().alloc_bucket() },
        };

        self.incr_noverflow();
        unsafe { bl.set_overflow(b, ovf) };
        ovf
    }

    /// Counts a new overflow bucket towards the same-size-grow trigger.
    ///
    /// The counter must be able to reach `1 << b` but is kept to 16 bits, so
    /// it is exact while `b < 16` and a scaled probabilistic estimate after:
    /// incrementing with probability `2^(15 - b)` means reaching `1 << 15`
    /// still corresponds to roughly as many overflow buckets as buckets.
    fn incr_noverflow(&mut self) {
        if self.b < 16 {
            self.noverflow = self.noverflow.wrapping_add(1);
            return;
        }
        let mask = (1u32 << (self.b - 15)) - 1;
        if rand32() & mask == 0 {
            self.noverflow = self.noverflow.wrapping_add(1);
        }
    }

    /// Starts a grow. If the load factor has been hit, get bigger;
    /// otherwise there are too many overflow buckets, so rebuild at the same
    /// size to compact them. Entries move later, incrementally, via
    /// `grow_work` and `evacuate`.
    unsafe fn hash_grow(&mut self, desc: &TypeDesc) {
        let mut bigger = 1;
        if !over_load_factor(self.count + 1, self.b) {
            bigger = 0;
            self.set_flag(SAME_SIZE_GROW);
        }

        let old_buckets = self.buckets.take().unwrap();
        let (new_array, next_overflow) = BucketArray::alloc(&desc.bucket, self.b + bigger);

        let old_flags = self.flags.load(Ordering::Relaxed);
        let mut flags = old_flags & !(ITERATOR | OLD_ITERATOR);
        if old_flags & ITERATOR != 0 {
            flags |= OLD_ITERATOR;
        }
        self.flags.store(flags, Ordering::Relaxed);

        self.b += bigger;
        self.old_buckets = Some(old_buckets);
        self.buckets = Some(Arc::new(new_array));
        self.nevacuate = 0;
        self.noverflow = 0;

        // Promote the current overflow registry to the old generation and
        // start a fresh one for the new array.
        let extra = self.extra.as_mut().unwrap();
        if extra.old_overflow.is_some() {
            panic!("old overflow registry is not empty");
        }
        extra.old_overflow = extra.overflow.take();
        extra.overflow = Some(Arc::new(OverflowRegistry::new(&desc.bucket)));
        extra.next_overflow = next_overflow;
    }

    /// Evacuates the old bucket the current write is about to touch, plus
    /// one more to guarantee progress even when writes cluster.
    unsafe fn grow_work(&mut self, desc: &TypeDesc, bucket: usize) {
        unsafe {
            self.evacuate(desc, bucket & self.old_bucket_mask());
            if self.growing() {
                self.evacuate(desc, self.nevacuate);
            }
        }
    }

    /// Moves every entry of old bucket `oldbucket` (and its overflow chain)
    /// into the current array, stamping the old cells with their evacuation
    /// state.
    unsafe fn evacuate(&mut self, desc: &TypeDesc, oldbucket: usize) {
        let bl = desc.bucket;
        let old_array = self.old_buckets.clone().unwrap();
        let b_orig = unsafe { old_array.bucket(oldbucket) };
        let newbit = self.nold_buckets();

        if !unsafe { evacuated(&bl, b_orig) } {
            let new_array = self.buckets.clone().unwrap();

            // x and y are the low and high halves of the new array that a
            // doubling grow splits this bucket into. A same-size grow only
            // uses x.
            let mut xy = unsafe { [EvacDst::new(&bl, new_array.bucket(oldbucket)); 2] };
            if !self.same_size_grow() {
                xy[1] = unsafe { EvacDst::new(&bl, new_array.bucket(oldbucket + newbit)) };
            }

            let mut b = b_orig;
            loop {
                for i in 0..BUCKET_CNT {
                    unsafe {
                        let top_ptr = bl.tophash(b, i);
                        let mut top = *top_ptr;
                        if is_empty_cell(top) {
                            *top_ptr = EVACUATED_EMPTY;
                            continue;
                        }
                        if top < MIN_TOP_HASH {
                            panic!("bad map state");
                        }
                        let k_slot = bl.key(b, i);
                        let mut k2 = k_slot;
                        if desc.indirect_key {
                            k2 = k2.cast::<*mut u8>().read();
                        }

                        let mut use_y = 0;
                        if !self.same_size_grow() {
                            // The destination is decided by the hash bit the
                            // doubled mask gained.
                            let hash = desc.hash_of(k2, self.seed);
                            if self.flag(ITERATOR)
                                && !desc.reflexive_key
                                && !(desc.equal)(k2, k2)
                            {
                                // The hash of a key that never equals itself
                                // is not reproducible, but iterators require
                                // a reproducible destination decision. Route
                                // by the low bit of the old tophash and take
                                // a fresh tophash from the new hash, so such
                                // keys still spread out over repeated grows.
                                use_y = (top & 1) as usize;
                                top = top_hash(hash);
                            } else if hash & newbit as u64 != 0 {
                                use_y = 1;
                            }
                        }

                        *top_ptr = EVACUATED_X + use_y as u8;
                        let dst = &mut xy[use_y];

                        if dst.i == BUCKET_CNT {
                            let newb = self.new_overflow(desc, dst.b);
                            dst.b = newb;
                            dst.i = 0;
                            dst.k = bl.key(newb, 0);
                            dst.e = bl.value(newb, 0);
                        }
                        // Masking dst.i avoids a bounds check.
                        *bl.tophash(dst.b, dst.i & (BUCKET_CNT - 1)) = top;
                        ptr::copy_nonoverlapping(k_slot, dst.k, bl.key_slot);
                        ptr::copy_nonoverlapping(bl.value(b, i), dst.e, bl.val_slot);
                        dst.i += 1;
                        // These may step past the last slot; the trailing
                        // overflow pointer keeps them in bounds.
                        dst.k = dst.k.add(bl.key_slot);
                        dst.e = dst.e.add(bl.val_slot);
                    }
                }
                let ovf = unsafe { bl.overflow(b) };
                if ovf.is_null() {
                    break;
                }
                b = ovf;
            }

            // Scrub the moved-out slots unless an iterator may still need
            // the old chain, preserving the tophash bytes that record the
            // evacuation state.
            if !self.flag(OLD_ITERATOR) && desc.owned_slots {
                unsafe {
                    let data = b_orig.add(bl.data_offset);
                    ptr::write_bytes(data, 0, bl.size - bl.data_offset);
                }
            }
        }

        if oldbucket == self.nevacuate {
            unsafe { self.advance_evacuation_mark(desc, newbit) };
        }
    }

    /// Advances the evacuation cursor past this bucket and any contiguously
    /// evacuated successors; finishes the grow once it reaches the end.
    unsafe fn advance_evacuation_mark(&mut self, desc: &TypeDesc, newbit: usize) {
        self.nevacuate += 1;
        // Experiments suggest 1024 is overkill by at least an order of
        // magnitude. Keep it as a safeguard to bound the scan.
        let stop = (self.nevacuate + 1024).min(newbit);
        let old_array = self.old_buckets.clone().unwrap();
        while self.nevacuate != stop
            && unsafe { evacuated(&desc.bucket, old_array.bucket(self.nevacuate)) }
        {
            self.nevacuate += 1;
        }

        if self.nevacuate == newbit {
            // Growing is done. Release the old array and old overflow
            // buckets; an iterator still walking them holds its own
            // references.
            self.old_buckets = None;
            if let Some(extra) = self.extra.as_mut() {
                extra.old_overflow = None;
            }
            self.clear_flag(SAME_SIZE_GROW);
        }
    }

    /// Starts an iterator. The result yields entry pointers via
    /// [`RawIter::next`]; a null key pointer marks the end.
    ///
    /// # Safety
    ///
    /// `desc` is the table's descriptor. The iterator is invalidated by
    /// `clear` and by dropping the table.
    pub(crate) unsafe fn iter(&self, desc: &TypeDesc) -> RawIter {
        let mut it = RawIter {
            key: ptr::null(),
            value: ptr::null(),
            buckets: None,
            old_buckets: None,
            overflow: None,
            old_overflow: None,
            bptr: ptr::null_mut(),
            start_bucket: 0,
            offset: 0,
            wrapped: false,
            b: 0,
            i: 0,
            bucket: 0,
            check_bucket: NO_CHECK,
        };

        if self.count == 0 {
            return it;
        }

        // Snapshot the bucket state. The array and registry references keep
        // every bucket this iterator can reach alive even if the table
        // grows and releases its own references mid-iteration.
        it.b = self.b;
        it.buckets = self.buckets.clone();
        it.old_buckets = self.old_buckets.clone();
        if let Some(extra) = &self.extra {
            it.overflow = extra.overflow.clone();
            it.old_overflow = extra.old_overflow.clone();
        }

        // Decide where to start.
        let mut r = rand32() as u64;
        if self.b as u32 > 31 - BUCKET_CNT_BITS {
            r += (rand32() as u64) << 31;
        }
        it.start_bucket = r as usize & bucket_mask(self.b);
        it.offset = ((r >> self.b) as usize & (BUCKET_CNT - 1)) as u8;
        it.bucket = it.start_bucket;

        // Remember that an iterator exists, suppressing reuse of old
        // buckets it may still walk. Can race with another `iter`.
        if self.flags.load(Ordering::Relaxed) & (ITERATOR | OLD_ITERATOR)
            != ITERATOR | OLD_ITERATOR
        {
            self.set_flag(ITERATOR | OLD_ITERATOR);
        }

        unsafe { it.next(self, desc) };
        it
    }
}

/// Drops the live entries of one bucket chain.
unsafe fn drop_chain(desc: &TypeDesc, bl: &BucketLayout, mut b: *mut u8) {
    loop {
        for i in 0..BUCKET_CNT {
            unsafe {
                if *bl.tophash(b, i) < MIN_TOP_HASH {
                    continue;
                }
                let k_slot = bl.key(b, i);
                if desc.indirect_key {
                    let k = k_slot.cast::<*mut u8>().read();
                    if let Some(drop_key) = desc.drop_key {
                        drop_key(k);
                    }
                    heap::dealloc(k, desc.key_layout());
                } else if let Some(drop_key) = desc.drop_key {
                    drop_key(k_slot);
                }
                let e_slot = bl.value(b, i);
                if desc.indirect_value {
                    let e = e_slot.cast::<*mut u8>().read();
                    if let Some(drop_value) = desc.drop_value {
                        drop_value(e);
                    }
                    heap::dealloc(e, desc.value_layout());
                } else if let Some(drop_value) = desc.drop_value {
                    drop_value(e_slot);
                }
            }
        }
        let ovf = unsafe { bl.overflow(b) };
        if ovf.is_null() {
            return;
        }
        b = ovf;
    }
}

/// An evacuation destination cursor.
#[derive(Clone, Copy)]
struct EvacDst {
    /// Current destination bucket.
    b: *mut u8,
    /// Next cell index in `b`.
    i: usize,
    /// Address the next key lands at.
    k: *mut u8,
    /// Address the next value lands at.
    e: *mut u8,
}

impl EvacDst {
    unsafe fn new(bl: &BucketLayout, b: *mut u8) -> EvacDst {
        unsafe {
            EvacDst {
                b,
                i: 0,
                k: bl.key(b, 0),
                e: bl.value(b, 0),
            }
        }
    }
}

/// Iteration state over a [`RawMap`].
///
/// Captures the bucket array at construction time and walks it bucket by
/// bucket from a random start point, scanning cells in a rotated order.
/// Entries are never moved within their bucket, so each is yielded at most
/// once; entries evacuated by a concurrent grow are chased into the current
/// array by key.
#[derive(Clone)]
pub(crate) struct RawIter {
    /// Current key, or null once the iterator is exhausted.
    pub(crate) key: *const u8,
    pub(crate) value: *const u8,

    /// The bucket array at initialization time.
    buckets: Option<Arc<BucketArray>>,
    /// Pin on the old array if a grow was in progress at initialization.
    old_buckets: Option<Arc<BucketArray>>,
    /// Pins keeping overflow buckets of both generations alive.
    overflow: Option<Arc<OverflowRegistry>>,
    old_overflow: Option<Arc<OverflowRegistry>>,

    /// Current bucket in the chain being walked.
    bptr: *mut u8,
    /// Bucket iteration started at.
    start_bucket: usize,
    /// Intra-bucket offset to start from during iteration.
    offset: u8,
    /// Already wrapped around from the end of the bucket array.
    wrapped: bool,
    /// The table's size class when iteration started.
    b: u8,
    /// Next cell index within the current bucket.
    i: u8,
    /// Next bucket index.
    bucket: usize,
    /// During a doubling grow: the new-table bucket whose entries we may
    /// yield from an unevacuated old bucket, or NO_CHECK.
    check_bucket: usize,
}

// Safety: the raw pointers refer into allocations pinned by the Arcs above
// (or into the live table, guarded by the no-writer contract).
unsafe impl Send for RawIter {}
unsafe impl Sync for RawIter {}

impl RawIter {
    /// Advances to the next entry, populating `key`/`value`; sets `key` to
    /// null when the iteration ends.
    ///
    /// # Safety
    ///
    /// `h` and `desc` are the table and descriptor this iterator was created
    /// from, and no writer is active during the call.
    pub(crate) unsafe fn next(&mut self, h: &RawMap, desc: &TypeDesc) {
        if h.flag(WRITING) {
            panic!("concurrent map iteration and map write");
        }
        let bl = desc.bucket;
        let buckets = self.buckets.clone().unwrap();
        let mut bucket = self.bucket;
        let mut b = self.bptr;
        let mut i = self.i as usize;
        let mut check_bucket = self.check_bucket;

        loop {
            if b.is_null() {
                if bucket == self.start_bucket && self.wrapped {
                    // End of iteration.
                    self.key = ptr::null();
                    self.value = ptr::null();
                    return;
                }
                if h.growing() && self.b == h.b {
                    // Iteration started in the middle of a grow that is
                    // still not done. If the old bucket this one descends
                    // from has not been evacuated, walk the old bucket and
                    // yield only the entries that will migrate here.
                    let oldbucket = bucket & h.old_bucket_mask();
                    let old = h.old_buckets.as_ref().unwrap();
                    b = unsafe { old.bucket(oldbucket) };
                    if !unsafe { evacuated(&bl, b) } {
                        check_bucket = bucket;
                    } else {
                        b = unsafe { buckets.bucket(bucket) };
                        check_bucket = NO_CHECK;
                    }
                } else {
                    b = unsafe { buckets.bucket(bucket) };
                    check_bucket = NO_CHECK;
                }
                bucket += 1;
                if bucket == bucket_shift(self.b) {
                    bucket = 0;
                    self.wrapped = true;
                }
                i = 0;
            }

            while i < BUCKET_CNT {
                let offi = (i + self.offset as usize) & (BUCKET_CNT - 1);
                unsafe {
                    let th = *bl.tophash(b, offi);
                    if is_empty_cell(th) || th == EVACUATED_EMPTY {
                        i += 1;
                        continue;
                    }
                    let mut k = bl.key(b, offi);
                    if desc.indirect_key {
                        k = k.cast::<*mut u8>().read();
                    }
                    let mut e = bl.value(b, offi);

                    if check_bucket != NO_CHECK && !h.same_size_grow() {
                        // We are walking an old bucket whose entries split
                        // between two new buckets; skip the ones headed for
                        // the other one.
                        if desc.reflexive_key || (desc.equal)(k, k) {
                            let hash = desc.hash_of(k, h.seed);
                            if hash as usize & bucket_mask(self.b) != check_bucket {
                                i += 1;
                                continue;
                            }
                        } else {
                            // A key that never equals itself has no
                            // repeatable hash; mirror the evacuation
                            // decision recorded in the tophash low bit.
                            if (check_bucket >> (self.b - 1)) as u8 != th & 1 {
                                i += 1;
                                continue;
                            }
                        }
                    }

                    if (th != EVACUATED_X && th != EVACUATED_Y)
                        || !(desc.reflexive_key || (desc.equal)(k, k))
                    {
                        // This cell still holds the live entry. Or the key
                        // never equals itself, so it cannot have been
                        // deleted or updated since; hand it out as is
                        // (it could not be re-found by lookup anyway).
                        self.key = k;
                        if desc.indirect_value {
                            e = e.cast::<*mut u8>().read();
                        }
                        self.value = e;
                    } else {
                        // The table grew since this bucket was captured and
                        // the live entry moved; it may also have been
                        // updated or deleted. Chase it by key, and re-grab
                        // the stored key: it may have been overwritten by
                        // an equal but distinguishable one.
                        let (rk, re) = h.get_key_value(desc, k);
                        if rk.is_null() {
                            // Key was deleted.
                            i += 1;
                            continue;
                        }
                        self.key = rk;
                        self.value = re;
                    }

                    self.bucket = bucket;
                    if self.bptr != b {
                        self.bptr = b;
                    }
                    self.i = (i + 1) as u8;
                    self.check_bucket = check_bucket;
                    return;
                }
            }
            b = unsafe { bl.overflow(b) };
            i = 0;
        }
    }
}
