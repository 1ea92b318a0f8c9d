use std::alloc;
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::mem;
use std::ptr::{self, NonNull};

use super::BUCKET_CNT;

/// Alignment of every bucket allocation.
///
/// The tophash array is padded to this boundary so the key block starts
/// correctly aligned, and inline slots are restricted to at most this
/// alignment (anything stricter is stored indirectly).
pub(crate) const BUCKET_ALIGN: usize = 8;

/// The in-memory layout of a single bucket for one `(K, V)` instantiation.
///
/// A bucket is `BUCKET_CNT` tophash bytes, then `BUCKET_CNT` keys packed
/// together, then `BUCKET_CNT` values packed together, then one overflow
/// pointer at the tail. Keys and values are packed in separate blocks to
/// eliminate the padding an alternating layout would need when their
/// alignments differ.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BucketLayout {
    /// Size of one key slot: the key size, or a pointer if stored indirectly.
    pub key_slot: usize,
    /// Size of one value slot.
    pub val_slot: usize,
    /// Offset of the key block: the tophash array padded to `BUCKET_ALIGN`.
    pub data_offset: usize,
    /// Offset of the value block.
    pub val_offset: usize,
    /// Total bucket stride, including the trailing overflow pointer.
    pub size: usize,
}

impl BucketLayout {
    pub(crate) fn new(key_slot: usize, val_slot: usize) -> BucketLayout {
        let data_offset = (BUCKET_CNT + BUCKET_ALIGN - 1) & !(BUCKET_ALIGN - 1);
        let val_offset = data_offset + BUCKET_CNT * key_slot;
        let size = val_offset + BUCKET_CNT * val_slot + mem::size_of::<*mut u8>();

        // Slot sizes are multiples of their (<= BUCKET_ALIGN) alignment, so
        // every block above starts aligned and the stride needs no tail pad.
        debug_assert!(size % mem::size_of::<*mut u8>() == 0);

        BucketLayout {
            key_slot,
            val_slot,
            data_offset,
            val_offset,
            size,
        }
    }

    /// The allocation layout of `n` contiguous buckets.
    pub(crate) fn array(&self, n: usize) -> Layout {
        Layout::from_size_align(self.size * n, BUCKET_ALIGN).unwrap()
    }

    /// Address of the `i`-th tophash byte.
    #[inline]
    pub(crate) unsafe fn tophash(&self, bucket: *mut u8, i: usize) -> *mut u8 {
        unsafe { bucket.add(i) }
    }

    /// Address of the `i`-th key slot.
    #[inline]
    pub(crate) unsafe fn key(&self, bucket: *mut u8, i: usize) -> *mut u8 {
        unsafe { bucket.add(self.data_offset + i * self.key_slot) }
    }

    /// Address of the `i`-th value slot.
    #[inline]
    pub(crate) unsafe fn value(&self, bucket: *mut u8, i: usize) -> *mut u8 {
        unsafe { bucket.add(self.val_offset + i * self.val_slot) }
    }

    /// The overflow link stored at the bucket's tail.
    #[inline]
    pub(crate) unsafe fn overflow(&self, bucket: *mut u8) -> *mut u8 {
        unsafe {
            bucket
                .add(self.size - mem::size_of::<*mut u8>())
                .cast::<*mut u8>()
                .read()
        }
    }

    #[inline]
    pub(crate) unsafe fn set_overflow(&self, bucket: *mut u8, next: *mut u8) {
        unsafe {
            bucket
                .add(self.size - mem::size_of::<*mut u8>())
                .cast::<*mut u8>()
                .write(next)
        }
    }
}

/// A bucket array laid out in a single allocation.
///
/// Holds the `1 << b` main buckets followed by the pre-allocated overflow
/// pool, if any. The array is reference counted (`Arc`) so an iterator can
/// pin the generation it captured even after a grow retires it; the struct
/// itself is never mutated, all bucket access goes through raw pointers.
pub(crate) struct BucketArray {
    ptr: NonNull<u8>,
    /// Number of main buckets, always a power of two.
    base: usize,
    /// Total buckets in the allocation, including the overflow pool.
    nbuckets: usize,
    bucket_size: usize,
    layout: Layout,
}

// Safety: the array hands out raw pointers only; mutation of bucket memory
// is governed by the table's single-writer contract.
unsafe impl Send for BucketArray {}
unsafe impl Sync for BucketArray {}

impl BucketArray {
    /// Allocates a zeroed array of `1 << b` buckets.
    ///
    /// For `b >= 4`, `1 << (b - 4)` overflow buckets are pre-allocated past
    /// the main array and the cursor to the first of them is returned. The
    /// last pooled bucket's overflow link is set to the array base: a known
    /// non-null address marking the end of the pool, distinguishable from a
    /// bucket already linked into a chain.
    pub(crate) fn alloc(bl: &BucketLayout, b: u8) -> (BucketArray, Option<NonNull<u8>>) {
        let base = super::utils::bucket_shift(b);
        let mut nbuckets = base;
        // For small b, overflow buckets are unlikely; skip the pool.
        if b >= 4 {
            nbuckets += super::utils::bucket_shift(b - 4);
        }

        let layout = bl.array(nbuckets);
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };

        let array = BucketArray {
            ptr,
            base,
            nbuckets,
            bucket_size: bl.size,
            layout,
        };

        let next_overflow = if base != nbuckets {
            unsafe {
                let last = array.bucket(nbuckets - 1);
                bl.set_overflow(last, array.base_ptr());
                Some(NonNull::new_unchecked(array.bucket(base)))
            }
        } else {
            None
        };

        (array, next_overflow)
    }

    /// Re-zeroes the allocation and regenerates the overflow pool, as a
    /// fresh `alloc` with the same parameters would. Used by `clear` to
    /// reuse the backing memory.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive write access to the table and must
    /// have dropped any entries still stored in the array.
    pub(crate) unsafe fn reset(&self, bl: &BucketLayout) -> Option<NonNull<u8>> {
        unsafe {
            ptr::write_bytes(self.ptr.as_ptr(), 0, self.layout.size());

            if self.base != self.nbuckets {
                let last = self.bucket(self.nbuckets - 1);
                bl.set_overflow(last, self.base_ptr());
                Some(NonNull::new_unchecked(self.bucket(self.base)))
            } else {
                None
            }
        }
    }

    /// Number of main buckets.
    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.base
    }

    /// The array base address, also used as the end-of-pool sentinel.
    #[inline]
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address of bucket `i`, counting pool buckets past the main array.
    #[inline]
    pub(crate) unsafe fn bucket(&self, i: usize) -> *mut u8 {
        debug_assert!(i < self.nbuckets);
        unsafe { self.ptr.as_ptr().add(i * self.bucket_size) }
    }
}

impl Drop for BucketArray {
    fn drop(&mut self) {
        // Entries were dropped by the table before the last reference went
        // away; only the raw allocation remains.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Owns the overflow buckets allocated individually once a bucket array's
/// pre-allocated pool is exhausted.
///
/// The registry is shared (`Arc`) between the table header and any live
/// iterators: a grow promotes the current registry to the old generation and
/// drops it when evacuation finishes, but an iterator's clone keeps the
/// evacuated overflow buckets it is still walking alive until it ends.
pub(crate) struct OverflowRegistry {
    buckets: UnsafeCell<Vec<NonNull<u8>>>,
    bucket_layout: Layout,
}

// Safety: the vector is only pushed to by the single active writer; readers
// never touch it, they merely hold the Arc to delay deallocation.
unsafe impl Send for OverflowRegistry {}
unsafe impl Sync for OverflowRegistry {}

impl OverflowRegistry {
    pub(crate) fn new(bl: &BucketLayout) -> OverflowRegistry {
        OverflowRegistry {
            buckets: UnsafeCell::new(Vec::new()),
            bucket_layout: bl.array(1),
        }
    }

    /// Allocates a zeroed overflow bucket owned by this registry.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive write access to the table.
    pub(crate) unsafe fn alloc_bucket(&self) -> *mut u8 {
        let ptr = unsafe { alloc::alloc_zeroed(self.bucket_layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(self.bucket_layout);
        };
        unsafe { (*self.buckets.get()).push(ptr) };
        ptr.as_ptr()
    }
}

impl Drop for OverflowRegistry {
    fn drop(&mut self) {
        for bucket in self.buckets.get_mut() {
            unsafe { alloc::dealloc(bucket.as_ptr(), self.bucket_layout) }
        }
    }
}

/// Size of the shared zero block returned as the value pointer on a missed
/// lookup. Large enough for any inline value.
const ZERO_VAL_SIZE: usize = 1024;

#[repr(align(64))]
struct ZeroVal([u8; ZERO_VAL_SIZE]);

/// Callers must never write through this.
static ZERO_VAL: ZeroVal = ZeroVal([0; ZERO_VAL_SIZE]);

#[inline]
pub(crate) fn zero_val() -> *const u8 {
    ZERO_VAL.0.as_ptr()
}

#[test]
fn layout() {
    // u64 keys and u32 values: 8 tophash bytes, 64 bytes of keys,
    // 32 bytes of values, one trailing pointer.
    let bl = BucketLayout::new(8, 4);
    assert_eq!(bl.data_offset, 8);
    assert_eq!(bl.val_offset, 8 + 64);
    assert_eq!(bl.size, 8 + 64 + 32 + mem::size_of::<*mut u8>());

    let (array, next) = BucketArray::alloc(&bl, 5);
    assert_eq!(array.base(), 32);
    assert_eq!(array.nbuckets, 32 + 2);

    // The pool cursor points at the first bucket past the main array, and
    // the last pooled bucket carries the end-of-pool sentinel.
    unsafe {
        assert_eq!(next.unwrap().as_ptr(), array.bucket(32));
        assert_eq!(bl.overflow(array.bucket(33)), array.base_ptr());
        assert_eq!(bl.overflow(array.bucket(32)), ptr::null_mut());
    }
}
