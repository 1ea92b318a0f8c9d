/// Returns `1 << b`, the number of buckets for a size class.
///
/// Masking the shift amount allows overflow checks to be elided.
#[inline]
pub(crate) fn bucket_shift(b: u8) -> usize {
    1 << (b & (usize::BITS as u8 - 1))
}

/// Returns `(1 << b) - 1`, the mask applied to a hash to select a bucket.
#[inline]
pub(crate) fn bucket_mask(b: u8) -> usize {
    bucket_shift(b) - 1
}

/// A cheap draw from the global generator, used for hash seeds, iteration
/// start points, and the probabilistic overflow counter.
#[inline]
pub(crate) fn rand32() -> u32 {
    rand::random()
}
