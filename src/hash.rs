//! The key-hashing contract.
//!
//! Only the low `mask_bits` bits of a hash select a bucket, so a good hash
//! function for this table folds high-bit entropy downwards instead of mixing
//! in both directions. [`MaskHash`] passes the current bucket-index width to
//! the hash function so the fold can adapt as the table grows.

use crate::hash_map::Statistics;

/// A key type that can hash itself against a bucket-index mask.
///
/// `mask_bits` is the number of significant low bits of the result, i.e. the
/// binary width of the current bucket mask; it is always at least 1 and less
/// than `usize::BITS`. Implementations must depend on all key bits and should
/// push high-bit variation into the low bits.
///
/// # Examples
///
/// ```
/// use morphmap::MaskHash;
///
/// struct Id(u32);
///
/// impl MaskHash for Id {
///     fn mask_hash(&self, mask_bits: u32) -> usize {
///         self.0.mask_hash(mask_bits)
///     }
/// }
///
/// assert_eq!(Id(7).mask_hash(8), 7_u32.mask_hash(8));
/// ```
pub trait MaskHash {
    /// Returns the hash of `self`, folded for a bucket index of `mask_bits`
    /// bits.
    fn mask_hash(&self, mask_bits: u32) -> usize;
}

macro_rules! impl_mask_hash_for_int {
    ($($int:ty as $unsigned:ty),* $(,)?) => {
        $(
            impl MaskHash for $int {
                #[inline]
                fn mask_hash(&self, mask_bits: u32) -> usize {
                    // A zero-bit fold cannot make progress.
                    let shift = mask_bits.max(1);
                    let mut rest = *self as $unsigned as usize;
                    let mut hash = rest;
                    loop {
                        rest >>= shift;
                        if rest == 0 {
                            break;
                        }
                        hash ^= rest;
                    }
                    hash
                }
            }
        )*
    };
}

impl_mask_hash_for_int!(
    u8 as u8,
    u16 as u16,
    u32 as u32,
    u64 as u64,
    usize as usize,
    i8 as u8,
    i16 as u16,
    i32 as u32,
    i64 as u64,
    isize as usize,
);

impl MaskHash for str {
    #[inline]
    fn mask_hash(&self, mask_bits: u32) -> usize {
        let mut hash = 0_usize;
        for &byte in self.as_bytes() {
            hash = hash.wrapping_mul(9).wrapping_add(byte as usize);
        }
        hash ^ (hash >> mask_bits.max(1))
    }
}

impl MaskHash for String {
    #[inline]
    fn mask_hash(&self, mask_bits: u32) -> usize {
        self.as_str().mask_hash(mask_bits)
    }
}

impl<T: MaskHash + ?Sized> MaskHash for &T {
    #[inline]
    fn mask_hash(&self, mask_bits: u32) -> usize {
        (**self).mask_hash(mask_bits)
    }
}

/// Reports the bucket distribution a hash function would produce for the
/// given keys and bucket count, without building a table.
///
/// `bucket_count` is rounded up to a power of two, matching how the table
/// masks hashes.
///
/// # Examples
///
/// ```
/// use morphmap::hash::{self, MaskHash};
///
/// let keys: Vec<u64> = (0..16).collect();
/// let stats = hash::evaluate_hasher(u64::mask_hash, &keys, 16);
/// assert_eq!(stats.filled_buckets, 16);
/// assert_eq!(stats.collisions, 0);
/// ```
#[must_use]
pub fn evaluate_hasher<K>(
    hash_fn: fn(&K, u32) -> usize,
    keys: &[K],
    bucket_count: usize,
) -> Statistics {
    let buckets = bucket_count.next_power_of_two().max(2);
    let mask = buckets - 1;
    let mask_bits = mask.count_ones();
    let mut histogram = vec![0_usize; buckets];
    for key in keys {
        histogram[hash_fn(key, mask_bits) & mask] += 1;
    }
    let mut stats = Statistics {
        buckets,
        len: keys.len(),
        ..Statistics::default()
    };
    for &count in &histogram {
        if count > 0 {
            stats.filled_buckets += 1;
            if count >= 2 {
                stats.collisions += 1;
                stats.max_collision = stats.max_collision.max(count);
            }
        }
    }
    stats
}
