use core::hash::{BuildHasher, Hasher};
use std::collections::HashMap;

/// Hash of a component, event or query name.
pub type NameHash = u32;

/// Map keyed by ids that are already well distributed (dense ids, name hashes).
pub type IdMap<K, V> = HashMap<K, V, nohash_hasher::BuildNoHashHasher<K>>;

/// Map keyed by composite or string values.
pub type AHashMap<K, V> = HashMap<K, V, ahash::RandomState>;

// Fixed seeds keep name hashes identical across every `World` in the process.
const NAME_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

#[inline]
pub(crate) fn fixed_state() -> ahash::RandomState {
    ahash::RandomState::with_seeds(NAME_SEEDS[0], NAME_SEEDS[1], NAME_SEEDS[2], NAME_SEEDS[3])
}

/// Hashes a name into the 32 bit space used by the component, event and template tables.
pub fn hash_name(name: &str) -> NameHash {
    let mut hasher = fixed_state().build_hasher();
    hasher.write(name.as_bytes());
    let hash = hasher.finish();
    (hash ^ (hash >> 32)) as NameHash
}

pub(crate) fn id_map<K, V>(capacity: usize) -> IdMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, nohash_hasher::BuildNoHashHasher::default())
}

pub(crate) fn ahash_map<K, V>(capacity: usize) -> AHashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, ahash::RandomState::default())
}

#[inline(always)]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// # Safety
/// - The indices must be different
/// - The indices must be within the bounds of the slice
#[inline(always)]
pub unsafe fn get_two_mut_unchecked<T>(values: &mut [T], index1: usize, index2: usize) -> (&mut T, &mut T) {
    debug_assert_ne!(index1, index2);
    debug_assert!(index1 < values.len());
    debug_assert!(index2 < values.len());

    let base = values.as_mut_ptr();

    // SAFETY: Caller guarantees distinct, in-bounds indices, so the references never alias.
    unsafe { (&mut *base.add(index1), &mut *base.add(index2)) }
}
