use std::cmp::Ordering;

/// Total order on keys, used to break ties between equal hash codes.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultComparator;

impl<K: Ord> KeyComparator<K> for DefaultComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Index order: hash codes as unsigned integers first, then keys.
pub fn compare_hashed<K, C>(comparator: &C, a_hash: u64, a: &K, b_hash: u64, b: &K) -> Ordering
where
    C: KeyComparator<K> + ?Sized,
{
    a_hash
        .cmp(&b_hash)
        .then_with(|| comparator.compare(a, b))
}
