use std::marker::PhantomData;

use sha2::{Digest, Sha256};

use super::serializer::BinarySerializer;

/// Maps a key to the 64-bit hash code that places it in the directory.
/// Hash codes are ordered as unsigned integers.
pub trait HashFunction<K>: Send + Sync {
    fn hash_code(&self, key: &K) -> u64;
}

/// Default hash: SHA-256 of the serialized key, reduced to its first
/// eight bytes (big-endian).
pub struct Sha256HashFunction<K, S> {
    serializer: S,
    _key: PhantomData<fn(&K)>,
}

impl<K, S: BinarySerializer<K>> Sha256HashFunction<K, S> {
    pub fn new(serializer: S) -> Self {
        Self {
            serializer,
            _key: PhantomData,
        }
    }
}

impl<K, S: BinarySerializer<K>> HashFunction<K> for Sha256HashFunction<K, S> {
    fn hash_code(&self, key: &K) -> u64 {
        let digest = Sha256::digest(self.serializer.to_bytes(key));
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

/// Adapts a closure into a hash function.
pub struct FnHash<F>(pub F);

impl<K, F> HashFunction<K> for FnHash<F>
where
    F: Fn(&K) -> u64 + Send + Sync,
{
    fn hash_code(&self, key: &K) -> u64 {
        (self.0)(key)
    }
}
