//! The typed facade applications hold.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use mccache_cache::{CacheError, CacheMetrics, Origin};

use crate::engine::EngineInner;

/// A typed view over one named cache.
///
/// Keys and values are bincode-encoded at this boundary, so anything serde
/// can serialize works as either.  Every handle over the same name shares one
/// underlying store; handles are cheap to clone and hand across threads.  All
/// peers must agree on the types they put under a given namespace.
pub struct CacheHandle<K, V> {
    name: String,
    inner: Arc<EngineInner>,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> Clone for CacheHandle<K, V> {
    fn clone(&self) -> Self {
        CacheHandle {
            name: self.name.clone(),
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

fn codec_error(err: impl std::fmt::Display) -> CacheError {
    CacheError::Codec {
        detail: err.to_string(),
    }
}

impl<K, V> CacheHandle<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    pub(crate) fn new(name: String, inner: Arc<EngineInner>) -> Self {
        CacheHandle {
            name,
            inner,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>, CacheError> {
        bincode::serialize(key).map_err(codec_error)
    }

    /// Fetch a value.  A miss is an error, mirroring mapping semantics.
    pub fn get(&self, key: &K) -> Result<V, CacheError> {
        let key_b = self.encode_key(key)?;
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        let bytes = cache
            .get(&key_b)
            .ok_or_else(|| CacheError::key_missing(&key_b))?;
        bincode::deserialize(bytes).map_err(codec_error)
    }

    /// Store a value and replicate it to the group.
    pub fn set(&self, key: &K, value: &V) -> Result<(), CacheError> {
        let key_b = self.encode_key(key)?;
        let value_b = bincode::serialize(value).map_err(codec_error)?;
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        cache.set(key_b, value_b, None, Origin::Local)
    }

    /// Remove a value here and on every peer.  Fails with `KeyMissing` when
    /// the entry is not present locally.
    pub fn delete(&self, key: &K) -> Result<(), CacheError> {
        let key_b = self.encode_key(key)?;
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        cache.delete(&key_b, None, Origin::Local)
    }

    pub fn contains(&self, key: &K) -> Result<bool, CacheError> {
        let key_b = self.encode_key(key)?;
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        Ok(cache.contains(&key_b))
    }

    /// Remove and return a value without telling the group.
    pub fn pop(&self, key: &K) -> Result<Option<V>, CacheError> {
        let key_b = self.encode_key(key)?;
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        match cache.pop(&key_b) {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec_error)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        let mut shared = self.inner.shared.lock();
        self.inner.ensure_cache(&mut shared, &self.name).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in insertion order.  Keys that no longer decode as `K` (another
    /// handle wrote a different type into this namespace) are skipped.
    pub fn keys(&self) -> Vec<K>
    where
        K: DeserializeOwned,
    {
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        cache
            .keys()
            .iter()
            .filter_map(|k| bincode::deserialize(k).ok())
            .collect()
    }

    /// Values in insertion order, skipping whatever no longer decodes as
    /// `V`.
    pub fn values(&self) -> Vec<V> {
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        cache
            .items()
            .into_iter()
            .filter_map(|(_, v)| bincode::deserialize(&v).ok())
            .collect()
    }

    /// Key/value pairs in insertion order, skipping whatever no longer
    /// decodes as `(K, V)`.
    pub fn items(&self) -> Vec<(K, V)>
    where
        K: DeserializeOwned,
    {
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        cache
            .items()
            .into_iter()
            .filter_map(|(k, v)| {
                Some((
                    bincode::deserialize(&k).ok()?,
                    bincode::deserialize(&v).ok()?,
                ))
            })
            .collect()
    }

    /// Remove and return the oldest entry (FIFO), without telling the group.
    pub fn pop_oldest(&self) -> Option<(K, V)>
    where
        K: DeserializeOwned,
    {
        let mut shared = self.inner.shared.lock();
        let cache = self.inner.ensure_cache(&mut shared, &self.name);
        let (key, value) = cache.pop_oldest()?;
        Some((
            bincode::deserialize(&key).ok()?,
            bincode::deserialize(&value).ok()?,
        ))
    }

    /// Drop every local entry in this namespace without telling the group.
    /// The cluster-wide form is [`crate::McCache::clear_cache`].
    pub fn clear_local(&self) {
        let mut shared = self.inner.shared.lock();
        self.inner.ensure_cache(&mut shared, &self.name).clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        let mut shared = self.inner.shared.lock();
        self.inner.ensure_cache(&mut shared, &self.name).metrics()
    }
}
