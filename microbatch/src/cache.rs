//! Response caching for the scheduler.
//!
//! The scheduler consults the cache on enqueue (serving hits without ever
//! queueing the request) and inserts computed responses from the response
//! delegator on the way out. Insertion follows an at-most-once
//! discipline: when several requests with the same key miss concurrently,
//! the first computed response wins and later inserts report
//! [`CacheError::AlreadyExists`], which callers must not treat as a
//! failure.
//!
//! [`LruResponseCache`] is the bundled implementation: xxh3 request
//! hashing, LRU eviction and TTL expiration.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

use microbatch_core::{InferenceRequest, InferenceResponse};

/// Cache operation outcomes that are not a plain hit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// No live entry for the key
    #[error("no cached response for key")]
    NotFound,

    /// Another thread inserted this key first; not a failure
    #[error("a cached response for this key already exists")]
    AlreadyExists,

    /// The cache backend itself failed
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Cache contract consumed by the scheduler
pub trait ResponseCache: Send + Sync {
    /// Hash a request into its cache key
    fn hash(&self, request: &InferenceRequest) -> Result<u64, CacheError>;

    /// Fetch the cached response for `key`; `NotFound` on miss
    fn lookup(&self, key: u64) -> Result<InferenceResponse, CacheError>;

    /// Store a computed response under `key`; `AlreadyExists` when a live
    /// entry is already present
    fn insert(&self, key: u64, response: &InferenceResponse) -> Result<(), CacheError>;
}

/// A cached response with its insertion time for TTL checking
struct CachedEntry {
    response: InferenceResponse,
    created_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.created_at.elapsed() > ttl)
    }
}

/// In-memory response cache with LRU eviction and TTL expiration
pub struct LruResponseCache {
    entries: Mutex<LruCache<u64, CachedEntry>>,
    ttl: Option<Duration>,
}

impl LruResponseCache {
    /// Create a cache holding up to `capacity` responses; entries older
    /// than `ttl` are treated as absent
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { entries: Mutex::new(LruCache::new(capacity)), ttl }
    }

    /// Current number of entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl ResponseCache for LruResponseCache {
    /// Hash the request's model plus every input tensor (name, type,
    /// shape and raw bytes) into a 64-bit key
    fn hash(&self, request: &InferenceRequest) -> Result<u64, CacheError> {
        let mut hasher = Xxh3::new();
        hasher.update(request.model.as_bytes());
        hasher.update(&[0]);
        for tensor in &request.inputs {
            hasher.update(tensor.name.as_bytes());
            hasher.update(&[0, tensor.dtype as u8]);
            for dim in &tensor.dims {
                hasher.update(&dim.to_le_bytes());
            }
            hasher.update(&tensor.data);
            hasher.update(&[0]);
        }
        Ok(hasher.digest())
    }

    fn lookup(&self, key: u64) -> Result<InferenceResponse, CacheError> {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.is_expired(self.ttl) => {
                entries.pop(&key);
                Err(CacheError::NotFound)
            }
            Some(entry) => Ok(entry.response.clone()),
            None => Err(CacheError::NotFound),
        }
    }

    fn insert(&self, key: u64, response: &InferenceResponse) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.peek(&key) {
            if !existing.is_expired(self.ttl) {
                return Err(CacheError::AlreadyExists);
            }
        }
        entries.put(key, CachedEntry { response: response.clone(), created_at: Instant::now() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microbatch_core::{DataType, Tensor};

    fn create_request(content: &[u8]) -> InferenceRequest {
        let (req, _rx) = InferenceRequest::new(
            "resnet50",
            vec![Tensor::new("x", DataType::F32, vec![2, 3]).with_data(content.to_vec())],
        );
        req
    }

    fn create_response(request: &InferenceRequest) -> InferenceResponse {
        InferenceResponse::new(request.id(), request.model.clone(), vec![])
    }

    #[test]
    fn test_cache_hit() {
        let cache = LruResponseCache::new(100, None);
        let request = create_request(b"hello");
        let key = cache.hash(&request).unwrap();

        cache.insert(key, &create_response(&request)).unwrap();

        let cached = cache.lookup(key).unwrap();
        assert_eq!(cached.request_id, request.id());
    }

    #[test]
    fn test_cache_miss() {
        let cache = LruResponseCache::new(100, None);
        let request = create_request(b"hello");
        let key = cache.hash(&request).unwrap();

        assert_eq!(cache.lookup(key), Err(CacheError::NotFound));
    }

    #[test]
    fn test_insert_is_at_most_once() {
        let cache = LruResponseCache::new(100, None);
        let request = create_request(b"hello");
        let key = cache.hash(&request).unwrap();

        cache.insert(key, &create_response(&request)).unwrap();
        assert_eq!(
            cache.insert(key, &create_response(&request)),
            Err(CacheError::AlreadyExists)
        );
    }

    #[test]
    fn test_hash_differs_by_content() {
        let cache = LruResponseCache::new(100, None);
        let a = cache.hash(&create_request(b"one")).unwrap();
        let b = cache.hash(&create_request(b"two")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_differs_by_model() {
        let cache = LruResponseCache::new(100, None);
        let (req_a, _rx) = InferenceRequest::new("model-a", vec![]);
        let (req_b, _rx2) = InferenceRequest::new("model-b", vec![]);
        assert_ne!(cache.hash(&req_a).unwrap(), cache.hash(&req_b).unwrap());
    }

    #[test]
    fn test_hash_is_stable() {
        let cache = LruResponseCache::new(100, None);
        let request = create_request(b"same");
        assert_eq!(cache.hash(&request).unwrap(), cache.hash(&request).unwrap());
    }

    #[test]
    fn test_ttl_expiration() {
        let cache = LruResponseCache::new(100, Some(Duration::from_millis(1)));
        let request = create_request(b"hello");
        let key = cache.hash(&request).unwrap();
        cache.insert(key, &create_response(&request)).unwrap();

        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(cache.lookup(key), Err(CacheError::NotFound));
        // An expired entry can be replaced without AlreadyExists.
        cache.insert(key, &create_response(&request)).unwrap();
    }

    #[test]
    fn test_lru_eviction() {
        let cache = LruResponseCache::new(2, None);
        let requests: Vec<_> = [b"one".as_slice(), b"two", b"three"]
            .into_iter()
            .map(create_request)
            .collect();
        let keys: Vec<_> = requests.iter().map(|r| cache.hash(r).unwrap()).collect();

        for (key, request) in keys.iter().zip(&requests) {
            cache.insert(*key, &create_response(request)).unwrap();
        }

        assert_eq!(cache.lookup(keys[0]), Err(CacheError::NotFound));
        assert!(cache.lookup(keys[1]).is_ok());
        assert!(cache.lookup(keys[2]).is_ok());
    }
}
