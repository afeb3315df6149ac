//! Caches the bodies of read responses by url, keyed to the change vector the server sent with
//! them.
//!
//! A cached body is only ever handed out through a [`ReleaseCacheItem`] lease. While a lease
//! is alive the entry can't be evicted; if the entry gets replaced underneath the lease, the
//! lease reports [`might_have_changed`](ReleaseCacheItem::might_have_changed) instead of the
//! memory going away.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;

/// Change vector stored for urls the server answered with 404.
pub const NOT_FOUND_CHANGE_VECTOR: &str = "404 Response";

#[derive(Debug)]
pub struct HttpCacheItem {
    change_vector: String,
    payload: Option<Bytes>,
    not_found: bool,
    last_server_update: Mutex<Instant>,
    /// Cache generation this item was last confirmed fresh in
    generation: AtomicU64,
    /// Number of live leases
    usages: AtomicUsize,
    /// Set when the item was replaced or removed while leased
    replaced: AtomicBool,
    last_access: AtomicU64,
}

impl HttpCacheItem {
    fn size(&self) -> usize {
        self.change_vector.len() + self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct HttpCacheItems {
    items: HashMap<String, Arc<HttpCacheItem>>,
    total_size: usize,
}

#[derive(Debug)]
pub struct HttpCache {
    items: Mutex<HttpCacheItems>,
    max_size: usize,
    generation: Arc<AtomicU64>,
    access_clock: AtomicU64,
}

impl HttpCache {
    /// Creates a cache holding up to `max_size` bytes of change vectors and payloads.
    ///
    /// The limit is soft: when every entry is leased, a new entry is stored anyway rather than
    /// waiting for a lease to end.
    pub fn new(max_size: usize) -> Self {
        Self {
            items: Mutex::new(HttpCacheItems::default()),
            max_size,
            generation: Arc::new(AtomicU64::new(0)),
            access_clock: AtomicU64::new(0),
        }
    }

    /// Leases the entry for `url`. The lease is empty when nothing is cached.
    pub fn get(&self, url: &str) -> ReleaseCacheItem {
        let items = self.lock_items();
        let item = items.items.get(url).cloned();
        if let Some(item) = &item {
            item.usages.fetch_add(1, Ordering::AcqRel);
            item.last_access.store(self.tick(), Ordering::Release);
        }

        ReleaseCacheItem {
            item,
            cache_generation: self.generation.clone(),
        }
    }

    /// Caches `payload` for `url` under `change_vector`, replacing any previous entry.
    pub fn store(&self, url: &str, change_vector: &str, payload: Bytes) {
        self.insert(url, change_vector, Some(payload), false);
    }

    /// Remembers that the server reported `url` as missing.
    pub fn set_not_found(&self, url: &str) {
        self.insert(url, NOT_FOUND_CHANGE_VECTOR, None, true);
    }

    fn insert(&self, url: &str, change_vector: &str, payload: Option<Bytes>, not_found: bool) {
        let item = Arc::new(HttpCacheItem {
            change_vector: change_vector.to_string(),
            payload,
            not_found,
            last_server_update: Mutex::new(Instant::now()),
            generation: AtomicU64::new(self.generation.load(Ordering::Acquire)),
            usages: AtomicUsize::new(0),
            replaced: AtomicBool::new(false),
            last_access: AtomicU64::new(self.tick()),
        });
        let size = item.size();

        let mut items = self.lock_items();
        if let Some(previous) = items.items.insert(url.to_string(), item) {
            items.total_size -= previous.size();
            previous.replaced.store(true, Ordering::Release);
        }
        items.total_size += size;

        self.evict(&mut items, url);
    }

    /// Drops least recently used, unleased entries until the cache fits in `max_size`.
    fn evict(&self, items: &mut HttpCacheItems, keep: &str) {
        while items.total_size > self.max_size {
            let victim = items
                .items
                .iter()
                .filter(|(url, item)| {
                    url.as_str() != keep && item.usages.load(Ordering::Acquire) == 0
                })
                .min_by_key(|(_, item)| item.last_access.load(Ordering::Acquire))
                .map(|(url, _)| url.clone());

            let Some(victim) = victim else {
                tracing::trace!(
                    "Http cache is over its size limit but every other entry is leased"
                );
                break;
            };

            if let Some(item) = items.items.remove(&victim) {
                items.total_size -= item.size();
                item.replaced.store(true, Ordering::Release);
            }
        }
    }

    /// Marks every cached entry as possibly stale. Entries stay usable for conditional
    /// requests but are no longer served without asking the server.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        let mut items = self.lock_items();
        for item in items.items.values() {
            item.replaced.store(true, Ordering::Release);
        }
        items.items.clear();
        items.total_size = 0;
    }

    pub fn number_of_items(&self) -> usize {
        self.lock_items().items.len()
    }

    pub fn total_size(&self) -> usize {
        self.lock_items().total_size
    }

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::AcqRel)
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, HttpCacheItems> {
        // A panic while holding the lock leaves the map itself consistent.
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A lease on a cached entry.
///
/// The lease ends when this value is dropped or [`release`](ReleaseCacheItem::release)d, on
/// every path out of the scope that took it.
#[derive(Debug)]
pub struct ReleaseCacheItem {
    item: Option<Arc<HttpCacheItem>>,
    cache_generation: Arc<AtomicU64>,
}

impl ReleaseCacheItem {
    pub fn is_empty(&self) -> bool {
        self.item.is_none()
    }

    pub fn change_vector(&self) -> Option<&str> {
        self.item.as_ref().map(|item| item.change_vector.as_str())
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.item.as_ref().and_then(|item| item.payload.as_ref())
    }

    pub fn is_not_found(&self) -> bool {
        self.item.as_ref().map(|item| item.not_found).unwrap_or(false)
    }

    /// Time since the server last confirmed this entry. An empty lease is infinitely old.
    pub fn age(&self) -> Duration {
        match &self.item {
            Some(item) => {
                let last_update = *item
                    .last_server_update
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                last_update.elapsed()
            }
            None => Duration::MAX,
        }
    }

    /// Whether the entry may no longer match what the server has: it was replaced or evicted
    /// while leased, or the whole cache was invalidated since it was last confirmed.
    pub fn might_have_changed(&self) -> bool {
        match &self.item {
            Some(item) => {
                item.replaced.load(Ordering::Acquire)
                    || item.generation.load(Ordering::Acquire)
                        != self.cache_generation.load(Ordering::Acquire)
            }
            None => false,
        }
    }

    /// Records that the server confirmed the entry is unchanged. Resets the age only.
    pub fn not_modified(&self) {
        if let Some(item) = &self.item {
            *item
                .last_server_update
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
            item.generation.store(
                self.cache_generation.load(Ordering::Acquire),
                Ordering::Release,
            );
        }
    }

    /// Ends the lease now instead of at the end of the scope.
    pub fn release(self) {}
}

impl Drop for ReleaseCacheItem {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            item.usages.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::{HttpCache, NOT_FOUND_CHANGE_VECTOR};

    #[test]
    fn missing_url_returns_empty_lease() {
        let cache = HttpCache::new(1024);

        let lease = cache.get("/docs?id=1");

        assert!(lease.is_empty());
        assert!(lease.change_vector().is_none());
        assert_eq!(lease.age(), Duration::MAX);
    }

    #[test]
    fn stored_entry_is_returned_with_change_vector() {
        let cache = HttpCache::new(1024);
        cache.store("/docs?id=1", "A:1", Bytes::from_static(b"{\"Results\":[]}"));

        let lease = cache.get("/docs?id=1");

        assert_eq!(lease.change_vector(), Some("A:1"));
        assert_eq!(lease.payload().unwrap().as_ref(), b"{\"Results\":[]}");
        assert!(!lease.might_have_changed());
    }

    #[test]
    fn not_modified_resets_age_but_keeps_payload() {
        // Arrange
        let cache = HttpCache::new(1024);
        cache.store("/docs?id=1", "T", Bytes::from_static(b"payload"));
        let lease = cache.get("/docs?id=1");
        std::thread::sleep(Duration::from_millis(30));
        let age_before = lease.age();

        // Act
        lease.not_modified();

        // Assert
        assert!(lease.age() < age_before);
        assert_eq!(lease.change_vector(), Some("T"));
        assert_eq!(lease.payload().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn replacing_leased_entry_marks_it_might_have_changed() {
        let cache = HttpCache::new(1024);
        cache.store("/docs?id=1", "v1", Bytes::from_static(b"one"));
        let lease = cache.get("/docs?id=1");

        cache.store("/docs?id=1", "v2", Bytes::from_static(b"two"));

        assert!(lease.might_have_changed());
        assert_eq!(lease.payload().unwrap().as_ref(), b"one");
        assert_eq!(cache.get("/docs?id=1").change_vector(), Some("v2"));
        assert_eq!(cache.number_of_items(), 1);
    }

    #[test]
    fn eviction_skips_leased_entries_and_removes_least_recently_used() {
        // Arrange: every entry is 10 bytes (2 byte change vector + 8 byte payload)
        let cache = HttpCache::new(25);
        cache.store("a", "v1", Bytes::from_static(b"aaaaaaaa"));
        cache.store("b", "v1", Bytes::from_static(b"bbbbbbbb"));
        let lease_a = cache.get("a");

        // Act
        cache.store("c", "v1", Bytes::from_static(b"cccccccc"));

        // Assert
        assert!(!cache.get("a").is_empty());
        assert!(cache.get("b").is_empty());
        assert!(!cache.get("c").is_empty());
        assert!(!lease_a.might_have_changed());
    }

    #[test]
    fn capacity_is_soft_when_everything_is_leased() {
        let cache = HttpCache::new(15);
        cache.store("a", "v1", Bytes::from_static(b"aaaaaaaa"));
        let _lease = cache.get("a");

        cache.store("b", "v1", Bytes::from_static(b"bbbbbbbb"));

        assert_eq!(cache.number_of_items(), 2);
        assert_eq!(cache.total_size(), 20);
    }

    #[test]
    fn released_lease_allows_eviction() {
        let cache = HttpCache::new(15);
        cache.store("a", "v1", Bytes::from_static(b"aaaaaaaa"));
        let lease = cache.get("a");
        lease.release();

        cache.store("b", "v1", Bytes::from_static(b"bbbbbbbb"));

        assert!(cache.get("a").is_empty());
        assert_eq!(cache.number_of_items(), 1);
    }

    #[test]
    fn not_found_marker_has_no_payload() {
        let cache = HttpCache::new(1024);
        cache.set_not_found("/docs?id=missing");

        let lease = cache.get("/docs?id=missing");

        assert!(lease.is_not_found());
        assert!(lease.payload().is_none());
        assert_eq!(lease.change_vector(), Some(NOT_FOUND_CHANGE_VECTOR));
    }

    #[test]
    fn invalidate_all_marks_entries_until_confirmed_again() {
        let cache = HttpCache::new(1024);
        cache.store("a", "v1", Bytes::from_static(b"a"));
        let lease = cache.get("a");

        cache.invalidate_all();
        assert!(lease.might_have_changed());

        lease.not_modified();
        assert!(!lease.might_have_changed());
    }
}
