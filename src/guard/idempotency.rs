/// At-most-once response cache keyed by caller-supplied idempotency keys
///
/// Maps `(scope, user, resource, key)` to the exact status and body bytes of the
/// first successful response, so a retried request replays that response
/// instead of repeating the state transition. Entries expire after a TTL and the
/// cache holds at most `capacity` entries (oldest inserted evicted first).
///
/// Requests sharing a key also share an in-flight lock, so a duplicate that
/// arrives while the first is still deciding waits for its response instead of
/// racing it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    /// Route-level scope, e.g. "hitl.reject"
    pub scope: &'static str,
    pub user_id: String,
    pub resource_id: String,
    pub key: String,
}

impl IdempotencyKey {
    pub fn new(
        scope: &'static str,
        user_id: impl Into<String>,
        resource_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            user_id: user_id.into(),
            resource_id: resource_id.into(),
            key: key.into(),
        }
    }
}

/// A stored response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct Entry {
    response: CachedResponse,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<IdempotencyKey, Entry>,
    order: VecDeque<IdempotencyKey>,
}

#[derive(Debug)]
pub struct IdempotencyCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
    in_flight: Mutex<HashMap<IdempotencyKey, Arc<AsyncMutex<()>>>>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until no other request holds `key`, then hold it until the guard drops.
    /// Check the cache and store the response while holding it.
    pub async fn acquire(&self, key: &IdempotencyKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(in_flight.entry(key.clone()).or_default())
        };
        slot.lock_owned().await
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<CachedResponse> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &IdempotencyKey, now: Instant) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.response.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: IdempotencyKey, response: CachedResponse) {
        self.put_at(key, response, Instant::now())
    }

    /// Store a response. An existing live entry for the key wins: the first response is the one replayed.
    pub fn put_at(&self, key: IdempotencyKey, response: CachedResponse, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = inner.entries.get(&key) {
            if existing.expires_at > now {
                return;
            }
        }

        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }

        inner.order.retain(|k| k != &key);
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Entry {
                response,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.expires_at > now);
        let Inner { entries, order } = &mut *inner;
        order.retain(|k| entries.contains_key(k));
        let removed = before - entries.len();
        drop(inner);

        // A slot nobody holds or waits on is referenced by the map alone
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, slot| Arc::strong_count(slot) > 1);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> IdempotencyKey {
        IdempotencyKey::new("hitl.reject", "u1", "exec-1", k)
    }

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_hit_returns_identical_bytes() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        cache.put(key("k1"), response("{\"success\":true}"));
        assert_eq!(cache.get(&key("k1")), Some(response("{\"success\":true}")));
        assert_eq!(cache.get(&key("k2")), None);
    }

    #[test]
    fn test_scope_user_and_resource_are_part_of_the_key() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        cache.put(key("k1"), response("a"));
        assert!(cache.get(&IdempotencyKey::new("hitl.approve", "u1", "exec-1", "k1")).is_none());
        assert!(cache.get(&IdempotencyKey::new("hitl.reject", "u2", "exec-1", "k1")).is_none());
        assert!(cache.get(&IdempotencyKey::new("hitl.reject", "u1", "exec-2", "k1")).is_none());
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = IdempotencyCache::new(Duration::from_secs(10), 10);
        let start = Instant::now();
        cache.put_at(key("k1"), response("a"), start);

        assert!(cache.get_at(&key("k1"), start + Duration::from_secs(9)).is_some());
        assert!(cache.get_at(&key("k1"), start + Duration::from_secs(11)).is_none());
    }

    #[test]
    fn test_first_response_wins_while_live() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        cache.put(key("k1"), response("first"));
        cache.put(key("k1"), response("second"));
        assert_eq!(cache.get(&key("k1")), Some(response("first")));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 2);
        cache.put(key("a"), response("a"));
        cache.put(key("b"), response("b"));
        cache.put(key("c"), response("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_purge_expired() {
        let cache = IdempotencyCache::new(Duration::from_secs(5), 10);
        let start = Instant::now();
        cache.put_at(key("a"), response("a"), start);
        cache.put_at(key("b"), response("b"), start + Duration::from_secs(4));

        assert_eq!(cache.purge_expired_at(start + Duration::from_secs(6)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_same_key_waits_for_the_holder() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        let held = cache.acquire(&key("k1")).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), cache.acquire(&key("k1"))).await;
        assert!(blocked.is_err());
        // Other keys are independent
        let _other = cache.acquire(&key("k2")).await;

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), cache.acquire(&key("k1"))).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_purge_drops_idle_in_flight_slots() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        let held = cache.acquire(&key("k1")).await;
        drop(cache.acquire(&key("k2")).await);

        cache.purge_expired();
        assert_eq!(cache.in_flight.lock().unwrap().len(), 1);
        drop(held);
        cache.purge_expired();
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }
}
