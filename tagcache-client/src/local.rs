//! # Local LRU Cache
//!
//! An optional in-process cache in front of the server. It is bounded by entry
//! count, honours per-entry TTLs, and remembers tags so that invalidations
//! issued through the same client also evict local copies. Entries filled
//! from a read have unknown tags and are evicted by every tag invalidation.
//!
//! ## Design Principles
//!
//! 1. **Index-Linked LRU**: Nodes live in a dense arena and link to each other
//!    by slot index, so recency updates are O(1) without pointers.
//! 2. **Lazy Expiry**: Expired entries are dropped when touched.
//! 3. **Explicit Component**: The cache is owned by a client instance; nothing
//!    is global.
//!
//! ```text
//! LocalCache
//!   └── inner: Mutex<LruInner>
//!         ├── map: HashMap<Arc<str>, usize>
//!         ├── nodes: Vec<Option<Node>>
//!         ├── free: Vec<usize>
//!         └── head (oldest) / tail (newest)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;

use tagcache_common::Value;

struct Node {
    key: Arc<str>,
    value: Value,
    /// `None` when the entry came from a read and its tags are unknown.
    tags: Option<Vec<String>>,
    expires_at: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Node {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| now >= deadline)
    }

    fn may_have_tag(&self, tag: &str) -> bool {
        self.tags
            .as_ref()
            .map_or(true, |tags| tags.iter().any(|t| t == tag))
    }
}

struct LruInner {
    map: HashMap<Arc<str>, usize, RandomState>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruInner {
    fn new() -> Self {
        LruInner {
            map: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev.and_then(|p| self.nodes[p].as_mut()) {
            Some(prev_node) => prev_node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.nodes[n].as_mut()) {
            Some(next_node) => next_node.prev = prev,
            None => self.tail = prev,
        }
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn link_back(&mut self, idx: usize) {
        let tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = tail;
            node.next = None;
        }
        match tail.and_then(|t| self.nodes[t].as_mut()) {
            Some(tail_node) => tail_node.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.tail != Some(idx) {
            self.unlink(idx);
            self.link_back(idx);
        }
    }

    fn insert_new(&mut self, node: Node) {
        let key = Arc::clone(&node.key);
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.nodes.push(None);
                self.nodes.len() - 1
            }
        };
        self.nodes[idx] = Some(node);
        self.link_back(idx);
        self.map.insert(key, idx);
    }

    fn remove_idx(&mut self, idx: usize) -> bool {
        let key = match self.nodes[idx].as_ref() {
            Some(node) => Arc::clone(&node.key),
            None => return false,
        };
        self.unlink(idx);
        self.nodes[idx] = None;
        self.map.remove(&*key);
        self.free.push(idx);
        true
    }

    fn pop_lru(&mut self) -> bool {
        match self.head {
            Some(idx) => self.remove_idx(idx),
            None => false,
        }
    }

    fn remove_where<F: Fn(&Node) -> bool>(&mut self, predicate: F) -> usize {
        let doomed: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().filter(|n| predicate(*n)).map(|_| idx))
            .collect();
        doomed.into_iter().filter(|&idx| self.remove_idx(idx)).count()
    }
}

/// Bounded, thread-safe LRU of decoded values.
pub struct LocalCache {
    capacity: usize,
    max_ttl: Option<Duration>,
    inner: Mutex<LruInner>,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        LocalCache {
            capacity: capacity.max(1),
            max_ttl: None,
            inner: Mutex::new(LruInner::new()),
        }
    }

    /// Bounds how long any entry may be served, whatever TTL it was given.
    pub fn with_max_ttl(mut self, max_ttl: Option<Duration>) -> Self {
        self.max_ttl = max_ttl.filter(|ttl| !ttl.is_zero());
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a live entry and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let idx = *inner.map.get(key)?;
        let expired = inner.nodes[idx].as_ref()?.is_expired(now);
        if expired {
            inner.remove_idx(idx);
            return None;
        }
        inner.touch(idx);
        inner.nodes[idx].as_ref().map(|node| node.value.clone())
    }

    /// Inserts or replaces an entry, evicting the oldest when full.
    pub fn put(&self, key: &str, value: Value, tags: Option<&[String]>, ttl: Option<Duration>) {
        let ttl = match (ttl, self.max_ttl) {
            (Some(ttl), Some(max)) => Some(ttl.min(max)),
            (ttl, max) => ttl.or(max),
        };
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.map.get(key) {
            if let Some(node) = inner.nodes[idx].as_mut() {
                node.value = value;
                node.tags = tags.map(<[String]>::to_vec);
                node.expires_at = expires_at;
            }
            inner.touch(idx);
            return;
        }

        while inner.map.len() >= self.capacity {
            if !inner.pop_lru() {
                break;
            }
        }
        inner.insert_new(Node {
            key: Arc::from(key),
            value,
            tags: tags.map(<[String]>::to_vec),
            expires_at,
            prev: None,
            next: None,
        });
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.get(key).copied() {
            Some(idx) => inner.remove_idx(idx),
            None => false,
        }
    }

    pub fn remove_many<S: AsRef<str>>(&self, keys: &[S]) -> usize {
        let mut inner = self.inner.lock();
        let slots: Vec<usize> = keys
            .iter()
            .filter_map(|k| inner.map.get(k.as_ref()).copied())
            .collect();
        slots.into_iter().filter(|&idx| inner.remove_idx(idx)).count()
    }

    /// Evicts entries carrying any of `tags`.
    pub fn invalidate_tags_any<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        self.inner
            .lock()
            .remove_where(|node| tags.iter().any(|t| node.may_have_tag(t.as_ref())))
    }

    /// Evicts entries carrying every one of `tags`.
    pub fn invalidate_tags_all<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        self.inner
            .lock()
            .remove_where(|node| tags.iter().all(|t| node.may_have_tag(t.as_ref())))
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        self.inner.lock().remove_where(|node| node.is_expired(now))
    }

    pub fn clear(&self) {
        *self.inner.lock() = LruInner::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn put_get_roundtrip() {
        let cache = LocalCache::new(4);
        cache.put("alpha", Value::from("value"), None, None);
        assert_eq!(cache.get("alpha"), Some(Value::from("value")));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = LocalCache::new(2);
        cache.put("a", Value::Int(1), None, None);
        cache.put("b", Value::Int(2), None, None);
        cache.get("a");
        cache.put("c", Value::Int(3), None, None);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(Value::Int(1)));
        assert_eq!(cache.get("c"), Some(Value::Int(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn replacing_keeps_size() {
        let cache = LocalCache::new(2);
        cache.put("a", Value::Int(1), None, None);
        cache.put("a", Value::Int(2), None, None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some(Value::Int(2)));
    }

    #[test]
    fn expired_entries_disappear() {
        let cache = LocalCache::new(4);
        cache.put("a", Value::Null, None, Some(Duration::from_millis(1)));
        cache.put("b", Value::Null, None, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.purge_expired(Instant::now()), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn max_ttl_caps_every_entry() {
        let cache = LocalCache::new(4).with_max_ttl(Some(Duration::from_millis(50)));
        cache.put("untimed", Value::Int(1), None, None);
        cache.put("long", Value::Int(2), None, Some(Duration::from_secs(60)));
        assert_eq!(cache.get("untimed"), Some(Value::Int(1)));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get("untimed"), None);
        assert_eq!(cache.get("long"), None);
    }

    #[test]
    fn tag_invalidation_any_and_all() {
        let cache = LocalCache::new(8);
        cache.put("u1", Value::Int(1), Some(&tags(&["users", "vip"])), None);
        cache.put("u2", Value::Int(2), Some(&tags(&["users"])), None);
        cache.put("p1", Value::Int(3), Some(&tags(&["posts"])), None);

        assert_eq!(cache.invalidate_tags_all(&["users", "vip"]), 1);
        assert_eq!(cache.get("u1"), None);
        assert_eq!(cache.invalidate_tags_any(&["users", "posts"]), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn unknown_tags_are_evicted_by_any_tag_invalidation() {
        let cache = LocalCache::new(8);
        cache.put("read", Value::Int(1), None, None);
        cache.put("tagged", Value::Int(2), Some(&tags(&["posts"])), None);
        assert_eq!(cache.invalidate_tags_any(&["users"]), 1);
        assert_eq!(cache.get("read"), None);
        assert_eq!(cache.get("tagged"), Some(Value::Int(2)));
    }

    #[test]
    fn remove_many_counts_present_keys() {
        let cache = LocalCache::new(8);
        cache.put("a", Value::Int(1), None, None);
        cache.put("b", Value::Int(2), None, None);
        assert_eq!(cache.remove_many(&["a", "zzz"]), 1);
        assert!(cache.remove("b"));
        assert!(!cache.remove("b"));
        cache.put("c", Value::Int(3), None, None);
        cache.clear();
        assert!(cache.is_empty());
    }
}
