/// An implementation of an LRU (Least Recently Used) cache.
///
use std::{collections::HashMap, fmt::Debug, hash::Hash};

use serde::{Deserialize, Serialize};

/// Size limits for a chunk cache.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Maximum number of bytes held in the cache
    pub size: u64,

    /// Maximum number of entries held in the cache
    pub nelems: usize,
}

impl CachePolicy {
    /// A policy that caches nothing. Every write goes straight to the block store.
    pub const DISABLED: CachePolicy = CachePolicy { size: 0, nelems: 0 };
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            size: 16 * 1024 * 1024,
            nelems: 1009,
        }
    }
}

/// A trait for objects that can be cached
///
/// Cacheable objects must be able to self report their size via the ``size`` method.
///
pub(crate) trait Cacheable: Sized {
    /// Return the number of bytes the object takes up in RAM
    fn size(&self) -> u64;
}

/// An LRU (least recently used) cache.
///
/// Values must implement ``Cacheable``, which self reports size, intended to be the number of
/// bytes (more or less) an object takes up in memory.
///
/// When an object is added to the cache which causes the total size of objects stored in the
/// cache, or their number, to exceed the limits of the ``CachePolicy``, objects are evicted from
/// the cache until it is back under its limits. Objects are evicted in least recently used
/// order. Unlike a read through cache, values are mutable in place and evicted values are handed
/// back to the caller, which allows the cache to hold dirty data that must be written back
/// somewhere before it is dropped.
///
/// An object larger than the size limit is evicted as soon as it is inserted.
///
pub(crate) struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    policy: CachePolicy,

    /// Current sum of sizes of all entries.
    size: u64,

    /// Direct mapping from key to cache entry
    map: HashMap<K, CacheEntry<K, V>>,

    /// The most recently used key
    most_recent: Option<K>,

    /// The least recently used key
    least_recent: Option<K>,
}

/// An entry in the cache
struct CacheEntry<K, V> {
    /// The object stored by this entry
    object: V,

    /// The next more recent key
    more_recent: Option<K>,

    /// The next less recent key
    less_recent: Option<K>,

    /// The size of this entry, as reported by the object's ``Cacheable::size`` method
    size: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    /// Instantiate an empty cache with the given limits.
    ///
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            size: 0,
            map: HashMap::new(),
            most_recent: None,
            least_recent: None,
        }
    }

    /// Change the cache limits, returning any entries evicted to satisfy the new limits.
    ///
    pub fn set_policy(&mut self, policy: CachePolicy) -> Vec<(K, V)> {
        self.policy = policy;
        self.enforce_limits()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get a mutable reference to an object and mark it as the most recently used.
    ///
    #[cfg(test)]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.unlink(key);
        self.link_most_recent(key.clone());

        self.map.get_mut(key).map(|entry| &mut entry.object)
    }

    /// Add an object to the cache, replacing any object already stored under the same key.
    ///
    /// Returns the objects evicted to keep the cache within its limits, least recently used
    /// first. The replaced object, if any, is not returned.
    ///
    pub fn insert(&mut self, key: K, object: V) -> Vec<(K, V)> {
        self.remove(&key);

        let size = object.size();
        let entry = CacheEntry {
            object,
            more_recent: None,
            less_recent: None,
            size,
        };
        self.size += size;
        self.map.insert(key.clone(), entry);
        self.link_most_recent(key);

        self.enforce_limits()
    }

    /// Remove an object from the cache
    ///
    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.unlink(key);
        let entry = self.map.remove(key)?;
        self.size -= entry.size;

        Some(entry.object)
    }

    /// Remove every object from the cache, least recently used first.
    ///
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.map.len());
        while let Some(key) = self.least_recent.clone() {
            if let Some(object) = self.remove(&key) {
                drained.push((key, object));
            }
        }

        drained
    }

    /// Visit every object in the cache, without changing their recency.
    ///
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.map.iter_mut().map(|(key, entry)| (key, &mut entry.object))
    }

    /// Evict from the least recently used end until within limits.
    ///
    fn enforce_limits(&mut self) -> Vec<(K, V)> {
        let mut evicted = vec![];
        while self.size > self.policy.size || self.map.len() > self.policy.nelems {
            let key = match self.least_recent.clone() {
                Some(key) => key,
                None => break,
            };
            if let Some(object) = self.remove(&key) {
                evicted.push((key, object));
            }
        }

        evicted
    }

    /// Detach an entry from the linked list, joining its neighbors.
    ///
    fn unlink(&mut self, key: &K) {
        let (more_recent, less_recent) = match self.map.get(key) {
            Some(entry) => (entry.more_recent.clone(), entry.less_recent.clone()),
            None => return,
        };

        match &more_recent {
            Some(more_key) => {
                if let Some(entry) = self.map.get_mut(more_key) {
                    entry.less_recent = less_recent.clone();
                }
            }
            None => self.most_recent = less_recent.clone(),
        }

        match &less_recent {
            Some(less_key) => {
                if let Some(entry) = self.map.get_mut(less_key) {
                    entry.more_recent = more_recent.clone();
                }
            }
            None => self.least_recent = more_recent.clone(),
        }

        if let Some(entry) = self.map.get_mut(key) {
            entry.more_recent = None;
            entry.less_recent = None;
        }
    }

    /// Attach a detached entry at the most recently used end of the linked list.
    ///
    fn link_most_recent(&mut self, key: K) {
        let old_head = self.most_recent.replace(key.clone());
        if let Some(old_key) = &old_head {
            if let Some(entry) = self.map.get_mut(old_key) {
                entry.more_recent = Some(key.clone());
            }
        }
        if let Some(entry) = self.map.get_mut(&key) {
            entry.more_recent = None;
            entry.less_recent = old_head;
        }
        if self.least_recent.is_none() {
            // This is the only object in the list, so it is also the tail
            self.least_recent = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct DummyValue {
        value: u32,
        size: u64,
    }

    impl DummyValue {
        fn new(value: u32, size: u64) -> Self {
            DummyValue { value, size }
        }
    }

    impl Cacheable for DummyValue {
        fn size(&self) -> u64 {
            self.size
        }
    }

    fn policy(size: u64, nelems: usize) -> CachePolicy {
        CachePolicy { size, nelems }
    }

    fn collect_linked_list(cache: &Cache<u32, DummyValue>) -> Vec<u32> {
        // From front to back
        let mut frontwise: Vec<u32> = vec![];
        let mut current = cache.most_recent;
        while let Some(key) = current {
            let node = &cache.map[&key];
            frontwise.push(node.object.value);
            current = node.less_recent;
        }

        // From back to front
        let mut backwise: Vec<u32> = vec![];
        let mut current = cache.least_recent;
        while let Some(key) = current {
            let node = &cache.map[&key];
            backwise.push(node.object.value);
            current = node.more_recent;
        }
        backwise.reverse();

        assert_eq!(frontwise, backwise);

        frontwise
    }

    fn keys(evicted: Vec<(u32, DummyValue)>) -> Vec<u32> {
        evicted.into_iter().map(|(key, _)| key).collect()
    }

    #[test]
    fn test_common_use() {
        let mut cache = Cache::new(policy(100, 100));
        assert!(cache.insert(0, DummyValue::new(0, 25)).is_empty());
        assert!(cache.insert(1, DummyValue::new(1, 25)).is_empty());
        assert!(cache.insert(2, DummyValue::new(2, 25)).is_empty());
        assert_eq!(collect_linked_list(&cache), vec![2, 1, 0]);
        assert_eq!(cache.size(), 75);

        // Touching moves to the front
        assert_eq!(cache.get_mut(&0).map(|v| v.value), Some(0));
        assert_eq!(collect_linked_list(&cache), vec![0, 2, 1]);

        // Touching the head is a no-op
        cache.get_mut(&0);
        assert_eq!(collect_linked_list(&cache), vec![0, 2, 1]);

        // Exceeding the size limit evicts least recently used
        let evicted = cache.insert(3, DummyValue::new(3, 50));
        assert_eq!(keys(evicted), vec![1, 2]);
        assert_eq!(collect_linked_list(&cache), vec![3, 0]);
        assert_eq!(cache.size(), 75);

        assert!(cache.get_mut(&1).is_none());
    }

    #[test]
    fn test_mutate_in_place() {
        let mut cache = Cache::new(policy(100, 100));
        cache.insert(7, DummyValue::new(7, 10));
        if let Some(value) = cache.get_mut(&7) {
            value.value = 8;
        }
        assert_eq!(cache.remove(&7), Some(DummyValue::new(8, 10)));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size(), 0);
        assert_eq!(collect_linked_list(&cache), Vec::<u32>::new());
    }

    #[test]
    fn test_entry_limit() {
        let mut cache = Cache::new(policy(1000, 2));
        cache.insert(0, DummyValue::new(0, 1));
        cache.insert(1, DummyValue::new(1, 1));
        let evicted = cache.insert(2, DummyValue::new(2, 1));
        assert_eq!(keys(evicted), vec![0]);
        assert_eq!(collect_linked_list(&cache), vec![2, 1]);
    }

    #[test]
    fn test_oversized_object_evicted_immediately() {
        let mut cache = Cache::new(CachePolicy::DISABLED);
        let evicted = cache.insert(5, DummyValue::new(5, 1));
        assert_eq!(evicted, vec![(5, DummyValue::new(5, 1))]);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.most_recent, None);
        assert_eq!(cache.least_recent, None);
    }

    #[test]
    fn test_replace_same_key() {
        let mut cache = Cache::new(policy(100, 100));
        cache.insert(0, DummyValue::new(0, 40));
        cache.insert(1, DummyValue::new(1, 40));
        let evicted = cache.insert(0, DummyValue::new(10, 50));
        assert!(evicted.is_empty());
        assert_eq!(cache.size(), 90);
        assert_eq!(collect_linked_list(&cache), vec![10, 1]);
    }

    #[test]
    fn test_remove_middle() {
        let mut cache = Cache::new(policy(100, 100));
        for key in 0..5 {
            cache.insert(key, DummyValue::new(key, 1));
        }
        cache.remove(&2);
        assert_eq!(collect_linked_list(&cache), vec![4, 3, 1, 0]);
        cache.remove(&0);
        assert_eq!(collect_linked_list(&cache), vec![4, 3, 1]);
        cache.remove(&4);
        assert_eq!(collect_linked_list(&cache), vec![3, 1]);
    }

    #[test]
    fn test_drain_and_shrink() {
        let mut cache = Cache::new(policy(100, 100));
        for key in 0..4 {
            cache.insert(key, DummyValue::new(key, 10));
        }
        cache.get_mut(&0);

        let evicted = cache.set_policy(policy(20, 100));
        assert_eq!(keys(evicted), vec![1, 2]);
        assert_eq!(collect_linked_list(&cache), vec![0, 3]);

        let drained = cache.drain();
        assert_eq!(keys(drained), vec![3, 0]);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size(), 0);
    }
}
