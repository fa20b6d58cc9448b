//! Eviction candidate selection for the read area.

use lru::LruCache;

/// Picks which read-area entry to drop next when trimming.
pub trait EvictionPolicy: Send {
    /// A new entry of `size` bytes became evictable.
    fn insert(&mut self, name: &str, size: u64);

    /// The entry was read.
    fn touch(&mut self, name: &str);

    fn remove(&mut self, name: &str);

    /// Next victim, removed from the policy.
    fn evict(&mut self) -> Option<(String, u64)>;

    /// Give back a victim that could not be deleted; it goes first next time.
    fn restore(&mut self, name: &str, size: u64);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Least recently inserted or read goes first.
pub struct LruEviction {
    entries: LruCache<String, u64>,
}

impl Default for LruEviction {
    fn default() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }
}

impl LruEviction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for LruEviction {
    fn insert(&mut self, name: &str, size: u64) {
        self.entries.put(name.to_string(), size);
    }

    fn touch(&mut self, name: &str) {
        self.entries.promote(name);
    }

    fn remove(&mut self, name: &str) {
        self.entries.pop(name);
    }

    fn evict(&mut self) -> Option<(String, u64)> {
        self.entries.pop_lru()
    }

    fn restore(&mut self, name: &str, size: u64) {
        self.entries.put(name.to_string(), size);
        self.entries.demote(name);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_order() {
        let mut p = LruEviction::new();
        p.insert("a", 1);
        p.insert("b", 2);
        p.insert("c", 3);
        p.touch("a");
        assert_eq!(p.evict(), Some(("b".to_string(), 2)));
        p.remove("c");
        assert_eq!(p.evict(), Some(("a".to_string(), 1)));
        assert!(p.evict().is_none());

        p.insert("x", 1);
        p.insert("y", 2);
        let victim = p.evict().unwrap();
        p.insert("z", 3);
        p.restore(&victim.0, victim.1);
        assert_eq!(p.evict(), Some(("x".to_string(), 1)));
        assert!(p.is_empty());
    }
}
