use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

/// A bounded bucket of key/value pairs with a local depth.
#[derive(Debug)]
struct Bucket<K, V> {
    items: Vec<(K, V)>,
    capacity: usize,
    depth: usize,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(capacity: usize, depth: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            depth,
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Insert or update in place. Returns false when the bucket is full and
    /// the key is not already present.
    fn insert(&mut self, key: K, value: V) -> bool {
        if let Some(slot) = self.items.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.items.push((key, value));
        true
    }
}

#[derive(Debug)]
struct Directory<K, V> {
    global_depth: usize,
    /// Arena of buckets; buckets are never deallocated (no merging).
    buckets: Vec<Bucket<K, V>>,
    /// Directory of 2^global_depth slots, each an index into `buckets`.
    /// Doubling duplicates indices, so two slots may share one bucket.
    dir: Vec<usize>,
}

/// Extendible hash table mapping resident page ids to frame ids in the
/// buffer pool. A single latch serializes every operation, reads included.
#[derive(Debug)]
pub struct ExtendibleHashTable<K, V> {
    inner: Mutex<Directory<K, V>>,
    bucket_size: usize,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        let inner = Directory {
            global_depth: 0,
            buckets: vec![Bucket::new(bucket_size, 0)],
            dir: vec![0],
        };
        Self {
            inner: Mutex::new(inner),
            bucket_size,
        }
    }

    fn hash(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    fn index_of(global_depth: usize, key: &K) -> usize {
        let mask = (1usize << global_depth) - 1;
        Self::hash(key) & mask
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let slot = inner.dir[Self::index_of(inner.global_depth, key)];
        inner.buckets[slot].find(key).cloned()
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let slot = inner.dir[Self::index_of(inner.global_depth, key)];
        inner.buckets[slot].remove(key)
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        loop {
            let index = Self::index_of(inner.global_depth, &key);
            let slot = inner.dir[index];
            if inner.buckets[slot].insert(key.clone(), value.clone()) {
                return;
            }
            // Full bucket: grow the directory if the bucket is already at
            // global depth, then split it and retry.
            if inner.buckets[slot].depth == inner.global_depth {
                inner.global_depth += 1;
                let old_size = inner.dir.len();
                for i in 0..old_size {
                    let dup = inner.dir[i];
                    inner.dir.push(dup);
                }
            }
            inner.buckets[slot].depth += 1;
            let new_depth = inner.buckets[slot].depth;
            let new_slot = inner.buckets.len();
            inner.buckets.push(Bucket::new(self.bucket_size, new_depth));

            // Directory entries whose low `new_depth` bits match the
            // inserting key's pattern now address the sibling bucket; the
            // original bucket keeps the complementary pattern.
            let mask = (1usize << new_depth) - 1;
            let pattern = index & mask;
            for i in 0..inner.dir.len() {
                if inner.dir[i] == slot && (i & mask) == pattern {
                    inner.dir[i] = new_slot;
                }
            }
            // Redistribute items by the same bit pattern.
            let moved: Vec<(K, V)> = {
                let bucket = &mut inner.buckets[slot];
                let mut moved = Vec::new();
                bucket.items.retain(|(k, v)| {
                    if Self::hash(k) & mask == pattern {
                        moved.push((k.clone(), v.clone()));
                        false
                    } else {
                        true
                    }
                });
                moved
            };
            inner.buckets[new_slot].items = moved;
        }
    }

    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[dir_index]].depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }
}
