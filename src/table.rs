/// String-keyed hash table used for the global table and the function
/// directory.
///
/// Collision handling is chaining: each bucket heads a singly linked list
/// of `(key, value)` nodes, with new keys prepended. The hash is the
/// polynomial accumulator `h = h * 33 + byte` seeded with 4123. When
/// occupancy passes 0.85 the bucket array doubles and every node is
/// rehashed in place. Replacing or deleting an entry drops the old value.

const LOAD_TOLERANCE: f64 = 0.85;

struct Node<V> {
    key: String,
    value: V,
    next: Option<Box<Node<V>>>,
}

pub struct Table<V> {
    buckets: Vec<Option<Box<Node<V>>>>,
    length: usize,
}

impl<V> Table<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buckets = Vec::with_capacity(capacity);
        buckets.resize_with(capacity, || None);
        Table { buckets, length: 0 }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn index(key: &str, capacity: usize) -> usize {
        let mut h: usize = 4123;
        for b in key.bytes() {
            h = h.wrapping_shl(5).wrapping_add(h).wrapping_add(b as usize);
        }
        h % capacity
    }

    /// Bind `key` to `value`. An existing binding is overwritten and its
    /// old value dropped; a new key is prepended to its bucket's chain.
    pub fn set(&mut self, key: &str, value: V) {
        let occupancy = self.length as f64 / self.buckets.len() as f64;
        if occupancy > LOAD_TOLERANCE {
            self.grow();
        }

        let idx = Self::index(key, self.buckets.len());
        let mut cur = self.buckets[idx].as_deref_mut();
        while let Some(node) = cur {
            if node.key == key {
                node.value = value;
                return;
            }
            cur = node.next.as_deref_mut();
        }

        let head = self.buckets[idx].take();
        self.buckets[idx] = Some(Box::new(Node {
            key: key.to_owned(),
            value,
            next: head,
        }));
        self.length += 1;
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        let idx = Self::index(key, self.buckets.len());
        let mut cur = self.buckets[idx].as_deref();
        while let Some(node) = cur {
            if node.key == key {
                return Some(&node.value);
            }
            cur = node.next.as_deref();
        }
        None
    }

    /// Unlink `key` and return its value, or `None` if the key is absent.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let idx = Self::index(key, self.buckets.len());
        let removed = Self::unlink(&mut self.buckets[idx], key);
        if removed.is_some() {
            self.length -= 1;
        }
        removed
    }

    fn unlink(chain: &mut Option<Box<Node<V>>>, key: &str) -> Option<V> {
        if chain.as_ref().is_some_and(|node| node.key == key) {
            let node = chain.take().expect("presence checked above");
            *chain = node.next;
            return Some(node.value);
        }
        match chain {
            Some(node) => Self::unlink(&mut node.next, key),
            None => None,
        }
    }

    fn grow(&mut self) {
        let new_capacity = self.buckets.len() * 2;
        let mut fresh = Vec::with_capacity(new_capacity);
        fresh.resize_with(new_capacity, || None);
        let old = std::mem::replace(&mut self.buckets, fresh);

        for mut head in old {
            while let Some(mut node) = head {
                head = node.next.take();
                let idx = Self::index(&node.key, new_capacity);
                node.next = self.buckets[idx].take();
                self.buckets[idx] = Some(node);
            }
        }
    }
}
