/*!
Structure for holding router identities close to our own key.

Nodes in the bucket are sorted by XOR closeness to the base key; the
closest node is the first one, the farthest is the last one.
*/

use std::cmp::Ordering;

use nyx_crypto::RouterId;

/// Default number of nodes a bucket can hold.
pub const BUCKET_SIZE: usize = 8;

/// Compare which of `left` and `right` is closer to `base` in the XOR
/// metric over the 32-byte key space.
pub fn distance(base: &RouterId, left: &RouterId, right: &RouterId) -> Ordering {
    for i in 0..RouterId::SIZE {
        if left.as_bytes()[i] != right.as_bytes()[i] {
            return Ord::cmp(
                &(base.as_bytes()[i] ^ left.as_bytes()[i]),
                &(base.as_bytes()[i] ^ right.as_bytes()[i]),
            );
        }
    }
    Ordering::Equal
}

/** Holds up to `capacity` router identities sorted by XOR distance to the
base key.

Insertion of an already known key is a no-op update; when the bucket is
full a new closer node evicts the farthest one.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bucket {
    base: RouterId,
    capacity: usize,
    nodes: Vec<RouterId>,
}

impl Bucket {
    /// Create a new `Bucket` around our own key.
    pub fn new(base: RouterId, capacity: usize) -> Bucket {
        Bucket {
            base,
            capacity,
            nodes: Vec::with_capacity(capacity),
        }
    }

    fn find(&self, id: &RouterId) -> Result<usize, usize> {
        self.nodes.binary_search_by(|n| distance(&self.base, n, id))
    }

    /** Try to add a router to the bucket.

    Returns `true` if the node was added or was already present, `false`
    if the bucket is full and the node is farther than everything in it.
    */
    pub fn try_add(&mut self, id: RouterId) -> bool {
        if id == self.base {
            return false;
        }
        match self.find(&id) {
            Ok(_) => true,
            Err(index) => {
                if self.nodes.len() < self.capacity {
                    self.nodes.insert(index, id);
                    true
                } else if index < self.nodes.len() {
                    trace!("evicting farthest node for {}", id);
                    self.nodes.pop();
                    self.nodes.insert(index, id);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Remove a router from the bucket.
    pub fn remove(&mut self, id: &RouterId) {
        if let Ok(index) = self.find(id) {
            self.nodes.remove(index);
        }
    }

    /// Whether the router is in the bucket.
    pub fn contains(&self, id: &RouterId) -> bool {
        self.find(id).is_ok()
    }

    /// Number of nodes in the bucket.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the bucket holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The single known node closest to `target`. A known target is its
    /// own closest node.
    pub fn find_closest(&self, target: &RouterId) -> Option<RouterId> {
        self.nodes
            .iter()
            .min_by(|a, b| distance(target, a, b))
            .copied()
    }

    /// Up to `n` known nodes closest to `target`, closest first.
    pub fn find_closest_n(&self, target: &RouterId, n: usize) -> Vec<RouterId> {
        let mut nodes = self.nodes.clone();
        nodes.sort_by(|a, b| distance(target, a, b));
        nodes.truncate(n);
        nodes
    }

    /// Iterate over nodes sorted by distance to the base key.
    pub fn iter(&self) -> impl Iterator<Item = &RouterId> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> RouterId {
        RouterId::new([byte; RouterId::SIZE])
    }

    #[test]
    fn distance_ordering() {
        assert_eq!(Ordering::Less, distance(&id(0), &id(1), &id(2)));
        assert_eq!(Ordering::Equal, distance(&id(2), &id(2), &id(2)));
        assert_eq!(Ordering::Less, distance(&id(2), &id(0), &id(1)));
        assert_eq!(Ordering::Greater, distance(&id(2), &id(0xff), &id(0xfe)));
    }

    #[test]
    fn try_add_sorts_by_closeness() {
        let mut bucket = Bucket::new(id(0), BUCKET_SIZE);
        for byte in (1..=8).rev() {
            assert!(bucket.try_add(id(byte)));
        }
        let sorted: Vec<_> = bucket.iter().copied().collect();
        let expected: Vec<_> = (1..=8).map(id).collect();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn try_add_evicts_farthest_when_full() {
        let mut bucket = Bucket::new(id(0), 3);
        assert!(bucket.try_add(id(2)));
        assert!(bucket.try_add(id(4)));
        assert!(bucket.try_add(id(8)));

        // farther than everything in a full bucket
        assert!(!bucket.try_add(id(16)));
        // closer node evicts the farthest
        assert!(bucket.try_add(id(1)));
        assert!(bucket.contains(&id(1)));
        assert!(!bucket.contains(&id(8)));
    }

    #[test]
    fn try_add_ignores_base_and_duplicates() {
        let mut bucket = Bucket::new(id(0), BUCKET_SIZE);
        assert!(!bucket.try_add(id(0)));
        assert!(bucket.try_add(id(1)));
        assert!(bucket.try_add(id(1)));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn remove_keeps_order() {
        let mut bucket = Bucket::new(id(0), BUCKET_SIZE);
        for byte in 1..=3 {
            bucket.try_add(id(byte));
        }
        bucket.remove(&id(2));
        let rest: Vec<_> = bucket.iter().copied().collect();
        assert_eq!(rest, vec![id(1), id(3)]);
    }

    #[test]
    fn find_closest_by_xor_metric() {
        let mut bucket = Bucket::new(id(0), BUCKET_SIZE);
        bucket.try_add(id(1));
        bucket.try_add(id(5));
        assert_eq!(bucket.find_closest(&id(4)), Some(id(5)));
        // a known target is its own closest node
        assert_eq!(bucket.find_closest(&id(5)), Some(id(5)));
    }

    #[test]
    fn find_closest_n_orders_by_target() {
        let mut bucket = Bucket::new(id(0), BUCKET_SIZE);
        for byte in [1, 6, 7].iter() {
            bucket.try_add(id(*byte));
        }
        assert_eq!(bucket.find_closest_n(&id(5), 2), vec![id(7), id(6)]);
    }

    #[test]
    fn find_closest_empty() {
        let bucket = Bucket::new(id(0), BUCKET_SIZE);
        assert_eq!(bucket.find_closest(&id(1)), None);
    }
}
