//! Kademlia routing table: k-buckets partitioning the 160-bit id space.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{midpoint, shared_prefix_bits, successor, Id, Node};

/// Multiplier on `k` bounding each bucket's replacement cache.
const REPLACEMENT_NODE_FACTOR: usize = 5;

/// A contiguous slice of the id space holding up to `k` peers, ordered
/// least-recently-seen first, with a bounded cache of replacement peers
/// that take over when an active peer is evicted.
#[derive(Debug, Clone)]
pub struct KBucket {
    range: (Id, Id),
    ksize: usize,
    nodes: Vec<Node>,
    replacements: Vec<Node>,
    last_updated: Instant,
}

impl KBucket {
    pub fn new(lo: Id, hi: Id, ksize: usize) -> Self {
        KBucket {
            range: (lo, hi),
            ksize,
            nodes: Vec::with_capacity(ksize),
            replacements: Vec::new(),
            last_updated: Instant::now(),
        }
    }

    // === Getters ===

    pub fn range(&self) -> (Id, Id) {
        self.range
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    /// Least-recently-seen active peer.
    pub fn head(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn has_in_range(&self, id: &Id) -> bool {
        self.range.0 <= *id && *id <= self.range.1
    }

    // === Public Methods ===

    pub fn touch(&mut self) {
        self.last_updated = Instant::now();
    }

    /// Add a peer to the bucket.
    ///
    /// A peer already present moves to the most-recently-seen position.
    /// When the bucket is full the peer is parked in the replacement cache
    /// instead and `false` is returned.
    pub fn add(&mut self, node: Node) -> bool {
        if let Some(index) = self.nodes.iter().position(|n| n.id == node.id) {
            self.nodes.remove(index);
            self.nodes.push(node);
            true
        } else if self.nodes.len() < self.ksize {
            self.nodes.push(node);
            true
        } else {
            self.replacements.retain(|n| n.id != node.id);
            self.replacements.push(node);
            while self.replacements.len() > self.ksize * REPLACEMENT_NODE_FACTOR {
                self.replacements.remove(0);
            }
            false
        }
    }

    /// Remove a peer; an evicted active slot is refilled with the most
    /// recently added replacement.
    pub fn remove(&mut self, id: &Id) {
        self.replacements.retain(|n| n.id != *id);

        if let Some(index) = self.nodes.iter().position(|n| n.id == *id) {
            self.nodes.remove(index);

            if let Some(replacement) = self.replacements.pop() {
                self.nodes.push(replacement);
            }
        }
    }

    /// Split at the range midpoint, redistributing active and replacement
    /// peers into whichever half contains their id.
    pub fn split(&self) -> (KBucket, KBucket) {
        let mid = midpoint(&self.range.0, &self.range.1);

        let mut lower = KBucket::new(self.range.0, mid, self.ksize);
        let mut upper = KBucket::new(successor(&mid), self.range.1, self.ksize);

        for node in self.nodes.iter().chain(self.replacements.iter()) {
            let half = if node.id <= mid { &mut lower } else { &mut upper };
            half.add(node.clone());
        }

        (lower, upper)
    }

    /// Length of the bit prefix shared by all active peers; the splitting
    /// heuristic in [RoutingTable::add_contact].
    pub fn depth(&self) -> usize {
        let ids: Vec<Id> = self.nodes.iter().map(|n| n.id).collect();
        shared_prefix_bits(&ids)
    }

    pub fn is_new_node(&self, node: &Node) -> bool {
        !self
            .nodes
            .iter()
            .any(|n| n.id == node.id && n.address == node.address)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// What [RoutingTable::add_contact] wants its caller to do next.
///
/// The table owns no socket; when a full bucket can't split, the caller
/// should ping the bucket's least-recently-seen peer and let the response
/// or timeout decide the eviction.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Added,
    PingHead(Node),
}

#[derive(Debug, Clone)]
/// An ordered list of [KBucket]s whose ranges partition the id space
/// with no gaps or overlaps.
pub struct RoutingTable {
    id: Id,
    ksize: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(id: Id, ksize: usize) -> Self {
        RoutingTable {
            id,
            ksize,
            buckets: vec![KBucket::new(Id::MIN, Id::MAX, ksize)],
        }
    }

    // === Getters ===

    /// The [Id] of this node, where distances are measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn ksize(&self) -> usize {
        self.ksize
    }

    // === Public Methods ===

    /// Attempt to add a peer, splitting buckets near this node's own id as
    /// needed.
    pub fn add_contact(&mut self, node: Node) -> AddOutcome {
        if node.id == self.id {
            // Never add self to the routing table.
            return AddOutcome::Added;
        }

        loop {
            let index = self.bucket_index(&node.id);
            let bucket = &mut self.buckets[index];

            if bucket.add(node.clone()) {
                return AddOutcome::Added;
            }

            // Full bucket. Split only near our own neighborhood (or while
            // the depth heuristic allows); otherwise probe the least
            // recently seen peer, with the newcomer already parked in the
            // replacement cache.
            if bucket.has_in_range(&self.id) || bucket.depth() % 5 != 0 {
                self.split_bucket(index);
            } else {
                let head = bucket
                    .head()
                    .cloned()
                    .unwrap_or_else(|| node.clone());
                debug!(?head, "Bucket full, probing least recently seen peer");
                return AddOutcome::PingHead(head);
            }
        }
    }

    pub fn remove_contact(&mut self, id: &Id) {
        let index = self.bucket_index(id);
        self.buckets[index].remove(id);
    }

    /// Whether this exact peer (id and address) is unknown to the table.
    pub fn is_new_node(&self, node: &Node) -> bool {
        let index = self.bucket_index(&node.id);
        self.buckets[index].is_new_node(node)
    }

    /// Up to `k` peers nearest `target`, ascending by distance.
    ///
    /// Traverses buckets outward from the one covering `target`, which is
    /// touched as a side effect (it is demonstrably in use).
    pub fn find_neighbors(&mut self, target: &Id, k: usize, exclude: Option<&Node>) -> Vec<Node> {
        let start = self.bucket_index(target);
        self.buckets[start].touch();

        let mut found: Vec<Node> = Vec::with_capacity(k);

        for node in TableTraverser::new(&self.buckets, start) {
            let excluded = exclude.map_or(false, |peer| node.same_home_as(peer));
            if node.id != *target && !excluded {
                found.push(node.clone());
            }
            if found.len() == k {
                break;
            }
        }

        found.sort_by_key(|node| node.id.xor(target));
        found
    }

    /// Ranges of buckets not touched within `window`; refresh targets.
    pub fn stale_buckets(&self, window: Duration) -> Vec<(Id, Id)> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.last_updated().elapsed() > window)
            .map(|bucket| bucket.range())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Every active peer, in bucket order.
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter().cloned())
            .collect()
    }

    // === Private Methods ===

    fn bucket_index(&self, id: &Id) -> usize {
        // Ranges are sorted and partition the space, so the first bucket
        // whose upper bound covers the id is the unique owner.
        self.buckets
            .iter()
            .position(|bucket| *id <= bucket.range().1)
            .unwrap_or(self.buckets.len() - 1)
    }

    fn split_bucket(&mut self, index: usize) {
        let (lower, upper) = self.buckets[index].split();
        self.buckets[index] = lower;
        self.buckets.insert(index + 1, upper);
    }

    #[cfg(test)]
    fn contains(&self, id: &Id) -> bool {
        self.buckets[self.bucket_index(id)]
            .nodes()
            .iter()
            .any(|node| node.id == *id)
    }
}

/// Iterates peers starting at one bucket and alternating outward
/// left/right until the table is exhausted.
struct TableTraverser<'a> {
    current: std::slice::Iter<'a, Node>,
    left: Vec<&'a KBucket>,
    right: std::collections::VecDeque<&'a KBucket>,
    go_left: bool,
}

impl<'a> TableTraverser<'a> {
    fn new(buckets: &'a [KBucket], start: usize) -> Self {
        TableTraverser {
            current: buckets[start].nodes().iter(),
            left: buckets[..start].iter().collect(),
            right: buckets[start + 1..].iter().collect(),
            go_left: true,
        }
    }
}

impl<'a> Iterator for TableTraverser<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.current.next() {
                return Some(node);
            }

            if self.go_left {
                if let Some(bucket) = self.left.pop() {
                    self.current = bucket.nodes().iter();
                    self.go_left = false;
                    continue;
                }
            }

            if let Some(bucket) = self.right.pop_front() {
                self.current = bucket.nodes().iter();
                self.go_left = true;
                continue;
            }

            if let Some(bucket) = self.left.pop() {
                self.current = bucket.nodes().iter();
                continue;
            }

            return None;
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;

    fn node_with_id(id: Id) -> Node {
        Node::new(id, SocketAddrV4::new([127, 0, 0, 1].into(), rand::random()))
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random(), 20);
        assert!(table.is_empty());

        table.add_contact(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random(), 20);

        let node = Node::random();
        table.add_contact(node.clone());
        table.add_contact(node);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random(), 20);
        let node = node_with_id(*table.id());

        assert_eq!(table.add_contact(node), AddOutcome::Added);
        assert!(table.is_empty());
    }

    #[test]
    fn remove() {
        let mut table = RoutingTable::new(Id::random(), 20);
        let node = Node::random();

        table.add_contact(node.clone());
        assert!(table.contains(&node.id));

        table.remove_contact(&node.id);
        assert!(!table.contains(&node.id));
    }

    #[test]
    fn full_bucket_parks_newcomer_and_promotes_on_removal() {
        // Scenario: k=2 bucket receives P1, P2, P3; P3 lands in the
        // replacement cache; removing P1 promotes P3.
        let mut bucket = KBucket::new(Id::MIN, Id::MAX, 2);

        let p1 = Node::random();
        let p2 = Node::random();
        let p3 = Node::random();

        assert!(bucket.add(p1.clone()));
        assert!(bucket.add(p2.clone()));
        assert!(!bucket.add(p3.clone()));
        assert_eq!(bucket.len(), 2);

        bucket.remove(&p1.id);

        assert_eq!(bucket.len(), 2);
        assert!(bucket.nodes().iter().any(|n| n.id == p3.id));
        assert!(!bucket.nodes().iter().any(|n| n.id == p1.id));
    }

    #[test]
    fn readd_refreshes_position() {
        let mut bucket = KBucket::new(Id::MIN, Id::MAX, 3);

        let a = Node::random();
        let b = Node::random();

        bucket.add(a.clone());
        bucket.add(b.clone());
        assert_eq!(bucket.head().map(|n| n.id), Some(a.id));

        bucket.add(a.clone());
        assert_eq!(bucket.head().map(|n| n.id), Some(b.id));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn replacement_cache_is_bounded() {
        let mut bucket = KBucket::new(Id::MIN, Id::MAX, 2);

        for _ in 0..2 {
            bucket.add(Node::random());
        }
        for _ in 0..20 {
            assert!(!bucket.add(Node::random()));
        }

        assert!(bucket.replacements.len() <= 2 * REPLACEMENT_NODE_FACTOR);
    }

    #[test]
    fn split_partitions_by_midpoint() {
        let mut bucket = KBucket::new(Id::MIN, Id::MAX, 64);

        let nodes: Vec<Node> = (0..32).map(|_| Node::random()).collect();
        for node in &nodes {
            bucket.add(node.clone());
        }

        let (lower, upper) = bucket.split();
        let mid = midpoint(&Id::MIN, &Id::MAX);

        assert_eq!(lower.len() + upper.len(), nodes.len());

        for node in &nodes {
            let in_lower = lower.nodes().iter().any(|n| n.id == node.id);
            let in_upper = upper.nodes().iter().any(|n| n.id == node.id);

            assert!(in_lower != in_upper, "node must land in exactly one half");
            assert_eq!(in_lower, node.id <= mid);
        }
    }

    #[test]
    fn ranges_partition_the_space_after_splits() {
        let mut table = RoutingTable::new(Id::random(), 2);

        for _ in 0..64 {
            table.add_contact(Node::random());
        }

        let mut expected_lo = Id::MIN;
        for bucket in &table.buckets {
            let (lo, hi) = bucket.range();
            assert_eq!(lo, expected_lo);
            assert!(lo <= hi);
            expected_lo = successor(&hi);
        }
        assert_eq!(table.buckets.last().map(|b| b.range().1), Some(Id::MAX));
    }

    #[test]
    fn find_neighbors_sorted_and_bounded() {
        let mut table = RoutingTable::new(Id::random(), 20);

        for _ in 0..100 {
            table.add_contact(Node::random());
        }

        let target = Id::random();
        let neighbors = table.find_neighbors(&target, 20, None);

        assert!(neighbors.len() <= 20);

        let distances: Vec<_> = neighbors.iter().map(|n| n.id.xor(&target)).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn find_neighbors_excludes_home() {
        let mut table = RoutingTable::new(Id::random(), 20);

        let excluded = Node::random();
        table.add_contact(excluded.clone());
        for _ in 0..10 {
            table.add_contact(Node::random());
        }

        let neighbors = table.find_neighbors(&Id::random(), 20, Some(&excluded));

        assert!(!neighbors.iter().any(|n| n.same_home_as(&excluded)));
    }

    #[test]
    fn stale_buckets_after_window() {
        let table = RoutingTable::new(Id::random(), 20);

        assert!(table.stale_buckets(Duration::from_secs(3600)).is_empty());
        assert_eq!(table.stale_buckets(Duration::ZERO).len(), 1);
    }
}
