//! Iterative lookup state machines.
//!
//! A crawl repeatedly queries the closest known peers to a target id,
//! merging each response's peers into a bounded candidate set, until
//! every candidate has been contacted or a value turns up. The Rpc layer
//! owns the socket; a crawl only decides who to contact next and digests
//! the outcomes.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::common::{Distance, Id, Node};

use super::messages::{FindResult, WireEntry};
use super::socket::CallId;

/// A set of peers ordered by distance to a target.
///
/// The set remembers every peer it has seen but iteration, uncontacted
/// listing, and completion checks only consider the `maxsize` closest,
/// mirroring the lookup's `k` bound.
#[derive(Debug)]
pub struct NodeHeap {
    target: Id,
    maxsize: usize,
    heap: Vec<(Distance, Node)>,
    contacted: HashSet<Id>,
}

impl NodeHeap {
    pub fn new(target: Id, maxsize: usize) -> Self {
        NodeHeap {
            target,
            maxsize,
            heap: Vec::new(),
            contacted: HashSet::new(),
        }
    }

    pub fn push(&mut self, nodes: impl IntoIterator<Item = Node>) {
        for node in nodes {
            if self.heap.iter().any(|(_, n)| n.id == node.id) {
                continue;
            }

            let distance = node.id.xor(&self.target);
            let position = self
                .heap
                .binary_search_by(|(d, _)| d.cmp(&distance))
                .unwrap_or_else(|pos| pos);
            self.heap.insert(position, (distance, node));
        }
    }

    pub fn remove(&mut self, ids: &[Id]) {
        if ids.is_empty() {
            return;
        }
        self.heap.retain(|(_, node)| !ids.contains(&node.id));
    }

    pub fn mark_contacted(&mut self, id: &Id) {
        self.contacted.insert(*id);
    }

    pub fn get_uncontacted(&self) -> Vec<Node> {
        self.iter()
            .filter(|node| !self.contacted.contains(&node.id))
            .cloned()
            .collect()
    }

    pub fn have_contacted_all(&self) -> bool {
        self.iter().all(|node| self.contacted.contains(&node.id))
    }

    /// Ids of the current closest set, in ascending distance order.
    pub fn ids(&self) -> Vec<Id> {
        self.iter().map(|node| node.id).collect()
    }

    pub fn closest(&self) -> Vec<Node> {
        self.iter().cloned().collect()
    }

    /// The single closest peer, removed from the heap.
    pub fn popleft(&mut self) -> Option<Node> {
        if self.heap.is_empty() {
            None
        } else {
            Some(self.heap.remove(0).1)
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len().min(self.maxsize)
    }

    fn iter(&self) -> impl Iterator<Item = &Node> {
        self.heap.iter().take(self.maxsize).map(|(_, node)| node)
    }
}

/// Whether a crawl looks for peers or for a stored value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrawlKind {
    Node,
    Value,
}

/// Terminal state of a crawl.
#[derive(Debug)]
pub enum CrawlOutcome {
    /// Node crawl: the final k-nearest responding candidates.
    Nodes(Vec<Node>),
    /// Value crawl: the freshest value found this round, plus the nearest
    /// peer observed *not* to hold it (the self-healing replica target).
    Value {
        entry: WireEntry,
        cache_to: Option<Node>,
    },
    /// Value crawl exhausted every candidate without finding the value.
    ValueNotFound,
}

#[derive(Debug)]
pub struct Crawl {
    target: Id,
    kind: CrawlKind,
    alpha: usize,
    nearest: NodeHeap,
    nearest_without_value: NodeHeap,
    last_ids_crawled: Vec<Id>,
    inflight: HashMap<CallId, Node>,
    found_values: Vec<WireEntry>,
    failed: Vec<Id>,
}

impl Crawl {
    pub fn new(target: Id, kind: CrawlKind, seeds: Vec<Node>, ksize: usize, alpha: usize) -> Self {
        let mut nearest = NodeHeap::new(target, ksize);
        nearest.push(seeds);

        Crawl {
            target,
            kind,
            alpha,
            nearest,
            nearest_without_value: NodeHeap::new(target, 1),
            last_ids_crawled: Vec::new(),
            inflight: HashMap::new(),
            found_values: Vec::new(),
            failed: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn kind(&self) -> CrawlKind {
        self.kind
    }

    /// True when this round's calls have all resolved or timed out.
    pub fn round_complete(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn owns_call(&self, id: &CallId) -> bool {
        self.inflight.contains_key(id)
    }

    // === Public Methods ===

    /// Pick the peers to contact this round and mark them contacted.
    ///
    /// Normally up to `alpha` of the closest uncontacted candidates; if
    /// the closest set did not change since the previous round the crawl
    /// is stalling, so every uncontacted candidate is probed at once.
    pub fn next_round(&mut self) -> Vec<Node> {
        debug_assert!(self.round_complete());

        let mut count = self.alpha;
        if self.nearest.ids() == self.last_ids_crawled {
            count = self.nearest.len();
        }
        self.last_ids_crawled = self.nearest.ids();

        let mut to_contact = self.nearest.get_uncontacted();
        to_contact.truncate(count);

        for node in &to_contact {
            self.nearest.mark_contacted(&node.id);
        }

        to_contact
    }

    /// Record the call id the socket assigned to this round's request.
    pub fn register(&mut self, id: CallId, node: Node) {
        self.inflight.insert(id, node);
    }

    pub fn on_response(&mut self, id: &CallId, result: FindResult) {
        let peer = match self.inflight.remove(id) {
            Some(peer) => peer,
            None => return,
        };

        match result {
            FindResult::Nodes(nodes) => {
                if self.kind == CrawlKind::Value {
                    // This peer answered but does not hold the value.
                    self.nearest_without_value.push(Some(peer));
                }
                self.nearest.push(nodes);
            }
            FindResult::Value(entry) => {
                self.found_values.push(entry);
            }
        }
    }

    /// A call timed out; prune that peer from the candidate set at the
    /// end of the round and never retry it within this crawl.
    pub fn on_failure(&mut self, id: &CallId) {
        if let Some(peer) = self.inflight.remove(id) {
            self.failed.push(peer.id);
        }
    }

    /// Digest a finished round. `None` means the crawl should continue
    /// with [Crawl::next_round].
    pub fn evaluate(&mut self) -> Option<CrawlOutcome> {
        debug_assert!(self.round_complete());

        let failed = std::mem::take(&mut self.failed);
        self.nearest.remove(&failed);

        if !self.found_values.is_empty() {
            let values = std::mem::take(&mut self.found_values);
            let entry = values
                .into_iter()
                .max_by_key(|entry| entry.timestamp)?;

            debug!(lookup = ?self.target, timestamp = entry.timestamp, "Crawl found a value");

            return Some(CrawlOutcome::Value {
                entry,
                cache_to: self.nearest_without_value.popleft(),
            });
        }

        if self.nearest.have_contacted_all() {
            debug!(lookup = ?self.target, candidates = self.nearest.len(), "Crawl exhausted");

            return Some(match self.kind {
                CrawlKind::Node => CrawlOutcome::Nodes(self.nearest.closest()),
                CrawlKind::Value => CrawlOutcome::ValueNotFound,
            });
        }

        None
    }
}

/// Tracks a fan-out of `store`/`refresh` calls; succeeds when at least
/// one peer acknowledges.
#[derive(Debug)]
pub struct StoreQuery {
    inflight: HashSet<CallId>,
    acks: usize,
}

impl StoreQuery {
    pub fn new() -> Self {
        StoreQuery {
            inflight: HashSet::new(),
            acks: 0,
        }
    }

    pub fn register(&mut self, id: CallId) {
        self.inflight.insert(id);
    }

    pub fn owns_call(&self, id: &CallId) -> bool {
        self.inflight.contains(id)
    }

    pub fn on_response(&mut self, id: &CallId, acknowledged: bool) {
        if self.inflight.remove(id) && acknowledged {
            self.acks += 1;
        }
    }

    pub fn on_failure(&mut self, id: &CallId) {
        self.inflight.remove(id);
    }

    pub fn is_done(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.acks > 0
    }
}

impl Default for StoreQuery {
    fn default() -> Self {
        Self::new()
    }
}
