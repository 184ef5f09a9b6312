//! The DHT protocol engine.
//!
//! [Rpc] owns the socket, the routing table, and the local storage, and
//! is driven by calling [Rpc::tick] in a loop from a single thread. Each
//! tick times out stale calls, handles at most one inbound datagram,
//! advances in-flight lookups and store fan-outs, and runs the periodic
//! table-refresh and replication pass. Nothing else touches the table or
//! the storage, so no locking is needed anywhere.

pub mod config;
mod crawl;
pub mod messages;
mod socket;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use flume::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::common::{
    monotonic_now, random_in_range, AddOutcome, Id, MemoryStore, Node, RoutingTable, Value,
};

use crawl::{Crawl, CrawlKind, CrawlOutcome, StoreQuery};
use messages::{FindResult, Request, WireEntry};
use socket::{CallId, Envelope, RpcSocket};

pub use config::Config;
pub use socket::DEFAULT_REQUEST_TIMEOUT;

/// What kind of reply an outstanding call expects.
#[derive(Debug, Clone, Copy)]
enum CallKind {
    Ping,
    Find,
    Store,
}

#[derive(Debug)]
struct PendingCall {
    to: SocketAddrV4,
    /// The callee's id, when known at call time. A timeout removes this
    /// peer from the routing table.
    peer_id: Option<Id>,
    kind: CallKind,
}

/// An in-flight iterative lookup plus what to do when it finishes.
#[derive(Debug)]
struct Lookup {
    crawl: Crawl,
    action: LookupAction,
}

#[derive(Debug)]
enum LookupAction {
    /// Stale-bucket refresh; contacting peers repopulates the table as a
    /// side effect, the final set itself is discarded.
    Refresh,
    /// Lookup of our own id after seeding from bootstrap peers; answers
    /// with the resulting routing table size.
    Bootstrap { sender: Option<Sender<usize>> },
    Get {
        local: Option<(u64, Value)>,
        sender: Option<Sender<Option<Value>>>,
    },
    Set {
        timestamp: u64,
        value: Value,
        sender: Option<Sender<bool>>,
    },
    /// Periodic re-push of a stored entry to the peers nearest its key.
    Replicate { entry: WireEntry },
}

#[derive(Debug)]
struct StoreOp {
    query: StoreQuery,
    sender: Option<Sender<bool>>,
}

#[derive(Debug)]
struct BootstrapOp {
    outstanding: HashSet<CallId>,
    seeds: Vec<Node>,
    sender: Option<Sender<usize>>,
}

/// Persisted routing identity, enough to rejoin the network after a
/// restart without a fixed bootstrap list.
#[derive(Debug, Serialize, Deserialize)]
pub struct State {
    pub ksize: usize,
    pub alpha: usize,
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    /// `(ip, port)` pairs of the peers known when the snapshot was taken.
    pub neighbors: Vec<(String, u16)>,
}

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to decode state file: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Failed to encode state file: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("State file carries an invalid node id")]
    InvalidId,

    #[error("DHT node was shutdown")]
    Shutdown,
}

impl State {
    pub fn read(path: &Path) -> Result<State, StateError> {
        let bytes = std::fs::read(path)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), StateError> {
        let bytes = rmp_serde::to_vec(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn id(&self) -> Result<Id, StateError> {
        Id::from_bytes(&self.id).map_err(|_| StateError::InvalidId)
    }

    pub fn bootstrap_addresses(&self) -> Vec<SocketAddrV4> {
        self.neighbors
            .iter()
            .filter_map(|(ip, port)| Some(SocketAddrV4::new(ip.parse().ok()?, *port)))
            .collect()
    }
}

#[derive(Debug)]
pub struct Rpc {
    socket: RpcSocket,
    table: RoutingTable,
    storage: MemoryStore,

    alpha: usize,
    bucket_stale_after: Duration,
    refresh_interval: Duration,
    last_refresh: Instant,
    state_path: Option<PathBuf>,
    state_save_interval: Duration,
    last_state_save: Instant,

    /// Outstanding outbound calls awaiting a reply or a timeout.
    pending: HashMap<CallId, PendingCall>,
    lookups: Vec<Lookup>,
    store_queries: Vec<StoreOp>,
    bootstraps: Vec<BootstrapOp>,
}

impl Rpc {
    pub fn new(config: Config) -> Result<Rpc, std::io::Error> {
        let socket = RpcSocket::bind(config.interface, config.port, config.request_timeout)?;
        let id = config.id.unwrap_or_else(Id::random);

        info!(?id, address = ?socket.local_addr(), "DHT node listening");

        Ok(Rpc {
            socket,
            table: RoutingTable::new(id, config.ksize),
            storage: MemoryStore::new(config.storage_ttl),
            alpha: config.alpha,
            bucket_stale_after: config.bucket_stale_after,
            refresh_interval: config.refresh_interval,
            last_refresh: Instant::now(),
            state_path: config.state_path,
            state_save_interval: config.state_save_interval,
            last_state_save: Instant::now(),
            pending: HashMap::new(),
            lookups: Vec::new(),
            store_queries: Vec::new(),
            bootstraps: Vec::new(),
        })
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.table.id()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn ksize(&self) -> usize {
        self.table.ksize()
    }

    pub fn alpha(&self) -> usize {
        self.alpha
    }

    pub fn table_size(&self) -> usize {
        self.table.size()
    }

    /// Known peers suitable for seeding a future bootstrap.
    pub fn bootstrappable_neighbors(&self) -> Vec<Node> {
        self.table.nodes()
    }

    pub fn state(&self) -> State {
        State {
            ksize: self.table.ksize(),
            alpha: self.alpha,
            id: self.table.id().to_vec(),
            neighbors: self
                .table
                .nodes()
                .iter()
                .map(|node| (node.address.ip().to_string(), node.address.port()))
                .collect(),
        }
    }

    pub fn save_state(&self, path: &Path) -> Result<(), StateError> {
        self.state().write(path)
    }

    // === Public Methods ===

    /// Advance the node by one step.
    pub fn tick(&mut self) {
        for id in self.socket.take_expired() {
            self.handle_timeout(id);
        }

        if let Some((envelope, from)) = self.socket.recv_from() {
            match envelope {
                Envelope::Call { id, payload } => self.handle_call(id, from, payload),
                Envelope::Reply { id, payload } => self.handle_reply(id, payload),
            }
        }

        self.settle_bootstraps();
        self.advance_lookups();
        self.settle_store_queries();

        if self.last_refresh.elapsed() >= self.refresh_interval {
            self.last_refresh = Instant::now();
            self.refresh();
        }
    }

    /// Join the network through the given peers.
    ///
    /// Pings every address; responders seed a lookup of our own id, which
    /// populates the routing table around our neighborhood. The answer is
    /// the number of peers known once the lookup settles.
    pub fn bootstrap(&mut self, addresses: Vec<SocketAddrV4>, sender: Option<Sender<usize>>) {
        if addresses.is_empty() {
            if let Some(sender) = sender {
                let _ = sender.send(self.table.size());
            }
            return;
        }

        let ping = Request::Ping {
            sender_id: *self.table.id(),
        };

        let mut op = BootstrapOp {
            outstanding: HashSet::new(),
            seeds: Vec::new(),
            sender,
        };

        for address in addresses {
            if let Some(call_id) = self.send_call(address, None, CallKind::Ping, &ping) {
                op.outstanding.insert(call_id);
            }
        }

        if op.outstanding.is_empty() {
            if let Some(sender) = op.sender {
                let _ = sender.send(self.table.size());
            }
        } else {
            self.bootstraps.push(op);
        }
    }

    /// Look up the freshest value for `key`, local or networked.
    pub fn get(&mut self, key: &str, sender: Sender<Option<Value>>) {
        let target = Id::for_key(key);

        let local = self
            .storage
            .get(&target)
            .map(|entry| (entry.timestamp, entry.value.clone()));

        let k = self.table.ksize();
        let seeds = self.table.find_neighbors(&target, k, None);

        if seeds.is_empty() {
            warn!(key, "There are no known neighbors to get key");
            let _ = sender.send(local.map(|(_, value)| value));
            return;
        }

        self.lookups.push(Lookup {
            crawl: Crawl::new(target, CrawlKind::Value, seeds, k, self.alpha),
            action: LookupAction::Get {
                local,
                sender: Some(sender),
            },
        });
    }

    /// Store `key = value` on the peers nearest the key's digest.
    ///
    /// Answers `false` when no neighbors are known or no peer
    /// acknowledges the write.
    pub fn set(&mut self, key: &str, value: Value, sender: Sender<bool>) {
        let target = Id::for_key(key);
        debug!(key, ?target, "Setting key on the network");

        let k = self.table.ksize();
        let seeds = self.table.find_neighbors(&target, k, None);

        if seeds.is_empty() {
            warn!(key, "There are no known neighbors to set key");
            let _ = sender.send(false);
            return;
        }

        self.lookups.push(Lookup {
            crawl: Crawl::new(target, CrawlKind::Node, seeds, k, self.alpha),
            action: LookupAction::Set {
                timestamp: monotonic_now(),
                value,
                sender: Some(sender),
            },
        });
    }

    // === Private Methods ===

    /// Frame and send a call, remembering what its reply should look like.
    fn send_call(
        &mut self,
        to: SocketAddrV4,
        peer_id: Option<Id>,
        kind: CallKind,
        request: &Request,
    ) -> Option<CallId> {
        let payload = match request.to_wire() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(?error, method = request.method(), "Could not encode call");
                return None;
            }
        };

        match self.socket.call(to, &payload) {
            Ok(call_id) => {
                self.pending
                    .insert(call_id, PendingCall { to, peer_id, kind });
                Some(call_id)
            }
            Err(error) => {
                debug!(?error, ?to, method = request.method(), "Could not send call");
                None
            }
        }
    }

    fn handle_call(&mut self, id: CallId, from: SocketAddrV4, payload: rmpv::Value) {
        let request = match Request::from_wire(payload) {
            Ok(request) => request,
            Err(error) => {
                warn!(?error, ?from, "Dropped malformed call");
                return;
            }
        };

        let sender = Node::new(*request.sender_id(), from);
        trace!(method = request.method(), ?from, "Handling call");

        let k = self.table.ksize();

        let response = match request {
            Request::Ping { .. } => {
                self.welcome_if_new(&sender);
                messages::pong_to_wire(self.table.id())
            }
            Request::Store { key, entry, .. } => {
                self.welcome_if_new(&sender);
                self.storage.set(key, entry.timestamp, entry.value);
                messages::stored_to_wire(true)
            }
            Request::Refresh { key, entry, .. } => {
                // A replication re-push; the first-contact replication
                // scan already ran when this peer was welcomed.
                self.add_contact(sender.clone());
                self.storage.set(key, entry.timestamp, entry.value);
                messages::stored_to_wire(true)
            }
            Request::FindNode { target, .. } => {
                self.welcome_if_new(&sender);
                let neighbors = self.table.find_neighbors(&target, k, Some(&sender));

                match FindResult::Nodes(neighbors).to_wire() {
                    Ok(response) => response,
                    Err(error) => {
                        warn!(?error, "Could not encode find_node result");
                        return;
                    }
                }
            }
            Request::FindValue { key, .. } => {
                self.welcome_if_new(&sender);

                let result = match self.storage.get(&key) {
                    Some(entry) => FindResult::Value(WireEntry {
                        timestamp: entry.timestamp,
                        value: entry.value.clone(),
                    }),
                    None => FindResult::Nodes(self.table.find_neighbors(&key, k, Some(&sender))),
                };

                match result.to_wire() {
                    Ok(response) => response,
                    Err(error) => {
                        warn!(?error, "Could not encode find_value result");
                        return;
                    }
                }
            }
        };

        self.socket.reply(from, &id, &response);
    }

    fn handle_reply(&mut self, id: CallId, payload: rmpv::Value) {
        let call = match self.pending.remove(&id) {
            Some(call) => call,
            None => return,
        };

        match call.kind {
            CallKind::Ping => match messages::pong_from_wire(payload) {
                Ok(responder_id) => {
                    let responder = Node::new(responder_id, call.to);
                    self.welcome_if_new(&responder);

                    if let Some(position) = self
                        .bootstraps
                        .iter()
                        .position(|op| op.outstanding.contains(&id))
                    {
                        self.bootstraps[position].outstanding.remove(&id);
                        self.bootstraps[position].seeds.push(responder);
                    }
                }
                Err(error) => {
                    debug!(?error, from = ?call.to, "Dropped malformed pong");
                    self.notify_failure(&id);
                }
            },
            CallKind::Find => {
                if let Some(peer_id) = call.peer_id {
                    self.welcome_if_new(&Node::new(peer_id, call.to));
                }

                match FindResult::from_wire(payload) {
                    Ok(result) => {
                        if let Some(lookup) =
                            self.lookups.iter_mut().find(|l| l.crawl.owns_call(&id))
                        {
                            lookup.crawl.on_response(&id, result);
                        }
                    }
                    Err(error) => {
                        debug!(?error, from = ?call.to, "Dropped malformed find result");
                        self.notify_failure(&id);
                    }
                }
            }
            CallKind::Store => {
                if let Some(peer_id) = call.peer_id {
                    self.welcome_if_new(&Node::new(peer_id, call.to));
                }

                match messages::stored_from_wire(payload) {
                    Ok(acknowledged) => {
                        if let Some(op) = self
                            .store_queries
                            .iter_mut()
                            .find(|op| op.query.owns_call(&id))
                        {
                            op.query.on_response(&id, acknowledged);
                        }
                    }
                    Err(error) => {
                        debug!(?error, from = ?call.to, "Dropped malformed store ack");
                        self.notify_failure(&id);
                    }
                }
            }
        }
    }

    /// A call timed out. This is the only place where transport failure
    /// turns into routing table mutation.
    fn handle_timeout(&mut self, id: CallId) {
        if let Some(call) = self.pending.remove(&id) {
            if let Some(peer_id) = call.peer_id {
                debug!(peer = ?peer_id, address = ?call.to, "Peer did not respond in time, dropping from table");
                self.table.remove_contact(&peer_id);
            }
            self.notify_failure(&id);
        }
    }

    fn notify_failure(&mut self, id: &CallId) {
        if let Some(lookup) = self.lookups.iter_mut().find(|l| l.crawl.owns_call(id)) {
            lookup.crawl.on_failure(id);
            return;
        }

        if let Some(op) = self
            .store_queries
            .iter_mut()
            .find(|op| op.query.owns_call(id))
        {
            op.query.on_failure(id);
            return;
        }

        if let Some(position) = self
            .bootstraps
            .iter()
            .position(|op| op.outstanding.contains(id))
        {
            self.bootstraps[position].outstanding.remove(id);
        }
    }

    /// First sight of a peer: before adding it to the routing table, push
    /// it every stored key whose ideal replica set would newly include it.
    fn welcome_if_new(&mut self, node: &Node) {
        if !self.table.is_new_node(node) {
            return;
        }

        debug!(?node, "Never seen this peer before, welcoming");

        let k = self.table.ksize();
        let self_id = *self.table.id();

        let mut pushes: Vec<(Id, WireEntry)> = Vec::new();

        for (key, entry) in self.storage.iter() {
            let neighbors = self.table.find_neighbors(key, k, None);

            let replicate = if neighbors.is_empty() {
                true
            } else {
                // The newcomer belongs in the key's replica set only if it
                // is closer than the current farthest-of-k and we are
                // ourselves the closest known holder.
                let farthest = neighbors[neighbors.len() - 1].id.xor(key);
                let nearest = neighbors[0].id.xor(key);

                node.id.xor(key) < farthest && self_id.xor(key) < nearest
            };

            if replicate {
                pushes.push((
                    *key,
                    WireEntry {
                        timestamp: entry.timestamp,
                        value: entry.value.clone(),
                    },
                ));
            }
        }

        for (key, entry) in pushes {
            let request = Request::Store {
                sender_id: self_id,
                key,
                entry,
            };
            self.send_call(node.address, Some(node.id), CallKind::Store, &request);
        }

        self.add_contact(node.clone());
    }

    fn add_contact(&mut self, node: Node) {
        if let AddOutcome::PingHead(head) = self.table.add_contact(node) {
            // Probe the least recently seen peer of the full bucket; its
            // timeout (not this call) decides the eviction.
            let ping = Request::Ping {
                sender_id: *self.table.id(),
            };
            self.send_call(head.address, Some(head.id), CallKind::Ping, &ping);
        }
    }

    /// Promote bootstrap operations whose pings have all settled into a
    /// lookup of our own id.
    fn settle_bootstraps(&mut self) {
        let mut index = 0;
        while index < self.bootstraps.len() {
            if !self.bootstraps[index].outstanding.is_empty() {
                index += 1;
                continue;
            }

            let op = self.bootstraps.swap_remove(index);

            if op.seeds.is_empty() {
                warn!("No bootstrap peer responded");
                if let Some(sender) = op.sender {
                    let _ = sender.send(self.table.size());
                }
                continue;
            }

            let k = self.table.ksize();
            let target = *self.table.id();

            self.lookups.push(Lookup {
                crawl: Crawl::new(target, CrawlKind::Node, op.seeds, k, self.alpha),
                action: LookupAction::Bootstrap { sender: op.sender },
            });
        }
    }

    fn advance_lookups(&mut self) {
        let mut index = 0;
        while index < self.lookups.len() {
            if !self.lookups[index].crawl.round_complete() {
                index += 1;
                continue;
            }

            if let Some(outcome) = self.lookups[index].crawl.evaluate() {
                let lookup = self.lookups.swap_remove(index);
                self.finish_lookup(lookup, outcome);
                continue;
            }

            let kind = self.lookups[index].crawl.kind();
            let target = *self.lookups[index].crawl.target();
            let self_id = *self.table.id();

            for node in self.lookups[index].crawl.next_round() {
                let request = match kind {
                    CrawlKind::Node => Request::FindNode {
                        sender_id: self_id,
                        target,
                    },
                    CrawlKind::Value => Request::FindValue {
                        sender_id: self_id,
                        key: target,
                    },
                };

                if let Some(call_id) =
                    self.send_call(node.address, Some(node.id), CallKind::Find, &request)
                {
                    self.lookups[index].crawl.register(call_id, node);
                }
            }

            index += 1;
        }
    }

    fn finish_lookup(&mut self, lookup: Lookup, outcome: CrawlOutcome) {
        let target = *lookup.crawl.target();

        match lookup.action {
            LookupAction::Refresh => {}
            LookupAction::Bootstrap { sender } => {
                let size = self.table.size();
                info!(neighbors = size, "Bootstrap finished");
                if let Some(sender) = sender {
                    let _ = sender.send(size);
                }
            }
            LookupAction::Get { local, sender } => match outcome {
                CrawlOutcome::Value { entry, cache_to } => {
                    let local_is_fresher = local
                        .as_ref()
                        .map_or(false, |(timestamp, _)| *timestamp >= entry.timestamp);

                    let returned = if local_is_fresher {
                        local.map(|(_, value)| value)
                    } else {
                        self.storage.set(target, entry.timestamp, entry.value.clone());
                        Some(entry.value.clone())
                    };

                    // Self-healing replication: hand the value to the
                    // nearest peer observed without it.
                    if let Some(peer) = cache_to {
                        let request = Request::Store {
                            sender_id: *self.table.id(),
                            key: target,
                            entry,
                        };
                        self.send_call(peer.address, Some(peer.id), CallKind::Store, &request);
                    }

                    if let Some(sender) = sender {
                        let _ = sender.send(returned);
                    }
                }
                _ => {
                    if let Some(sender) = sender {
                        let _ = sender.send(local.map(|(_, value)| value));
                    }
                }
            },
            LookupAction::Set {
                timestamp,
                value,
                sender,
            } => match outcome {
                CrawlOutcome::Nodes(nodes) => {
                    if nodes.is_empty() {
                        warn!(?target, "Found no peers to store key on");
                        if let Some(sender) = sender {
                            let _ = sender.send(false);
                        }
                        return;
                    }

                    let self_id = *self.table.id();

                    // Keep a local replica too when we are closer to the
                    // key than the farthest chosen peer.
                    let farthest = nodes.iter().map(|node| node.id.xor(&target)).max();
                    if farthest.map_or(false, |farthest| self_id.xor(&target) < farthest) {
                        self.storage.set(target, timestamp, value.clone());
                    }

                    let entry = WireEntry { timestamp, value };
                    let mut query = StoreQuery::new();

                    for node in nodes {
                        let request = Request::Store {
                            sender_id: self_id,
                            key: target,
                            entry: entry.clone(),
                        };
                        if let Some(call_id) =
                            self.send_call(node.address, Some(node.id), CallKind::Store, &request)
                        {
                            query.register(call_id);
                        }
                    }

                    if query.is_done() {
                        if let Some(sender) = sender {
                            let _ = sender.send(false);
                        }
                    } else {
                        self.store_queries.push(StoreOp { query, sender });
                    }
                }
                _ => {
                    if let Some(sender) = sender {
                        let _ = sender.send(false);
                    }
                }
            },
            LookupAction::Replicate { entry } => {
                if let CrawlOutcome::Nodes(nodes) = outcome {
                    let self_id = *self.table.id();
                    for node in nodes {
                        let request = Request::Refresh {
                            sender_id: self_id,
                            key: target,
                            entry: entry.clone(),
                        };
                        self.send_call(node.address, Some(node.id), CallKind::Store, &request);
                    }
                }
            }
        }
    }

    fn settle_store_queries(&mut self) {
        let mut index = 0;
        while index < self.store_queries.len() {
            if self.store_queries[index].query.is_done() {
                let op = self.store_queries.swap_remove(index);
                if let Some(sender) = op.sender {
                    let _ = sender.send(op.query.succeeded());
                }
            } else {
                index += 1;
            }
        }
    }

    /// Periodic maintenance: cull expired entries, crawl a random id in
    /// every stale bucket, re-push stored keys to their nearest peers, and
    /// snapshot the routing state when configured to.
    fn refresh(&mut self) {
        self.storage.cull();

        let k = self.table.ksize();

        for (lo, hi) in self.table.stale_buckets(self.bucket_stale_after) {
            let target = random_in_range(&lo, &hi);
            let seeds = self.table.find_neighbors(&target, k, None);
            if seeds.is_empty() {
                continue;
            }

            debug!(?target, "Refreshing stale bucket");

            self.lookups.push(Lookup {
                crawl: Crawl::new(target, CrawlKind::Node, seeds, k, self.alpha),
                action: LookupAction::Refresh,
            });
        }

        let entries: Vec<(Id, WireEntry)> = self
            .storage
            .iter()
            .map(|(key, entry)| {
                (
                    *key,
                    WireEntry {
                        timestamp: entry.timestamp,
                        value: entry.value.clone(),
                    },
                )
            })
            .collect();

        for (key, entry) in entries {
            let seeds = self.table.find_neighbors(&key, k, None);
            if seeds.is_empty() {
                continue;
            }

            self.lookups.push(Lookup {
                crawl: Crawl::new(key, CrawlKind::Node, seeds, k, self.alpha),
                action: LookupAction::Replicate { entry },
            });
        }

        if let Some(path) = self.state_path.clone() {
            if self.last_state_save.elapsed() >= self.state_save_interval {
                self.last_state_save = Instant::now();
                if let Err(error) = self.save_state(&path) {
                    warn!(?error, ?path, "Failed to snapshot routing state");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::socket::DEFAULT_REQUEST_TIMEOUT;
    use super::*;

    fn test_config() -> Config {
        Config {
            interface: Ipv4Addr::LOCALHOST,
            ..Default::default()
        }
    }

    fn client_socket() -> RpcSocket {
        RpcSocket::bind(Ipv4Addr::LOCALHOST, 0, DEFAULT_REQUEST_TIMEOUT).unwrap()
    }

    /// Tick the node until the client receives a reply to its call.
    fn tick_until_reply(rpc: &mut Rpc, client: &mut RpcSocket) -> rmpv::Value {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            rpc.tick();
            if let Some((Envelope::Reply { payload, .. }, _)) = client.recv_from() {
                return payload;
            }
        }
        panic!("no reply before the deadline");
    }

    fn call(client: &mut RpcSocket, to: SocketAddrV4, request: &Request) {
        client.call(to, &request.to_wire().unwrap()).unwrap();
    }

    #[test]
    fn ping_pongs_and_welcomes_the_sender() {
        let mut rpc = Rpc::new(test_config()).unwrap();
        let mut client = client_socket();

        call(
            &mut client,
            rpc.local_addr(),
            &Request::Ping {
                sender_id: Id::random(),
            },
        );

        let pong = tick_until_reply(&mut rpc, &mut client);
        assert_eq!(
            messages::pong_from_wire(pong).unwrap(),
            *rpc.id(),
            "pong carries the responder's id"
        );
        assert_eq!(rpc.table_size(), 1, "the caller was added to the table");
    }

    #[test]
    fn store_then_find_value() {
        let mut rpc = Rpc::new(test_config()).unwrap();
        let mut client = client_socket();
        let sender_id = Id::random();
        let key = Id::for_key("foo");

        call(
            &mut client,
            rpc.local_addr(),
            &Request::Store {
                sender_id,
                key,
                entry: WireEntry {
                    timestamp: 7,
                    value: Value::from("bar"),
                },
            },
        );

        let ack = tick_until_reply(&mut rpc, &mut client);
        assert!(messages::stored_from_wire(ack).unwrap());

        call(
            &mut client,
            rpc.local_addr(),
            &Request::FindValue { sender_id, key },
        );

        let found = tick_until_reply(&mut rpc, &mut client);
        match FindResult::from_wire(found).unwrap() {
            FindResult::Value(entry) => {
                assert_eq!(entry.timestamp, 7);
                assert_eq!(entry.value, Value::from("bar"));
            }
            other => panic!("expected the stored value, got {:?}", other),
        }
    }

    #[test]
    fn find_node_returns_other_known_peers() {
        let mut rpc = Rpc::new(test_config()).unwrap();

        let mut peer = client_socket();
        let peer_id = Id::random();
        call(&mut peer, rpc.local_addr(), &Request::Ping { sender_id: peer_id });
        tick_until_reply(&mut rpc, &mut peer);

        let mut client = client_socket();
        call(
            &mut client,
            rpc.local_addr(),
            &Request::FindNode {
                sender_id: Id::random(),
                target: Id::random(),
            },
        );

        let found = tick_until_reply(&mut rpc, &mut client);
        match FindResult::from_wire(found).unwrap() {
            FindResult::Nodes(nodes) => {
                assert!(nodes.iter().any(|node| node.id == peer_id));
            }
            other => panic!("expected peers, got {:?}", other),
        }
    }

    fn flip_bit(id: &Id, bit: usize) -> Id {
        let mut bytes = *id.as_bytes();
        bytes[bit / 8] ^= 0x80 >> (bit % 8);
        Id(bytes)
    }

    #[test]
    fn welcome_pushes_stored_keys_to_closer_newcomer() {
        let key = Id::for_key("foo");

        // This node is the closest holder of the key; the peer that
        // stored it is far away, the newcomer in between.
        let mut rpc = Rpc::new(Config {
            id: Some(flip_bit(&key, 159)),
            ..test_config()
        })
        .unwrap();

        let mut far = client_socket();
        call(
            &mut far,
            rpc.local_addr(),
            &Request::Store {
                sender_id: flip_bit(&key, 0),
                key,
                entry: WireEntry {
                    timestamp: 7,
                    value: Value::from("bar"),
                },
            },
        );
        let ack = tick_until_reply(&mut rpc, &mut far);
        assert!(messages::stored_from_wire(ack).unwrap());

        // First contact with a peer that now belongs in the key's
        // replica set: the stored entry must be pushed to it.
        let mut newcomer = client_socket();
        call(
            &mut newcomer,
            rpc.local_addr(),
            &Request::Ping {
                sender_id: flip_bit(&key, 1),
            },
        );

        let mut pushed = None;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && pushed.is_none() {
            rpc.tick();
            if let Some((Envelope::Call { payload, .. }, _)) = newcomer.recv_from() {
                pushed = Some(Request::from_wire(payload).unwrap());
            }
        }

        match pushed {
            Some(Request::Store {
                key: pushed_key,
                entry,
                ..
            }) => {
                assert_eq!(pushed_key, key);
                assert_eq!(entry.timestamp, 7);
                assert_eq!(entry.value, Value::from("bar"));
            }
            other => panic!("expected a replication push, got {:?}", other),
        }

        assert_eq!(
            rpc.table_size(),
            2,
            "the newcomer joins the table after the push"
        );
    }

    #[test]
    fn set_and_get_without_neighbors() {
        let mut rpc = Rpc::new(test_config()).unwrap();

        let (tx, rx) = flume::unbounded();
        rpc.set("k", Value::from("v"), tx);
        assert!(!rx.recv().unwrap(), "set on an isolated node fails");

        let (tx, rx) = flume::unbounded();
        rpc.get("k", tx);
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn bootstrap_against_dead_address_settles_empty() {
        let mut rpc = Rpc::new(Config {
            request_timeout: Duration::from_millis(100),
            ..test_config()
        })
        .unwrap();

        let (tx, rx) = flume::unbounded();
        rpc.bootstrap(vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)], Some(tx));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            rpc.tick();
            if let Ok(size) = rx.try_recv() {
                assert_eq!(size, 0);
                assert_eq!(rpc.table_size(), 0);
                break;
            }
            assert!(Instant::now() < deadline, "bootstrap never settled");
        }
    }

    #[test]
    fn two_nodes_set_and_get() {
        let mut a = Rpc::new(test_config()).unwrap();
        let mut b = Rpc::new(test_config()).unwrap();

        fn drive<T>(a: &mut Rpc, b: &mut Rpc, rx: &flume::Receiver<T>) -> T {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                a.tick();
                b.tick();
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
            }
            panic!("operation did not finish in time");
        }

        let (tx, rx) = flume::unbounded();
        b.bootstrap(vec![a.local_addr()], Some(tx));
        assert!(drive(&mut a, &mut b, &rx) >= 1);

        let (tx, rx) = flume::unbounded();
        b.set("foo", Value::from("bar"), tx);
        assert!(drive(&mut a, &mut b, &rx), "one peer should acknowledge");

        let (tx, rx) = flume::unbounded();
        a.get("foo", tx);
        assert_eq!(drive(&mut a, &mut b, &rx), Some(Value::from("bar")));
    }

    #[test]
    fn state_round_trips_through_a_file() {
        let mut rpc = Rpc::new(test_config()).unwrap();

        // Known peer recorded in the snapshot.
        let peer = Node::new(Id::random(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4242));
        rpc.add_contact(peer);

        let dir = std::env::temp_dir().join(format!("hivemap-state-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.state");

        rpc.save_state(&path).unwrap();
        let state = State::read(&path).unwrap();

        assert_eq!(state.id().unwrap(), *rpc.id());
        assert_eq!(state.ksize, rpc.ksize());
        assert_eq!(state.alpha, rpc.alpha());
        assert_eq!(
            state.bootstrap_addresses(),
            vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4242)]
        );

        std::fs::remove_file(&path).unwrap();
    }
}
