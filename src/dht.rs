//! Blocking client for a DHT node running on its own thread.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::info;

use crate::common::{Id, Value};
use crate::rpc::{Config, Rpc, State, StateError};

/// A handle to a DHT node.
///
/// The node itself runs on a dedicated thread; this handle is cheap to
/// clone and every method simply exchanges a message with that thread.
/// The thread exits when the last handle is dropped or [Dht::shutdown]
/// is called.
#[derive(Debug, Clone)]
pub struct Dht(Sender<ActorMessage>);

enum ActorMessage {
    Info(Sender<Info>),
    Bootstrap(Vec<SocketAddrV4>, Sender<usize>),
    Get(String, Sender<Option<Value>>),
    Set(String, Value, Sender<bool>),
    SaveState(PathBuf, Sender<Result<(), StateError>>),
    Shutdown(Sender<()>),
}

/// A snapshot of the node's identity and routing table size.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    table_size: usize,
}

impl Info {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }
}

#[derive(Debug, thiserror::Error)]
#[error("DHT node was shutdown")]
pub struct NodeShutdown;

#[derive(Debug, thiserror::Error)]
pub enum LoadStateError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed to bind restored node: {0}")]
    Bind(std::io::Error),
}

#[derive(Debug, Default, Clone)]
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set the port to listen on. Defaults to an os assigned port.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = port;
        self
    }

    pub fn interface(mut self, interface: Ipv4Addr) -> Self {
        self.0.interface = interface;
        self
    }

    /// Peers to join the network through as soon as the node starts.
    pub fn bootstrap(mut self, addresses: &[SocketAddrV4]) -> Self {
        self.0.bootstrap = addresses.to_vec();
        self
    }

    pub fn ksize(mut self, ksize: usize) -> Self {
        self.0.ksize = ksize;
        self
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.0.alpha = alpha;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.0.request_timeout = timeout;
        self
    }

    /// Periodically snapshot the routing state to this path.
    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.0.state_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Dht, std::io::Error> {
        Dht::new(self.0)
    }
}

impl Dht {
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Start a node with the given config on its own thread.
    ///
    /// Returns once the UDP socket is bound, surfacing bind errors here
    /// rather than from the background thread.
    pub fn new(config: Config) -> Result<Dht, std::io::Error> {
        let (sender, receiver) = flume::unbounded();
        let (bound_tx, bound_rx) = flume::bounded(1);

        thread::Builder::new()
            .name("hivemap".into())
            .spawn(move || run(config, receiver, bound_tx))?;

        match bound_rx.recv() {
            Ok(Ok(())) => Ok(Dht(sender)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "node thread died before binding",
            )),
        }
    }

    /// Restore a node from a state snapshot: same id, and the snapshot's
    /// neighbors as the bootstrap list, bound to `interface:port`.
    pub fn load_state(path: &Path, port: u16, interface: Ipv4Addr) -> Result<Dht, LoadStateError> {
        let state = State::read(path)?;

        let config = Config {
            id: Some(state.id()?),
            ksize: state.ksize,
            alpha: state.alpha,
            port,
            interface,
            bootstrap: state.bootstrap_addresses(),
            ..Default::default()
        };

        Dht::new(config).map_err(LoadStateError::Bind)
    }

    // === Public Methods ===

    pub fn info(&self) -> Result<Info, NodeShutdown> {
        self.call(ActorMessage::Info)
    }

    /// Join the network through the given peers; answers with the number
    /// of peers known once the join lookup settles.
    pub fn bootstrap(&self, addresses: &[SocketAddrV4]) -> Result<usize, NodeShutdown> {
        self.call(|tx| ActorMessage::Bootstrap(addresses.to_vec(), tx))
    }

    /// Look up the freshest value stored under `key`, locally or on the
    /// network.
    pub fn get(&self, key: &str) -> Result<Option<Value>, NodeShutdown> {
        self.call(|tx| ActorMessage::Get(key.to_string(), tx))
    }

    /// Store `key = value` on the peers nearest the key.
    ///
    /// `Ok(false)` means no peer acknowledged the write, including the
    /// case of a node with an empty routing table.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<bool, NodeShutdown> {
        self.call(|tx| ActorMessage::Set(key.to_string(), value.into(), tx))
    }

    /// Write a routing state snapshot to `path`.
    pub fn save_state(&self, path: &Path) -> Result<(), StateError> {
        self.call(|tx| ActorMessage::SaveState(path.to_path_buf(), tx))
            .map_err(|NodeShutdown| StateError::Shutdown)?
    }

    /// Stop the node's thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        let (tx, rx) = flume::bounded(1);
        if self.0.send(ActorMessage::Shutdown(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    // === Private Methods ===

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> ActorMessage) -> Result<T, NodeShutdown> {
        let (tx, rx) = flume::bounded(1);
        self.0.send(build(tx)).map_err(|_| NodeShutdown)?;
        rx.recv().map_err(|_| NodeShutdown)
    }
}

fn run(
    config: Config,
    receiver: Receiver<ActorMessage>,
    bound: Sender<Result<(), std::io::Error>>,
) {
    let bootstrap = config.bootstrap.clone();

    let mut rpc = match Rpc::new(config) {
        Ok(rpc) => {
            let _ = bound.send(Ok(()));
            rpc
        }
        Err(error) => {
            let _ = bound.send(Err(error));
            return;
        }
    };

    rpc.bootstrap(bootstrap, None);

    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Shutdown(sender)) => {
                info!(id = ?rpc.id(), "Node shutting down");
                let _ = sender.send(());
                break;
            }
            Ok(ActorMessage::Info(sender)) => {
                let _ = sender.send(Info {
                    id: *rpc.id(),
                    local_addr: rpc.local_addr(),
                    table_size: rpc.table_size(),
                });
            }
            Ok(ActorMessage::Bootstrap(addresses, sender)) => {
                rpc.bootstrap(addresses, Some(sender));
            }
            Ok(ActorMessage::Get(key, sender)) => rpc.get(&key, sender),
            Ok(ActorMessage::Set(key, value, sender)) => rpc.set(&key, value, sender),
            Ok(ActorMessage::SaveState(path, sender)) => {
                let _ = sender.send(rpc.save_state(&path));
            }
            Err(flume::TryRecvError::Empty) => {}
            // All handles dropped; nothing can reach this node anymore.
            Err(flume::TryRecvError::Disconnected) => break,
        }

        rpc.tick();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shutdown_stops_the_node() {
        let mut dht = Dht::builder()
            .interface(Ipv4Addr::LOCALHOST)
            .build()
            .unwrap();

        assert!(dht.info().is_ok());

        dht.shutdown();

        assert!(dht.info().is_err());
        assert!(matches!(dht.get("foo"), Err(NodeShutdown)));
    }

    #[test]
    fn handles_are_cloneable() {
        let dht = Dht::builder()
            .interface(Ipv4Addr::LOCALHOST)
            .build()
            .unwrap();

        let clone = dht.clone();
        assert_eq!(clone.info().unwrap().id(), dht.info().unwrap().id());
    }
}
