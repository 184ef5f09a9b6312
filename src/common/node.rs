//! Struct and implementation of the Node entry in the Kademlia routing table
use std::net::SocketAddrV4;

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Node entry in the Kademlia routing table
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Two nodes are at the same home if both ip and port match,
    /// regardless of their ids.
    pub fn same_home_as(&self, other: &Node) -> bool {
        self.address == other.address
    }

    #[cfg(test)]
    pub fn random() -> Node {
        Node {
            id: Id::random(),
            address: SocketAddrV4::new([127, 0, 0, 1].into(), rand::random()),
        }
    }
}
