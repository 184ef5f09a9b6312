//! Payloads exchanged between peers.
//!
//! A request payload is the MessagePack array `[methodName, argsList]`;
//! a response payload is the called method's raw result value. Everything
//! goes through [rmpv::Value] so dispatch can read the method name before
//! committing to an argument shape.

use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::common::{Id, Node, Value};

/// Maximum encoded payload, excluding the 21-byte envelope header.
pub const MAX_PAYLOAD_SIZE: usize = 8192;

/// A remote call, one variant per method a peer may invoke on us.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping {
        sender_id: Id,
    },
    Store {
        sender_id: Id,
        key: Id,
        entry: WireEntry,
    },
    /// Same write as [Request::Store], used by the periodic replication
    /// push so the receiving side can skip first-contact side effects.
    Refresh {
        sender_id: Id,
        key: Id,
        entry: WireEntry,
    },
    FindNode {
        sender_id: Id,
        target: Id,
    },
    FindValue {
        sender_id: Id,
        key: Id,
    },
}

/// A stored value with the writer's timestamp, as shipped on the wire:
/// the two-element array `[timestamp, value]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEntry {
    pub timestamp: u64,
    pub value: Value,
}

/// Result of a `find_node`/`find_value` call: either closer peers, or the
/// map `{"value": [timestamp, value]}` when the responder holds the key.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    Nodes(Vec<Node>),
    Value(WireEntry),
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Failed to parse MessagePack payload: {0}")]
    MsgPack(#[from] rmpv::decode::Error),

    #[error("Malformed payload: expected {0}")]
    Malformed(&'static str),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::Store { .. } => "store",
            Request::Refresh { .. } => "refresh",
            Request::FindNode { .. } => "find_node",
            Request::FindValue { .. } => "find_value",
        }
    }

    pub fn sender_id(&self) -> &Id {
        match self {
            Request::Ping { sender_id }
            | Request::Store { sender_id, .. }
            | Request::Refresh { sender_id, .. }
            | Request::FindNode { sender_id, .. }
            | Request::FindValue { sender_id, .. } => sender_id,
        }
    }

    pub fn to_wire(&self) -> Result<rmpv::Value, rmpv::ext::Error> {
        let args = match self {
            Request::Ping { sender_id } => vec![id_to_wire(sender_id)],
            Request::Store {
                sender_id,
                key,
                entry,
            }
            | Request::Refresh {
                sender_id,
                key,
                entry,
            } => vec![id_to_wire(sender_id), id_to_wire(key), entry.to_wire()?],
            Request::FindNode { sender_id, target } => {
                vec![id_to_wire(sender_id), id_to_wire(target)]
            }
            Request::FindValue { sender_id, key } => {
                vec![id_to_wire(sender_id), id_to_wire(key)]
            }
        };

        Ok(rmpv::Value::Array(vec![
            rmpv::Value::from(self.method()),
            rmpv::Value::Array(args),
        ]))
    }

    pub fn from_wire(payload: rmpv::Value) -> Result<Request, DecodeError> {
        let mut parts = match payload {
            rmpv::Value::Array(parts) if parts.len() == 2 => parts,
            _ => return Err(DecodeError::Malformed("[method, args] pair")),
        };

        let args = match parts.pop() {
            Some(rmpv::Value::Array(args)) => args,
            _ => return Err(DecodeError::Malformed("argument list")),
        };
        let method = match parts.pop() {
            Some(rmpv::Value::String(method)) => method.into_str().unwrap_or_default(),
            _ => return Err(DecodeError::Malformed("method name string")),
        };

        let mut args = args.into_iter();

        match method.as_str() {
            "ping" => Ok(Request::Ping {
                sender_id: id_from_wire(args.next(), "sender id")?,
            }),
            "store" | "refresh" => {
                let sender_id = id_from_wire(args.next(), "sender id")?;
                let key = id_from_wire(args.next(), "key digest")?;
                let entry = WireEntry::from_wire(
                    args.next().ok_or(DecodeError::Malformed("stored entry"))?,
                )?;

                if method == "store" {
                    Ok(Request::Store {
                        sender_id,
                        key,
                        entry,
                    })
                } else {
                    Ok(Request::Refresh {
                        sender_id,
                        key,
                        entry,
                    })
                }
            }
            "find_node" => Ok(Request::FindNode {
                sender_id: id_from_wire(args.next(), "sender id")?,
                target: id_from_wire(args.next(), "target id")?,
            }),
            "find_value" => Ok(Request::FindValue {
                sender_id: id_from_wire(args.next(), "sender id")?,
                key: id_from_wire(args.next(), "key digest")?,
            }),
            _ => Err(DecodeError::UnknownMethod(method)),
        }
    }
}

impl WireEntry {
    pub fn to_wire(&self) -> Result<rmpv::Value, rmpv::ext::Error> {
        Ok(rmpv::Value::Array(vec![
            rmpv::Value::from(self.timestamp),
            rmpv::ext::to_value(&self.value)?,
        ]))
    }

    pub fn from_wire(value: rmpv::Value) -> Result<WireEntry, DecodeError> {
        let mut parts = match value {
            rmpv::Value::Array(parts) if parts.len() == 2 => parts,
            _ => return Err(DecodeError::Malformed("[timestamp, value] pair")),
        };

        let value = rmpv::ext::from_value(
            parts.pop().ok_or(DecodeError::Malformed("stored value"))?,
        )
        .map_err(|_| DecodeError::Malformed("storable value"))?;

        let timestamp = match parts.pop() {
            Some(rmpv::Value::Integer(timestamp)) => timestamp
                .as_u64()
                .ok_or(DecodeError::Malformed("unsigned timestamp"))?,
            _ => return Err(DecodeError::Malformed("integer timestamp")),
        };

        Ok(WireEntry { timestamp, value })
    }
}

impl FindResult {
    pub fn to_wire(&self) -> Result<rmpv::Value, rmpv::ext::Error> {
        match self {
            FindResult::Nodes(nodes) => Ok(rmpv::Value::Array(
                nodes.iter().map(node_to_wire).collect(),
            )),
            FindResult::Value(entry) => Ok(rmpv::Value::Map(vec![(
                rmpv::Value::from("value"),
                entry.to_wire()?,
            )])),
        }
    }

    pub fn from_wire(value: rmpv::Value) -> Result<FindResult, DecodeError> {
        match value {
            rmpv::Value::Array(entries) => {
                let nodes = entries
                    .into_iter()
                    .map(node_from_wire)
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(FindResult::Nodes(nodes))
            }
            rmpv::Value::Map(mut pairs) => {
                let entry = pairs
                    .iter()
                    .position(|(key, _)| key.as_str() == Some("value"))
                    .map(|index| pairs.swap_remove(index).1)
                    .ok_or(DecodeError::Malformed("\"value\" entry"))?;

                Ok(FindResult::Value(WireEntry::from_wire(entry)?))
            }
            _ => Err(DecodeError::Malformed("node list or value map")),
        }
    }
}

/// `ping` result: the responder's id bytes.
pub fn pong_to_wire(id: &Id) -> rmpv::Value {
    id_to_wire(id)
}

pub fn pong_from_wire(value: rmpv::Value) -> Result<Id, DecodeError> {
    id_from_wire(Some(value), "responder id")
}

/// `store`/`refresh` result: an acknowledgment flag.
pub fn stored_to_wire(ok: bool) -> rmpv::Value {
    rmpv::Value::Boolean(ok)
}

pub fn stored_from_wire(value: rmpv::Value) -> Result<bool, DecodeError> {
    match value {
        rmpv::Value::Boolean(ok) => Ok(ok),
        _ => Err(DecodeError::Malformed("acknowledgment flag")),
    }
}

// === Wire helpers ===

fn id_to_wire(id: &Id) -> rmpv::Value {
    rmpv::Value::Binary(id.to_vec())
}

fn id_from_wire(value: Option<rmpv::Value>, what: &'static str) -> Result<Id, DecodeError> {
    match value {
        Some(rmpv::Value::Binary(bytes)) => {
            Id::from_bytes(bytes).map_err(|_| DecodeError::Malformed(what))
        }
        _ => Err(DecodeError::Malformed(what)),
    }
}

/// A peer on the wire is the triple `[id bytes, ip string, port]`.
fn node_to_wire(node: &Node) -> rmpv::Value {
    rmpv::Value::Array(vec![
        rmpv::Value::Binary(node.id.to_vec()),
        rmpv::Value::from(node.address.ip().to_string()),
        rmpv::Value::from(node.address.port()),
    ])
}

fn node_from_wire(value: rmpv::Value) -> Result<Node, DecodeError> {
    let mut parts = match value {
        rmpv::Value::Array(parts) if parts.len() == 3 => parts.into_iter(),
        _ => return Err(DecodeError::Malformed("[id, ip, port] triple")),
    };

    let id = id_from_wire(parts.next(), "peer id")?;

    let ip: Ipv4Addr = match parts.next() {
        Some(rmpv::Value::String(ip)) => ip
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or(DecodeError::Malformed("IPv4 address"))?,
        _ => return Err(DecodeError::Malformed("IPv4 address")),
    };

    let port = match parts.next() {
        Some(rmpv::Value::Integer(port)) => port
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or(DecodeError::Malformed("port number"))?,
        _ => return Err(DecodeError::Malformed("port number")),
    };

    Ok(Node::new(id, SocketAddrV4::new(ip, port)))
}
