#![doc = include_str!("../README.md")]

mod common;
mod dht;
pub mod rpc;

pub use crate::common::{Id, Node, Value};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, Info};

mod errors {
    pub use super::common::{InvalidIdHex, InvalidIdSize};
    pub use super::dht::{LoadStateError, NodeShutdown};
    pub use super::rpc::StateError;
}

pub use errors::*;
