//! UDP socket layer managing outgoing calls and incoming datagrams.
//!
//! Wire format: one type byte (`0x00` call, `0x01` reply), a 20-byte
//! random correlation id, then the MessagePack payload.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use super::messages::MAX_PAYLOAD_SIZE;

/// Default timeout before abandoning a call to a non-responding peer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Type byte plus correlation id.
pub const HEADER_SIZE: usize = 21;
/// Datagrams shorter than this are dropped unconditionally.
pub const MIN_DATAGRAM_SIZE: usize = 22;

const MTU: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// The maximum duration to back off checking the socket buffer after it
/// is empty. Lower values increase CPU usage but drain the buffer faster.
const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

const TYPE_CALL: u8 = 0x00;
const TYPE_REPLY: u8 = 0x01;

/// Random correlation id matching a reply to its outstanding call.
pub type CallId = [u8; 20];

/// A parsed inbound datagram.
#[derive(Debug)]
pub enum Envelope {
    Call {
        id: CallId,
        payload: rmpv::Value,
    },
    /// A reply already validated against the inflight call table.
    Reply {
        id: CallId,
        payload: rmpv::Value,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("Encoded payload is {0} bytes, limit is {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A UdpSocket wrapper that frames and correlates calls and replies.
#[derive(Debug)]
pub struct RpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    request_timeout: Duration,
    inflight: HashMap<CallId, InflightCall>,
}

#[derive(Debug, Clone)]
struct InflightCall {
    to: SocketAddrV4,
    sent_at: Instant,
}

impl RpcSocket {
    /// Bind to `interface:port` (`port` 0 picks an ephemeral port).
    pub fn bind(interface: Ipv4Addr, port: u16, request_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(interface, port))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("RpcSocket does not support Ipv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(RpcSocket {
            socket,
            local_addr,
            request_timeout,
            inflight: HashMap::new(),
        })
    }

    // === Getters ===

    /// Returns the address this socket is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Returns true if this call id is still awaiting a reply.
    pub fn is_inflight(&self, id: &CallId) -> bool {
        self.inflight.contains_key(id)
    }

    // === Public Methods ===

    /// Send a call to the given address and register it as inflight.
    ///
    /// Send errors are logged, not returned: the timeout path treats the
    /// peer as dead either way. Only an oversized payload fails eagerly.
    pub fn call(
        &mut self,
        address: SocketAddrV4,
        payload: &rmpv::Value,
    ) -> Result<CallId, SendError> {
        let id: CallId = rand::thread_rng().gen();

        let datagram = frame(TYPE_CALL, &id, payload)?;

        self.inflight.insert(
            id,
            InflightCall {
                to: address,
                sent_at: Instant::now(),
            },
        );

        if let Err(e) = self.socket.send_to(&datagram, address) {
            debug!(?e, ?address, "Error sending call");
        }
        trace!(?address, len = datagram.len(), "Sent call");

        Ok(id)
    }

    /// Send a reply tagged with the originating call id.
    pub fn reply(&mut self, address: SocketAddrV4, id: &CallId, payload: &rmpv::Value) {
        match frame(TYPE_REPLY, id, payload) {
            Ok(datagram) => {
                if let Err(e) = self.socket.send_to(&datagram, address) {
                    debug!(?e, ?address, "Error sending reply");
                }
            }
            Err(e) => {
                debug!(?e, ?address, "Could not frame reply");
            }
        }
    }

    /// Receive a single datagram, if any is waiting.
    ///
    /// Malformed datagrams, replies to unknown or timed-out calls, and
    /// replies from the wrong address are dropped here; they never reach
    /// the protocol layer and never crash the endpoint.
    pub fn recv_from(&mut self) -> Option<(Envelope, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                if amt < MIN_DATAGRAM_SIZE {
                    trace!(?from, amt, "Dropped undersized datagram");
                    return None;
                }
                if from.port() == 0 {
                    trace!(?from, "Dropped datagram from port 0");
                    return None;
                }

                let type_byte = buf[0];
                let mut id: CallId = [0u8; 20];
                id.copy_from_slice(&buf[1..HEADER_SIZE]);

                let mut payload_bytes = &buf[HEADER_SIZE..amt];

                match type_byte {
                    TYPE_CALL => match rmpv::decode::read_value(&mut payload_bytes) {
                        Ok(payload) => return Some((Envelope::Call { id, payload }, from)),
                        Err(error) => {
                            warn!(?error, ?from, "Dropped unparsable call payload");
                        }
                    },
                    TYPE_REPLY => {
                        if !self.accept_reply(&id, &from) {
                            return None;
                        }

                        match rmpv::decode::read_value(&mut payload_bytes) {
                            Ok(payload) => return Some((Envelope::Reply { id, payload }, from)),
                            Err(error) => {
                                warn!(?error, ?from, "Dropped unparsable reply payload");
                            }
                        }
                    }
                    _ => {
                        trace!(?from, type_byte, "Dropped datagram with unknown type byte");
                    }
                }
            }
            Ok((_, SocketAddr::V6(from))) => {
                trace!(?from, "Dropped IPv6 datagram");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(?e, "recv_from failed unexpectedly");
            }
        }

        None
    }

    /// Remove and return calls whose timeout has elapsed, so the caller
    /// can treat those peers as dead.
    pub fn take_expired(&mut self) -> Vec<CallId> {
        let timeout = self.request_timeout;

        let expired: Vec<CallId> = self
            .inflight
            .iter()
            .filter(|(_, call)| call.sent_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.inflight.remove(id);
        }

        expired
    }

    // === Private Methods ===

    /// Validate a reply against the inflight table; a match removes the
    /// pending call.
    fn accept_reply(&mut self, id: &CallId, from: &SocketAddrV4) -> bool {
        match self.inflight.get(id) {
            Some(call) if same_source(&call.to, from) => {
                self.inflight.remove(id);
                true
            }
            Some(_) => {
                debug!(?from, "Dropped reply from wrong address");
                false
            }
            None => {
                debug!(?from, "Dropped unexpected or late reply");
                false
            }
        }
    }
}

fn frame(type_byte: u8, id: &CallId, payload: &rmpv::Value) -> Result<Vec<u8>, SendError> {
    let mut datagram = Vec::with_capacity(HEADER_SIZE + 128);
    datagram.push(type_byte);
    datagram.extend_from_slice(id);

    rmpv::encode::write_value(&mut datagram, payload)?;

    let payload_len = datagram.len() - HEADER_SIZE;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(SendError::PayloadTooLarge(payload_len));
    }

    Ok(datagram)
}

// Same as SocketAddrV4::eq but tolerates an unspecified bind address.
fn same_source(expected: &SocketAddrV4, actual: &SocketAddrV4) -> bool {
    if expected.port() != actual.port() {
        return false;
    }

    if expected.ip().is_unspecified() {
        return true;
    }

    expected.ip() == actual.ip()
}

#[cfg(test)]
mod test {
    use super::*;

    fn localhost_socket(timeout: Duration) -> RpcSocket {
        RpcSocket::bind(Ipv4Addr::LOCALHOST, 0, timeout).unwrap()
    }

    fn recv_blocking(socket: &mut RpcSocket) -> Option<(Envelope, SocketAddrV4)> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(received) = socket.recv_from() {
                return Some(received);
            }
        }
        None
    }

    #[test]
    fn call_and_reply_round_trip() {
        let mut client = localhost_socket(DEFAULT_REQUEST_TIMEOUT);
        let mut server = localhost_socket(DEFAULT_REQUEST_TIMEOUT);

        let payload = rmpv::Value::from("hello");
        let call_id = client.call(server.local_addr(), &payload).unwrap();
        assert!(client.is_inflight(&call_id));

        let (envelope, from) = recv_blocking(&mut server).expect("server should receive the call");
        assert_eq!(from.port(), client.local_addr().port());

        match envelope {
            Envelope::Call { id, payload } => {
                assert_eq!(id, call_id);
                assert_eq!(payload.as_str(), Some("hello"));
                server.reply(from, &id, &rmpv::Value::from(42));
            }
            other => panic!("expected call, got {:?}", other),
        }

        let (envelope, _) = recv_blocking(&mut client).expect("client should receive the reply");
        match envelope {
            Envelope::Reply { id, payload } => {
                assert_eq!(id, call_id);
                assert_eq!(payload.as_i64(), Some(42));
            }
            other => panic!("expected reply, got {:?}", other),
        }

        assert!(!client.is_inflight(&call_id));
    }

    #[test]
    fn unsolicited_reply_is_dropped() {
        let mut client = localhost_socket(DEFAULT_REQUEST_TIMEOUT);
        let mut server = localhost_socket(DEFAULT_REQUEST_TIMEOUT);

        let id: CallId = [7u8; 20];
        client.reply(server.local_addr(), &id, &rmpv::Value::from("spoofed"));

        assert!(recv_blocking_expect_nothing(&mut server));
    }

    #[test]
    fn undersized_datagram_is_dropped() {
        let mut receiver = localhost_socket(DEFAULT_REQUEST_TIMEOUT);

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[0u8; MIN_DATAGRAM_SIZE - 1], receiver.local_addr())
            .unwrap();

        assert!(recv_blocking_expect_nothing(&mut receiver));
    }

    #[test]
    fn expired_calls_are_reported_once() {
        let mut client = localhost_socket(Duration::from_millis(20));
        let nowhere = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);

        let id = client.call(nowhere, &rmpv::Value::Nil).unwrap();

        assert!(client.take_expired().is_empty());

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(client.take_expired(), vec![id]);
        assert!(client.take_expired().is_empty());
        assert!(!client.is_inflight(&id));
    }

    #[test]
    fn oversized_payload_is_rejected_before_sending() {
        let mut client = localhost_socket(DEFAULT_REQUEST_TIMEOUT);
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);

        let big = rmpv::Value::Binary(vec![0u8; MAX_PAYLOAD_SIZE + 1]);

        assert!(matches!(
            client.call(target, &big),
            Err(SendError::PayloadTooLarge(_))
        ));
        assert!(client.inflight.is_empty());
    }

    fn recv_blocking_expect_nothing(socket: &mut RpcSocket) -> bool {
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            if socket.recv_from().is_some() {
                return false;
            }
        }
        true
    }
}
