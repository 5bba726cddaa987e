//! The socket seam between the session and the operating system.
//!
//! Sessions talk to the network exclusively through [`NonBlockingSocket`],
//! so tests can substitute an in-memory transport. The provided
//! [`UdpNonBlockingSocket`] is a plain non-blocking UDP socket; datagrams
//! that fail to decode are dropped, because UDP is best-effort anyway.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{trace, warn};

use crate::network::messages::Message;

const RECV_BUFFER_SIZE: usize = 4096;

/// A non-blocking message transport between peers.
///
/// `send_to` must never block; `receive_all_messages` returns every decoded
/// message that has arrived since the previous call, in arrival order.
pub trait NonBlockingSocket: std::fmt::Debug {
    /// Sends one message to `addr`. Failures are logged, not returned; a
    /// lost datagram is indistinguishable from network loss.
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr);

    /// Drains all pending datagrams.
    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)>;
}

/// A simple non-blocking UDP socket listening on `0.0.0.0:port`.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port` and switches the socket to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error; the session maps it to
    /// [`NetworkInit`](crate::FramelockError::NetworkInit).
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buffer: [0; RECV_BUFFER_SIZE],
        })
    }
}

impl NonBlockingSocket for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let buf = match bincode::serialize(msg) {
            Ok(buf) => buf,
            Err(error) => {
                warn!(%error, "failed to serialize message, dropping");
                return;
            },
        };
        if let Err(error) = self.socket.send_to(&buf, addr) {
            // dropped packets are expected behavior on UDP
            trace!(%error, %addr, "failed to send datagram");
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    match bincode::deserialize(&self.buffer[0..number_of_bytes]) {
                        Ok(msg) => received.push((src_addr, msg)),
                        Err(_) => trace!(%src_addr, "dropping undecodable datagram"),
                    }
                },
                // no more messages
                Err(ref error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    trace!(%error, "error receiving, stopping drain");
                    break;
                },
            }
        }
        received
    }
}
