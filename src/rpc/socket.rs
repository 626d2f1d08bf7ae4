//! UDP socket layer: one bound listening socket, fire-and-forget sends.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace};

use crate::common::Message;

const MTU: usize = 2048;

/// Default duration to block waiting for a datagram.
/// Lower values make commands and shutdown more responsive, at the cost of CPU usage.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A UdpSocket wrapper that decodes incoming and encodes outgoing messages.
#[derive(Debug)]
pub struct DhtSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    id_length: usize,
}

impl DhtSocket {
    /// Bind to `ip:port`, falling back to a random port if `port` is in use.
    pub(crate) fn bind(
        ip: Ipv4Addr,
        port: Option<u16>,
        poll_interval: Duration,
        id_length: usize,
    ) -> Result<Self, std::io::Error> {
        let socket = match UdpSocket::bind(SocketAddrV4::new(ip, port.unwrap_or(0))) {
            Ok(socket) => socket,
            Err(error) if error.kind() == ErrorKind::AddrInUse => {
                debug!(?port, "Port is already in use, binding a random port");
                UdpSocket::bind(SocketAddrV4::new(ip, 0))?
            }
            Err(error) => return Err(error),
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("DhtSocket does not support Ipv6"),
        };

        // A zero duration is rejected by set_read_timeout.
        socket.set_read_timeout(Some(poll_interval.max(Duration::from_millis(1))))?;

        Ok(Self {
            socket,
            local_addr,
            id_length,
        })
    }

    #[cfg(test)]
    pub(crate) fn localhost(id_length: usize) -> Result<Self, std::io::Error> {
        Self::bind(
            Ipv4Addr::LOCALHOST,
            None,
            Duration::from_millis(10),
            id_length,
        )
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Waits up to the poll interval for a single message.
    /// On success, returns the message and the origin.
    ///
    /// Invalid datagrams are dropped silently.
    pub fn recv_from(&self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Datagram from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes, self.id_length) {
                    Ok(message) => {
                        trace!(
                            context = "socket_message_receiving",
                            frame = %message.to_frame(),
                            ?from,
                            "Received message"
                        );
                        return Some((message, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid message"
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                debug!(context = "socket_error", ?e, "recv_from failed unexpectedly");
            }
        }

        None
    }

    /// Send a message from a short-lived socket, returns `true` if it was handed to
    /// the network. There are no retries, lost datagrams stay lost.
    pub fn send(&self, address: SocketAddrV4, message: &Message) -> bool {
        let bytes = message.to_bytes();

        let result = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|socket| socket.send_to(&bytes, address));

        match result {
            Ok(_) => {
                trace!(
                    context = "socket_message_sending",
                    frame = %message.to_frame(),
                    ?address,
                    "Sent message"
                );
                true
            }
            Err(error) => {
                debug!(?error, ?address, kind = message.kind(), "Error sending message");
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use crate::common::{Contact, Id, MessageType};

    use super::*;

    fn message() -> Message {
        let sender = Contact::new(
            Id::from_str("cb9edfff").unwrap(),
            SocketAddrV4::new([127, 0, 0, 1].into(), 4000),
        );

        Message::new(
            &sender,
            MessageType::Store {
                key: Id::from_str("0a0b0c0d").unwrap(),
                value: "ECHO".to_string(),
            },
        )
    }

    fn recv_within(socket: &DhtSocket, attempts: usize) -> Option<(Message, SocketAddrV4)> {
        (0..attempts).find_map(|_| socket.recv_from())
    }

    #[test]
    fn send_and_receive() {
        let server = DhtSocket::localhost(4).unwrap();
        let client = DhtSocket::localhost(4).unwrap();

        assert!(client.send(server.local_addr(), &message()));

        let (received, from) = recv_within(&server, 100).unwrap();

        assert_eq!(received, message());
        assert_eq!(from.ip(), &Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn drop_invalid_datagrams() {
        let server = DhtSocket::localhost(4).unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();

        raw.send_to(b"garbage", server.local_addr()).unwrap();
        // Valid framing, but with 8 bytes Ids.
        let sender = Contact::new(
            Id::from_str("0102030405060708").unwrap(),
            SocketAddrV4::new([127, 0, 0, 1].into(), 4000),
        );
        let client = DhtSocket::localhost(8).unwrap();
        client.send(server.local_addr(), &Message::new(&sender, MessageType::Ping));

        assert!(recv_within(&server, 20).is_none());
    }

    #[test]
    fn fallback_to_random_port() {
        let first = DhtSocket::localhost(4).unwrap();
        let port = first.local_addr().port();

        let second =
            DhtSocket::bind(Ipv4Addr::LOCALHOST, Some(port), DEFAULT_POLL_INTERVAL, 4).unwrap();

        assert_ne!(second.local_addr().port(), port);
    }

    #[test]
    fn recv_times_out() {
        let server = DhtSocket::localhost(4).unwrap();

        assert!(server.recv_from().is_none());
    }
}
