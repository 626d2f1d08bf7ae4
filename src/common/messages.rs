//! Serialize and deserialize pipe-delimited wire messages.
//!
//! Every message starts with the sender's presentation header
//! `ID|<id>|AT|<ip>:<port>`, optionally followed by exactly one body:
//!
//! ```text
//! ID|<id>|AT|<ip>:<port>                        presentation only
//! ID|<id>|AT|<ip>:<port>|PING
//! ID|<id>|AT|<ip>:<port>|STORE|<key>|<value>
//! ID|<id>|AT|<ip>:<port>|FIND_NODE|<target>
//! ID|<id>|AT|<ip>:<port>|FIND_VALUE|<key>
//! ID|<id>|AT|<ip>:<port>|BOOT|AT|<port>
//! ID|<id>|AT|<ip>:<port>|INFO|<topic>|AT|<sender id>
//! ID|<id>|AT|<ip>:<port>|NOP|<key>
//! ```
//!
//! The ASCII frame is base64 encoded on the wire.

use std::net::{Ipv4Addr, SocketAddrV4};

use base64::{engine::general_purpose, Engine as _};

use crate::common::{Contact, Id, CONTACT_RECORD_PREFIX};
use crate::{Error, Result};

/// Maximum length of a stored value, keeps encoded frames under the receive buffer.
pub const MAX_VALUE_LENGTH: usize = 1024;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Message {
    /// Id of the peer presenting itself in the header.
    pub sender_id: Id,
    /// Address the presented peer listens on.
    ///
    /// An unspecified ip (`0.0.0.0`) means "the ip this datagram came from".
    pub sender_address: SocketAddrV4,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MessageType {
    /// Header only, used as a pong and to push known contacts.
    Presentation,
    Ping,
    Store { key: Id, value: String },
    FindNode { target: Id },
    FindValue { key: Id },
    /// Ask for the contacts closest to the requester, listening on `port`.
    Boot { port: u16 },
    /// Announce that `sender` has information about `topic`.
    Info { topic: Id, sender: Id },
    /// Not found.
    Nop { key: Id },
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Invalid base64 framing: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Message is not ASCII")]
    NotAscii,

    #[error("Missing presentation header")]
    MissingHeader,

    #[error("Invalid id: {0:?}")]
    InvalidId(String),

    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("Unknown message type: {0:?}")]
    UnknownType(String),

    #[error("Malformed {0} message")]
    Malformed(&'static str),
}

impl Message {
    pub fn new(sender: &Contact, message_type: MessageType) -> Self {
        Message {
            sender_id: sender.id().clone(),
            sender_address: sender.address(),
            message_type,
        }
    }

    /// The contact presented in the header, with its ip resolved against
    /// the source address of the datagram.
    pub fn sender(&self, from: SocketAddrV4) -> Contact {
        let ip = if self.sender_address.ip().is_unspecified() {
            *from.ip()
        } else {
            *self.sender_address.ip()
        };

        Contact::new(
            self.sender_id.clone(),
            SocketAddrV4::new(ip, self.sender_address.port()),
        )
    }

    /// Decode a base64 framed datagram. Ids must be `id_length` bytes long.
    pub fn from_bytes(bytes: &[u8], id_length: usize) -> std::result::Result<Message, DecodeError> {
        let decoded = general_purpose::STANDARD.decode(bytes)?;

        if !decoded.is_ascii() {
            return Err(DecodeError::NotAscii);
        }

        let frame = String::from_utf8(decoded).map_err(|_| DecodeError::NotAscii)?;

        Message::from_frame(&frame, id_length)
    }

    /// Encode this message as a base64 framed datagram.
    pub fn to_bytes(&self) -> Vec<u8> {
        general_purpose::STANDARD.encode(self.to_frame()).into_bytes()
    }

    /// Parse the ASCII frame.
    pub fn from_frame(frame: &str, id_length: usize) -> std::result::Result<Message, DecodeError> {
        let fields: Vec<&str> = frame.split('|').collect();

        let (sender_id, sender_address, body) = match fields.as_slice() {
            ["ID", id, "AT", address, body @ ..] => {
                (parse_id(id, id_length)?, parse_address(address)?, body)
            }
            _ => return Err(DecodeError::MissingHeader),
        };

        let message_type = match body {
            [] => MessageType::Presentation,
            ["PING"] => MessageType::Ping,
            ["STORE", key, value] if !value.is_empty() => MessageType::Store {
                key: parse_id(key, id_length)?,
                value: value.to_string(),
            },
            ["FIND_NODE", target] => MessageType::FindNode {
                target: parse_id(target, id_length)?,
            },
            ["FIND_VALUE", key] => MessageType::FindValue {
                key: parse_id(key, id_length)?,
            },
            ["BOOT", "AT", port] => MessageType::Boot {
                port: port
                    .parse()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| DecodeError::InvalidAddress(port.to_string()))?,
            },
            ["INFO", topic, "AT", sender] => MessageType::Info {
                topic: parse_id(topic, id_length)?,
                sender: parse_id(sender, id_length)?,
            },
            ["NOP", key] => MessageType::Nop {
                key: parse_id(key, id_length)?,
            },
            [kind, ..] => {
                return Err(match *kind {
                    "PING" => DecodeError::Malformed("PING"),
                    "STORE" => DecodeError::Malformed("STORE"),
                    "FIND_NODE" => DecodeError::Malformed("FIND_NODE"),
                    "FIND_VALUE" => DecodeError::Malformed("FIND_VALUE"),
                    "BOOT" => DecodeError::Malformed("BOOT"),
                    "INFO" => DecodeError::Malformed("INFO"),
                    "NOP" => DecodeError::Malformed("NOP"),
                    other => DecodeError::UnknownType(other.to_string()),
                })
            }
        };

        Ok(Message {
            sender_id,
            sender_address,
            message_type,
        })
    }

    /// Render the ASCII frame.
    pub fn to_frame(&self) -> String {
        let header = format!("ID|{}|AT|{}", self.sender_id, self.sender_address);

        match &self.message_type {
            MessageType::Presentation => header,
            MessageType::Ping => format!("{header}|PING"),
            MessageType::Store { key, value } => format!("{header}|STORE|{key}|{value}"),
            MessageType::FindNode { target } => format!("{header}|FIND_NODE|{target}"),
            MessageType::FindValue { key } => format!("{header}|FIND_VALUE|{key}"),
            MessageType::Boot { port } => format!("{header}|BOOT|AT|{port}"),
            MessageType::Info { topic, sender } => format!("{header}|INFO|{topic}|AT|{sender}"),
            MessageType::Nop { key } => format!("{header}|NOP|{key}"),
        }
    }

    /// Short name of the message type, for logs.
    pub fn kind(&self) -> &'static str {
        match self.message_type {
            MessageType::Presentation => "ID",
            MessageType::Ping => "PING",
            MessageType::Store { .. } => "STORE",
            MessageType::FindNode { .. } => "FIND_NODE",
            MessageType::FindValue { .. } => "FIND_VALUE",
            MessageType::Boot { .. } => "BOOT",
            MessageType::Info { .. } => "INFO",
            MessageType::Nop { .. } => "NOP",
        }
    }
}

/// Check that a value can travel inside a STORE message as user data.
///
/// Values tagged as contact records are routing information, not user data.
pub fn validate_value(value: &str) -> Result<()> {
    if value.is_empty()
        || value.len() > MAX_VALUE_LENGTH
        || !value.is_ascii()
        || value.contains('|')
        || value.starts_with(CONTACT_RECORD_PREFIX)
    {
        return Err(Error::InvalidValue(value.to_string()));
    }

    Ok(())
}

fn parse_id(s: &str, id_length: usize) -> std::result::Result<Id, DecodeError> {
    Id::parse(s, id_length).map_err(|_| DecodeError::InvalidId(s.to_string()))
}

/// Accepts `ip:port`, or a bare `port` as sent by older peers.
///
/// Port 0 is unreachable and rejected.
fn parse_address(s: &str) -> std::result::Result<SocketAddrV4, DecodeError> {
    let address = s
        .parse::<SocketAddrV4>()
        .or_else(|_| {
            s.parse::<u16>()
                .map(|port| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        })
        .map_err(|_| DecodeError::InvalidAddress(s.to_string()))?;

    if address.port() == 0 {
        return Err(DecodeError::InvalidAddress(s.to_string()));
    }

    Ok(address)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn id(s: &str) -> Id {
        Id::from_str(s).unwrap()
    }

    fn sender() -> Contact {
        Contact::new(id("cb9edfff"), SocketAddrV4::new([127, 0, 0, 1].into(), 4000))
    }

    #[test]
    fn frames() {
        let cases = [
            (MessageType::Presentation, "ID|cb9edfff|AT|127.0.0.1:4000"),
            (MessageType::Ping, "ID|cb9edfff|AT|127.0.0.1:4000|PING"),
            (
                MessageType::Store {
                    key: id("0a0b0c0d"),
                    value: "ECHO".to_string(),
                },
                "ID|cb9edfff|AT|127.0.0.1:4000|STORE|0a0b0c0d|ECHO",
            ),
            (
                MessageType::FindNode {
                    target: id("0a0b0c0d"),
                },
                "ID|cb9edfff|AT|127.0.0.1:4000|FIND_NODE|0a0b0c0d",
            ),
            (
                MessageType::FindValue {
                    key: id("0a0b0c0d"),
                },
                "ID|cb9edfff|AT|127.0.0.1:4000|FIND_VALUE|0a0b0c0d",
            ),
            (
                MessageType::Boot { port: 4000 },
                "ID|cb9edfff|AT|127.0.0.1:4000|BOOT|AT|4000",
            ),
            (
                MessageType::Info {
                    topic: id("493b1310"),
                    sender: id("87f1640e"),
                },
                "ID|cb9edfff|AT|127.0.0.1:4000|INFO|493b1310|AT|87f1640e",
            ),
            (
                MessageType::Nop { key: id("0a0b0c0d") },
                "ID|cb9edfff|AT|127.0.0.1:4000|NOP|0a0b0c0d",
            ),
        ];

        for (message_type, frame) in cases {
            let message = Message::new(&sender(), message_type);

            assert_eq!(message.to_frame(), frame);
            assert_eq!(Message::from_frame(frame, 4).unwrap(), message);
        }
    }

    #[test]
    fn base64_framing() {
        let message = Message::new(&sender(), MessageType::Ping);
        let bytes = message.to_bytes();

        assert_eq!(
            bytes,
            b"SUR8Y2I5ZWRmZmZ8QVR8MTI3LjAuMC4xOjQwMDB8UElORw==".to_vec()
        );
        assert_eq!(Message::from_bytes(&bytes, 4).unwrap(), message);
    }

    #[test]
    fn contact_record_as_store_value() {
        let frame = "ID|cb9edfff|AT|127.0.0.1:4000|STORE|0a0b0c0d|CNT-127.0.0.1@5000";
        let message = Message::from_frame(frame, 4).unwrap();

        assert_eq!(
            message.message_type,
            MessageType::Store {
                key: id("0a0b0c0d"),
                value: "CNT-127.0.0.1@5000".to_string()
            }
        );
    }

    #[test]
    fn bare_port_header_uses_source_ip() {
        let message = Message::from_frame("ID|cb9edfff|AT|4000|PING", 4).unwrap();
        let from = SocketAddrV4::new([10, 0, 0, 7].into(), 55555);

        assert_eq!(
            message.sender(from).address(),
            SocketAddrV4::new([10, 0, 0, 7].into(), 4000)
        );

        let message = Message::from_frame("ID|cb9edfff|AT|127.0.0.1:4000|PING", 4).unwrap();
        assert_eq!(message.sender(from).address(), sender().address());
    }

    #[test]
    fn reject_invalid_frames() {
        let invalid = [
            "",
            "PING",
            "ID|cb9edfff|PING",
            "AT|127.0.0.1:4000|ID|cb9edfff",
            // Id of the wrong length or not hex.
            "ID|cb9edf|AT|127.0.0.1:4000",
            "ID|zzzzzzzz|AT|127.0.0.1:4000",
            "ID|cb9edfff|AT|nowhere",
            // Unreachable port.
            "ID|cb9edfff|AT|127.0.0.1:0",
            "ID|cb9edfff|AT|0",
            "ID|cb9edfff|AT|127.0.0.1:4000|BOOT|AT|0",
            // Unknown or ambiguous bodies.
            "ID|cb9edfff|AT|127.0.0.1:4000|PONG",
            "ID|cb9edfff|AT|127.0.0.1:4000|PING|4001",
            "ID|cb9edfff|AT|127.0.0.1:4000|PING|STORE|0a0b0c0d|v",
            "ID|cb9edfff|AT|127.0.0.1:4000|STORE|0a0b0c0d",
            "ID|cb9edfff|AT|127.0.0.1:4000|STORE|0a0b0c0d|",
            "ID|cb9edfff|AT|127.0.0.1:4000|STORE|0a0b0c0d|a|b",
            "ID|cb9edfff|AT|127.0.0.1:4000|FIND_NODE",
            "ID|cb9edfff|AT|127.0.0.1:4000|FIND_NODE|0a0b0c0d|FOR|cb9edfff",
            "ID|cb9edfff|AT|127.0.0.1:4000|BOOT|4000",
            "ID|cb9edfff|AT|127.0.0.1:4000|BOOT|AT|http",
            "ID|cb9edfff|AT|127.0.0.1:4000|INFO|493b1310|87f1640e",
        ];

        for frame in invalid {
            assert!(
                Message::from_frame(frame, 4).is_err(),
                "should reject {frame:?}"
            );
        }
    }

    #[test]
    fn reject_invalid_datagrams() {
        assert!(matches!(
            Message::from_bytes(b"not base64!", 4),
            Err(DecodeError::Base64(_))
        ));

        let not_ascii = general_purpose::STANDARD.encode("ID|cb9edfff|AT|4000|STORE|0a0b0c0d|é");
        assert!(matches!(
            Message::from_bytes(not_ascii.as_bytes(), 4),
            Err(DecodeError::NotAscii)
        ));
    }

    #[test]
    fn values() {
        assert!(validate_value("ECHO").is_ok());
        assert!(validate_value("CONTACT").is_ok());

        assert!(validate_value("").is_err());
        assert!(validate_value("CNT-127.0.0.1@4000").is_err());
        assert!(validate_value("CNT-garbage").is_err());
        assert!(validate_value("a|b").is_err());
        assert!(validate_value("é").is_err());
        assert!(validate_value(&"a".repeat(MAX_VALUE_LENGTH + 1)).is_err());
    }
}
