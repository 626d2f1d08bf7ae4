//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A known peer, copied by value into buckets.
pub struct Contact {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Contact {
        Contact { id, address }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.address.ip()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Encodes this contact's address as a contact record `CNT-<ip>@<port>`,
    /// used as the value of STORE messages that carry routing information.
    pub fn to_record(&self) -> String {
        format!("{}{}@{}", CONTACT_RECORD_PREFIX, self.ip(), self.port())
    }
}

/// Prefix of a stored value that is a contact record instead of user data.
pub const CONTACT_RECORD_PREFIX: &str = "CNT-";

/// Parse a `CNT-<ip>@<port>` contact record.
///
/// Returns `None` if the value is not a contact record or is malformed.
pub fn parse_contact_record(value: &str) -> Option<SocketAddrV4> {
    let (ip, port) = value.strip_prefix(CONTACT_RECORD_PREFIX)?.split_once('@')?;

    Some(SocketAddrV4::new(ip.parse().ok()?, port.parse().ok()?))
}
