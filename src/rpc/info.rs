use std::net::SocketAddrV4;

use crate::common::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    known_contacts: usize,
    stored_entries: usize,
    pending_lookups: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    /// Number of contacts in the routing table.
    pub fn known_contacts(&self) -> usize {
        self.known_contacts
    }
    /// Number of entries in the store, expired entries that weren't read yet included.
    pub fn stored_entries(&self) -> usize {
        self.stored_entries
    }
    /// Number of lookups still waiting for progress.
    pub fn pending_lookups(&self) -> usize {
        self.pending_lookups
    }
    /// Returns `true` if this node knows at least one contact.
    pub fn is_connected(&self) -> bool {
        self.known_contacts > 0
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: rpc.id().clone(),
            local_addr: rpc.local_addr(),
            known_contacts: rpc.known_contacts_count(),
            stored_entries: rpc.store().len(),
            pending_lookups: rpc.pending_lookups(),
        }
    }
}
