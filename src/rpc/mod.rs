//! Node engine: inbound dispatch, outbound requests and replication.

pub mod config;
mod info;
mod snapshot;
mod socket;
pub mod store;
pub mod tracker;

use std::net::SocketAddrV4;

use flume::Sender;
use tracing::{debug, info, warn};

use crate::common::{
    parse_contact_record, validate_value, Contact, Id, Message, MessageType, RoutingTable,
    CONTACT_RECORD_PREFIX, MAX_ID_LENGTH,
};
use crate::{Error, Result};

pub use config::{AnswerPing, Config, TrustFilter};
pub use info::Info;
pub use snapshot::{Identity, Snapshot};
pub use socket::{DhtSocket, DEFAULT_POLL_INTERVAL};
pub use store::Store;
pub use tracker::{Progress, RequestTracker, TrackerHandle};

/// Where to send a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Send directly to this address.
    Address(SocketAddrV4),
    /// Send to the known contact closest to this Id, which may not be the Id itself.
    Id(Id),
}

impl From<SocketAddrV4> for Target {
    fn from(address: SocketAddrV4) -> Self {
        Target::Address(address)
    }
}

impl From<Id> for Target {
    fn from(id: Id) -> Self {
        Target::Id(id)
    }
}

impl From<&Contact> for Target {
    fn from(contact: &Contact) -> Self {
        Target::Address(contact.address())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// Follow every progress with another FIND_NODE toward the closest known contact.
    FindNode,
    FindValue,
    /// Waiting for a pinged contact to show up.
    Liveness,
}

/// Owner of a tracked request.
#[derive(Debug, Clone)]
pub struct Lookup {
    kind: LookupKind,
    sender: Option<Sender<LookupEvent>>,
}

impl Lookup {
    pub fn new(kind: LookupKind, sender: Option<Sender<LookupEvent>>) -> Self {
        Lookup { kind, sender }
    }

    pub fn kind(&self) -> LookupKind {
        self.kind
    }
}

/// A lookup got closer to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupEvent {
    pub target: Id,
    pub observed: Id,
    /// 0 when the target itself was observed.
    pub distance: u16,
    /// The stored value, for a FIND_VALUE lookup that found its key.
    pub value: Option<String>,
}

#[derive(Debug)]
/// A single node of the network: one socket, one routing table, one store.
pub struct Rpc {
    socket: DhtSocket,
    routing_table: RoutingTable,
    store: Store,
    tracker: RequestTracker<Lookup>,
    snapshot: Option<Snapshot>,

    // Options
    id: Id,
    config: Config,
}

impl Rpc {
    /// Bind the socket and restore persisted state, if any.
    pub fn new(config: Config) -> Result<Self> {
        if config.id_length == 0 || config.id_length > MAX_ID_LENGTH {
            return Err(Error::InvalidIdLength(config.id_length));
        }

        let snapshot = config.storage.as_ref().map(Snapshot::new);

        let resumed = match (&config.id, &snapshot) {
            (None, Some(snapshot)) => snapshot.last_identity(config.id_length),
            _ => None,
        };

        let id = match (&config.id, &resumed) {
            (Some(id), _) => {
                if id.len() != config.id_length {
                    return Err(Error::IdLengthMismatch {
                        expected: config.id_length,
                        got: id.len(),
                    });
                }
                id.clone()
            }
            (None, Some(identity)) => identity.id.clone(),
            (None, None) => Id::random(config.id_length),
        };

        let port = config
            .port
            .or(resumed.as_ref().map(|identity| identity.port));

        let socket = DhtSocket::bind(config.ip, port, config.poll_interval, config.id_length)?;

        let mut routing_table = RoutingTable::new(id.clone())
            .with_k_depth(config.k_depth)
            .with_min_contact(config.min_contact)
            .with_interest_radius(config.interest_radius());

        let mut store = Store::new(id.clone())
            .with_max_expiry(config.max_expiry)
            .with_expiry_unit(config.expiry_unit);

        if let Some(snapshot) = &snapshot {
            let contacts = snapshot.load_routing_table(&mut routing_table);
            let entries = snapshot.load_store(&id, &mut store);

            debug!(contacts, entries, root = ?snapshot.root(), "Restored snapshot");
        }

        info!(%id, address = ?socket.local_addr(), "Kadnode listening");

        Ok(Rpc {
            socket,
            routing_table,
            store,
            tracker: RequestTracker::new(config.k_depth),
            snapshot,

            id,
            config,
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    /// The contact other nodes know this node as.
    pub fn contact(&self) -> Contact {
        Contact::new(
            self.id.clone(),
            SocketAddrV4::new(self.config.ip, self.local_addr().port()),
        )
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns `true` if the routing table is not empty.
    pub fn is_connected(&self) -> bool {
        !self.routing_table.is_empty()
    }

    pub fn known_contacts_count(&self) -> usize {
        self.routing_table.size()
    }

    pub fn pending_lookups(&self) -> usize {
        self.tracker.len()
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Wait up to the poll interval for a datagram and handle it to completion.
    ///
    /// Returns the handled message, if any.
    pub fn tick(&mut self) -> Option<Message> {
        let (message, from) = self.socket.recv_from()?;

        let sender = message.sender(from);

        self.register_contact(sender.clone());
        self.notify(sender.id());

        self.handle(&message, &sender, from);

        Some(message)
    }

    /// Add or refresh a contact, returns `true` if it was already known.
    ///
    /// A new contact is handed the stored entries it is closer to than this node.
    pub fn register_contact(&mut self, contact: Contact) -> bool {
        if contact.id() == &self.id || contact.id().len() != self.id.len() {
            return false;
        }

        let existed = self.routing_table.register_contact(contact.clone());

        if !existed {
            self.hand_off(&contact);
        }

        existed
    }

    /// Fire a PING, returns `true` if it was sent.
    ///
    /// Liveness is inferred from later traffic, see [Rpc::track_liveness].
    pub fn ping(&self, target: impl Into<Target>) -> bool {
        self.send(target.into(), MessageType::Ping)
    }

    /// Ask `target` to store `value` under `key`.
    pub fn store_at(&self, target: impl Into<Target>, key: Id, value: String) -> Result<bool> {
        self.check_id(&key)?;
        validate_value(&value)?;

        Ok(self.send(target.into(), MessageType::Store { key, value }))
    }

    /// Store a value locally, and replicate it if it is new.
    pub fn put(&mut self, key: Id, value: String) -> Result<()> {
        self.check_id(&key)?;
        validate_value(&value)?;

        self.put_local(key, value);

        Ok(())
    }

    /// Read a value from the local store.
    pub fn get(&mut self, key: &Id) -> Option<String> {
        self.store.get(key)
    }

    /// Ask `target` for the value of `key`.
    ///
    /// The lookup ends when the value arrives, or after `k_depth` inbound
    /// messages without it. A miss gets no reply.
    pub fn find_value(
        &mut self,
        target: impl Into<Target>,
        key: Id,
        sender: Option<Sender<LookupEvent>>,
    ) -> Result<bool> {
        self.check_id(&key)?;

        self.tracker
            .track(key.clone(), Lookup::new(LookupKind::FindValue, sender));

        Ok(self.send(target.into(), MessageType::FindValue { key }))
    }

    /// Iteratively look for the node `target`.
    ///
    /// Each step asks the closest known contact, and every closer contact it
    /// reveals triggers the next step.
    pub fn find_node(&mut self, target: Id, sender: Option<Sender<LookupEvent>>) -> Result<bool> {
        self.check_id(&target)?;

        self.tracker
            .track(target.clone(), Lookup::new(LookupKind::FindNode, sender));

        Ok(self.send(Target::Id(target.clone()), MessageType::FindNode { target }))
    }

    /// Inform the closest other contact that this node has information about `topic`.
    pub fn announce_topic(&self, topic: Id) -> Result<bool> {
        self.check_id(&topic)?;

        let Some(closest) = self.routing_table.closest_node(&topic, false) else {
            debug!(%topic, "No contact to announce topic to");
            return Ok(false);
        };

        Ok(self.send(
            Target::Address(closest.address()),
            MessageType::Info {
                topic,
                sender: self.id.clone(),
            },
        ))
    }

    /// Ask a known node for contacts close to this node.
    pub fn bootstrap(&self, address: SocketAddrV4) -> bool {
        self.send(
            Target::Address(address),
            MessageType::Boot {
                port: self.local_addr().port(),
            },
        )
    }

    /// Ping `target` and report once a contact with the Id `id` shows up.
    ///
    /// The lookup expires after `k_depth` inbound messages.
    pub fn track_liveness(
        &mut self,
        id: Id,
        target: impl Into<Target>,
        sender: Sender<LookupEvent>,
    ) -> TrackerHandle {
        // Only an exact match is progress.
        let handle = self
            .tracker
            .track_within(id, 1, Lookup::new(LookupKind::Liveness, Some(sender)));

        self.ping(target);

        handle
    }

    /// Stop tracking a lookup, dropping its event sender.
    pub fn cancel(&mut self, handle: TrackerHandle) {
        self.tracker.cancel(handle);
    }

    /// Persist identity, routing table and store, if a storage root is configured.
    ///
    /// Failures are logged, never fatal.
    pub fn flush(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };

        let identity = Identity::new(self.id.clone(), self.contact().address());

        if let Err(error) = snapshot.save_identity(&identity) {
            warn!(?error, "Failed to save identity");
        }
        if let Err(error) = snapshot.save_routing_table(&self.routing_table) {
            warn!(?error, "Failed to save routing table");
        }
        self.save_store();
    }

    // === Private Methods ===

    fn handle(&mut self, message: &Message, sender: &Contact, from: SocketAddrV4) {
        match &message.message_type {
            MessageType::Presentation => {}
            MessageType::Ping => {
                let answer = match self.config.answer_ping {
                    AnswerPing::Always => true,
                    AnswerPing::Trusted => self.config.trust.is_trusted(sender),
                    AnswerPing::Never => false,
                };

                if answer {
                    self.send(sender.into(), MessageType::Presentation);
                }
            }
            MessageType::Store { key, value } => {
                if value.starts_with(CONTACT_RECORD_PREFIX) {
                    match parse_contact_record(value) {
                        Some(address) if address.port() != 0 => {
                            self.register_contact(Contact::new(key.clone(), address));
                        }
                        _ => debug!(%key, ?value, "Dropping malformed contact record"),
                    }
                } else {
                    self.put_local(key.clone(), value.clone());
                }

                // Keys are Ids a lookup may be waiting on.
                self.notify(key);
            }
            MessageType::FindNode { target } => {
                if target == &self.id {
                    self.send(sender.into(), MessageType::Presentation);
                    return;
                }

                let closest: Vec<Contact> = self
                    .routing_table
                    .closest_nodes(target, self.config.k_depth + 1)
                    .into_iter()
                    .map(|(_, contact)| contact)
                    .filter(|contact| contact.id() != sender.id())
                    .take(self.config.k_depth)
                    .collect();

                if closest.is_empty() {
                    self.send(
                        sender.into(),
                        MessageType::Nop {
                            key: target.clone(),
                        },
                    );
                    return;
                }

                // One presentation per contact, so the requester's trackers
                // progress with each of them.
                for contact in &closest {
                    self.socket.send(
                        sender.address(),
                        &Message::new(contact, MessageType::Presentation),
                    );
                }
            }
            MessageType::FindValue { key } => match self.store.get(key) {
                Some(value) => {
                    self.send(
                        sender.into(),
                        MessageType::Store {
                            key: key.clone(),
                            value,
                        },
                    );
                }
                None => debug!(%key, requester = %sender.id(), "FIND_VALUE miss"),
            },
            MessageType::Boot { port } => {
                let address = SocketAddrV4::new(*from.ip(), *port);

                let closest: Vec<Contact> = self
                    .routing_table
                    .closest_nodes(sender.id(), self.config.k_depth + 1)
                    .into_iter()
                    .map(|(_, contact)| contact)
                    .filter(|contact| contact.id() != sender.id())
                    .take(self.config.k_depth)
                    .collect();

                if closest.is_empty() {
                    self.send(Target::Address(address), MessageType::Presentation);
                }

                for contact in closest {
                    self.send(
                        Target::Address(address),
                        MessageType::Store {
                            value: contact.to_record(),
                            key: contact.id,
                        },
                    );
                }
            }
            MessageType::Info { topic, sender: announcer } => {
                if !self.routing_table.is_of_interest(topic) {
                    debug!(%topic, "Topic is out of the interest radius");
                    return;
                }

                self.tracker
                    .track(topic.clone(), Lookup::new(LookupKind::FindNode, None));

                self.send(
                    Target::Id(announcer.clone()),
                    MessageType::FindNode {
                        target: topic.clone(),
                    },
                );
            }
            MessageType::Nop { key } => {
                debug!(%key, from = %sender.id(), "Not found");
            }
        }
    }

    fn notify(&mut self, observed: &Id) {
        for progress in self.tracker.notify(observed) {
            self.on_progress(progress);
        }
    }

    fn on_progress(&mut self, progress: Progress<Lookup>) {
        let Progress {
            target,
            observed,
            distance,
            owner,
        } = progress;

        let value = match owner.kind {
            LookupKind::FindValue if distance == 0 => self.store.get(&target),
            _ => None,
        };

        if owner.kind == LookupKind::FindNode && distance > 0 {
            if let Some(closest) = self.routing_table.closest_node(&target, true) {
                self.socket.send(
                    closest.address(),
                    &Message::new(
                        &self.contact(),
                        MessageType::FindNode {
                            target: target.clone(),
                        },
                    ),
                );
            }
        }

        if let Some(sender) = owner.sender {
            let _ = sender.send(LookupEvent {
                target,
                observed,
                distance,
                value,
            });
        }
    }

    fn put_local(&mut self, key: Id, value: String) {
        if self.store.put(key.clone(), value.clone()) {
            return;
        }

        self.replicate(&key, &value);
        self.save_store();
    }

    /// Push a new entry to the closest known contacts of its key.
    fn replicate(&self, key: &Id, value: &str) {
        let closest = self.routing_table.closest_nodes(key, self.config.k_depth);

        debug!(%key, replicas = closest.len(), "Replicating");

        let message = Message::new(
            &self.contact(),
            MessageType::Store {
                key: key.clone(),
                value: value.to_string(),
            },
        );

        for (_, contact) in closest {
            self.socket.send(contact.address(), &message);
        }
    }

    /// Push entries `contact` is closer to than this node.
    fn hand_off(&self, contact: &Contact) {
        let entries: Vec<(Id, String)> = self
            .store
            .live_entries()
            .filter(|(key, _, _)| contact.id().distance(key) < self.id.distance(key))
            .map(|(key, value, _)| (key.clone(), value.to_string()))
            .collect();

        for (key, value) in entries {
            self.send(contact.into(), MessageType::Store { key, value });
        }
    }

    fn save_store(&self) {
        if let Some(snapshot) = &self.snapshot {
            if let Err(error) = snapshot.save_store(&self.id, &self.store) {
                warn!(?error, "Failed to save store");
            }
        }
    }

    fn send(&self, target: Target, message_type: MessageType) -> bool {
        let Some(address) = self.resolve(&target) else {
            return false;
        };

        self.socket
            .send(address, &Message::new(&self.contact(), message_type))
    }

    fn resolve(&self, target: &Target) -> Option<SocketAddrV4> {
        match target {
            Target::Address(address) => Some(*address),
            Target::Id(id) if id == &self.id => Some(self.local_addr()),
            Target::Id(id) => match self.routing_table.closest_node(id, true) {
                Some(closest) => {
                    if closest.id() != id {
                        debug!(%id, closest = %closest.id(), "Id not known, sending to closest");
                    }
                    Some(closest.address())
                }
                None => {
                    debug!(%id, "No known contact to send to");
                    None
                }
            },
        }
    }

    fn check_id(&self, id: &Id) -> Result<()> {
        if id.len() != self.id.len() {
            return Err(Error::IdLengthMismatch {
                expected: self.id.len(),
                got: id.len(),
            });
        }

        Ok(())
    }
}
