//! Dht node.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::{
    common::{Contact, Id, RoutingTable},
    rpc::{AnswerPing, Config, Info, LookupEvent, Rpc, Target, TrustFilter},
    Error, Result,
};

#[derive(Debug, Clone)]
/// Kadnode Dht node.
///
/// Cheap to clone, every clone talks to the same node thread. The node shuts down
/// once [Dht::shutdown] is called or every clone is dropped.
pub struct Dht(Sender<ActorMessage>);

#[derive(Debug, Default)]
/// A builder for [Dht].
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set an explicit node Id.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);

        self
    }

    /// Set the length of Ids in bytes.
    pub fn id_length(mut self, id_length: usize) -> Self {
        self.0.id_length = id_length;

        self
    }

    /// Set the Ipv4 address to listen on and advertise.
    pub fn ip(mut self, ip: Ipv4Addr) -> Self {
        self.0.ip = ip;

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);

        self
    }

    pub fn k_depth(mut self, k_depth: usize) -> Self {
        self.0.k_depth = k_depth;

        self
    }

    pub fn min_contact(mut self, min_contact: usize) -> Self {
        self.0.min_contact = min_contact;

        self
    }

    /// Set the distance within which announced topics are pulled.
    pub fn interest_radius(mut self, interest_radius: u16) -> Self {
        self.0.interest_radius = Some(interest_radius);

        self
    }

    pub fn max_expiry(mut self, max_expiry: u64) -> Self {
        self.0.max_expiry = max_expiry;

        self
    }

    pub fn expiry_unit(mut self, expiry_unit: Duration) -> Self {
        self.0.expiry_unit = expiry_unit;

        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.0.poll_interval = poll_interval;

        self
    }

    /// Persist state under this directory, and resume the last identity from it.
    pub fn storage(mut self, storage: PathBuf) -> Self {
        self.0.storage = Some(storage);

        self
    }

    pub fn answer_ping(mut self, answer_ping: AnswerPing) -> Self {
        self.0.answer_ping = answer_ping;

        self
    }

    pub fn trust(mut self, trust: Box<dyn TrustFilter>) -> Self {
        self.0.trust = trust;

        self
    }

    /// Create a Dht node.
    pub fn build(self) -> Result<Dht> {
        Dht::new(self.0)
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// The socket is bound before returning, the node then runs on its own thread.
    pub fn new(config: Config) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();

        let rpc = Rpc::new(config)?;
        let name = format!("kadnode-{}", rpc.id());

        thread::Builder::new()
            .name(name)
            .spawn(move || run(rpc, receiver))?;

        Ok(Dht(sender))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info> {
        self.request(ActorMessage::Info)
    }

    /// Returns the node's Id.
    pub fn id(&self) -> Result<Id> {
        Ok(self.info()?.id().clone())
    }

    /// Returns the address this node is listening on.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        Ok(self.info()?.local_addr())
    }

    /// Returns `true` if the routing table is not empty.
    pub fn is_connected(&self) -> Result<bool> {
        Ok(self.info()?.is_connected())
    }

    /// Number of contacts in the routing table.
    pub fn known_contacts_count(&self) -> Result<usize> {
        Ok(self.info()?.known_contacts())
    }

    /// A copy of the routing table, for inspection.
    pub fn routing_table(&self) -> Result<RoutingTable> {
        self.request(ActorMessage::RoutingTable)
    }

    // === Public Methods ===

    /// Fire a PING, returns `true` if it was sent.
    pub fn ping(&self, target: impl Into<Target>) -> Result<bool> {
        let target = target.into();

        self.request(|sender| ActorMessage::Ping(target, sender))
    }

    /// Ping `contact` and wait up to `timeout` for it to show up.
    ///
    /// Also gives up once `k_depth` other messages arrived first.
    pub fn ping_and_wait(&self, contact: &Contact, timeout: Duration) -> Result<bool> {
        let (sender, receiver) = flume::unbounded();

        self.send(ActorMessage::PingAndWait(contact.clone(), sender))?;

        Ok(receiver.recv_deadline(Instant::now() + timeout).is_ok())
    }

    /// Ask `target` to store `value` under `key`, returns `true` if it was sent.
    pub fn store(&self, target: impl Into<Target>, key: Id, value: &str) -> Result<bool> {
        let target = target.into();
        let value = value.to_string();

        self.request(|sender| ActorMessage::Store(target, key, value, sender))?
    }

    /// Store a value at this node and replicate it to the closest known contacts.
    pub fn put(&self, key: Id, value: &str) -> Result<()> {
        let value = value.to_string();

        self.request(|sender| ActorMessage::Put(key, value, sender))?
    }

    /// Read a value from this node's store.
    pub fn get(&self, key: Id) -> Result<Option<String>> {
        self.request(|sender| ActorMessage::Get(key, sender))
    }

    /// Ask `target` for the value of `key`.
    pub fn find_value(&self, target: impl Into<Target>, key: Id) -> Result<LookupResponse> {
        let target = target.into();

        self.lookup(|events, sender| ActorMessage::FindValue(target, key, events, sender))
    }

    /// Iteratively look for the node `target`.
    pub fn find_node(&self, target: Id) -> Result<LookupResponse> {
        self.lookup(|events, sender| ActorMessage::FindNode(target, events, sender))
    }

    /// Inform the closest other known contact about `topic`.
    pub fn announce_topic(&self, topic: Id) -> Result<bool> {
        self.request(|sender| ActorMessage::AnnounceTopic(topic, sender))?
    }

    /// Ask the node at `address` for contacts close to this node.
    pub fn bootstrap(&self, address: SocketAddrV4) -> Result<bool> {
        self.request(|sender| ActorMessage::Bootstrap(address, sender))
    }

    /// Add or refresh a contact, returns `true` if it was already known.
    pub fn register_contact(&self, contact: Contact) -> Result<bool> {
        self.request(|sender| ActorMessage::RegisterContact(contact, sender))
    }

    /// Persist the node's state now, if a storage directory is configured.
    pub fn save(&self) -> Result<()> {
        self.request(ActorMessage::Save)
    }

    /// Stop the node thread once it persisted its state.
    pub fn shutdown(&self) -> Result<()> {
        self.request(ActorMessage::Shutdown)
    }

    // === Private Methods ===

    fn send(&self, message: ActorMessage) -> Result<()> {
        self.0.send(message).map_err(|_| Error::ActorShutdown)
    }

    fn request<T>(&self, message: impl FnOnce(Sender<T>) -> ActorMessage) -> Result<T> {
        let (sender, receiver) = flume::bounded::<T>(1);

        self.send(message(sender))?;

        receiver.recv().map_err(|_| Error::ActorShutdown)
    }

    fn lookup(
        &self,
        message: impl FnOnce(Sender<LookupEvent>, Sender<Result<bool>>) -> ActorMessage,
    ) -> Result<LookupResponse> {
        let (sender, receiver) = flume::unbounded::<LookupEvent>();

        self.request(|result| message(sender, result))??;

        Ok(LookupResponse { receiver })
    }
}

fn run(mut rpc: Rpc, receiver: Receiver<ActorMessage>) {
    loop {
        match handle_messages(&mut rpc, &receiver) {
            Flow::Continue => {}
            Flow::Shutdown(sender) => {
                rpc.flush();
                info!(id = %rpc.id(), "Kadnode shutdown");

                // Requests sent from now on fail instead of waiting forever.
                receiver.try_iter().for_each(drop);
                drop(receiver);

                if let Some(sender) = sender {
                    let _ = sender.send(());
                }

                return;
            }
        }

        rpc.tick();
    }
}

enum Flow {
    Continue,
    Shutdown(Option<Sender<()>>),
}

/// Handle every pending actor message.
fn handle_messages(rpc: &mut Rpc, receiver: &Receiver<ActorMessage>) -> Flow {
    loop {
        let message = match receiver.try_recv() {
            Ok(message) => message,
            Err(TryRecvError::Empty) => return Flow::Continue,
            Err(TryRecvError::Disconnected) => {
                debug!("Kadnode Dht was dropped, shutting down");
                return Flow::Shutdown(None);
            }
        };

        match message {
            ActorMessage::Shutdown(sender) => return Flow::Shutdown(Some(sender)),
            ActorMessage::Info(sender) => {
                let _ = sender.send(rpc.info());
            }
            ActorMessage::RoutingTable(sender) => {
                let _ = sender.send(rpc.routing_table().clone());
            }
            ActorMessage::Ping(target, sender) => {
                let _ = sender.send(rpc.ping(target));
            }
            ActorMessage::PingAndWait(contact, sender) => {
                rpc.track_liveness(contact.id().clone(), &contact, sender);
            }
            ActorMessage::Store(target, key, value, sender) => {
                let _ = sender.send(rpc.store_at(target, key, value));
            }
            ActorMessage::Put(key, value, sender) => {
                let _ = sender.send(rpc.put(key, value));
            }
            ActorMessage::Get(key, sender) => {
                let _ = sender.send(rpc.get(&key));
            }
            ActorMessage::FindValue(target, key, events, sender) => {
                let _ = sender.send(rpc.find_value(target, key, Some(events)));
            }
            ActorMessage::FindNode(target, events, sender) => {
                let _ = sender.send(rpc.find_node(target, Some(events)));
            }
            ActorMessage::AnnounceTopic(topic, sender) => {
                let _ = sender.send(rpc.announce_topic(topic));
            }
            ActorMessage::Bootstrap(address, sender) => {
                let _ = sender.send(rpc.bootstrap(address));
            }
            ActorMessage::RegisterContact(contact, sender) => {
                let _ = sender.send(rpc.register_contact(contact));
            }
            ActorMessage::Save(sender) => {
                rpc.flush();
                let _ = sender.send(());
            }
        }
    }
}

#[derive(Debug)]
enum ActorMessage {
    Shutdown(Sender<()>),
    Info(Sender<Info>),
    RoutingTable(Sender<RoutingTable>),
    Ping(Target, Sender<bool>),
    PingAndWait(Contact, Sender<LookupEvent>),
    Store(Target, Id, String, Sender<Result<bool>>),
    Put(Id, String, Sender<Result<()>>),
    Get(Id, Sender<Option<String>>),
    FindValue(Target, Id, Sender<LookupEvent>, Sender<Result<bool>>),
    FindNode(Id, Sender<LookupEvent>, Sender<Result<bool>>),
    AnnounceTopic(Id, Sender<Result<bool>>),
    Bootstrap(SocketAddrV4, Sender<bool>),
    RegisterContact(Contact, Sender<bool>),
    Save(Sender<()>),
}

/// Progress events of a lookup.
///
/// Iterating blocks until the next event. Iteration ends once the lookup
/// found its target, or timed out after `k_depth` inbound messages.
#[derive(Debug)]
pub struct LookupResponse {
    receiver: Receiver<LookupEvent>,
}

impl LookupResponse {
    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<LookupEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Wait until `timeout` elapsed for an event carrying a value.
    pub fn value_within(self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;

        while let Ok(event) = self.receiver.recv_deadline(deadline) {
            if event.value.is_some() {
                return event.value;
            }
        }

        None
    }

    /// Wait until `timeout` elapsed for the target itself to be observed.
    pub fn found_within(&mut self, timeout: Duration) -> Option<LookupEvent> {
        let deadline = Instant::now() + timeout;

        while let Ok(event) = self.receiver.recv_deadline(deadline) {
            if event.distance == 0 {
                return Some(event);
            }
        }

        None
    }
}

impl Iterator for LookupResponse {
    type Item = LookupEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

/// Create a testnet of Dht nodes on the local network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: SocketAddrV4,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Spawn `count` nodes, each bootstrapped from the first one.
    pub fn new(count: usize) -> Result<Testnet> {
        let first = Dht::builder().build()?;
        let bootstrap = first.local_addr()?;

        let mut nodes = vec![first];

        for _ in 1..count {
            let node = Dht::builder().build()?;
            node.bootstrap(bootstrap)?;

            nodes.push(node);
        }

        let deadline = Instant::now() + Duration::from_secs(2);

        for node in &nodes[1..] {
            while !node.is_connected()? && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
        }

        Ok(Testnet { bootstrap, nodes })
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn id(s: &str) -> Id {
        Id::from_str(s).unwrap()
    }

    #[test]
    fn shutdown() {
        let dht = Dht::builder().build().unwrap();

        let clone = dht.clone();

        dht.shutdown().unwrap();

        assert!(matches!(clone.info(), Err(Error::ActorShutdown)));
        assert!(matches!(
            clone.put(id("00000001"), "ECHO"),
            Err(Error::ActorShutdown)
        ));
    }

    #[test]
    fn builder_options() {
        let dht = Dht::builder()
            .id(id("0102030405060708"))
            .id_length(8)
            .build()
            .unwrap();

        let info = dht.info().unwrap();

        assert_eq!(info.id(), &id("0102030405060708"));
        assert_eq!(info.local_addr().ip(), &Ipv4Addr::LOCALHOST);
        assert!(!info.is_connected());

        assert!(matches!(
            Dht::builder().id(id("01020304")).id_length(8).build(),
            Err(Error::IdLengthMismatch { .. })
        ));
    }

    #[test]
    fn put_and_get() {
        let dht = Dht::builder().build().unwrap();

        dht.put(id("0badcafe"), "ECHO").unwrap();

        assert_eq!(dht.get(id("0badcafe")).unwrap(), Some("ECHO".to_string()));
        assert!(matches!(
            dht.put(id("0badcafe"), ""),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn ping_and_wait() {
        let a = Dht::builder().build().unwrap();
        let b = Dht::builder().build().unwrap();

        let contact = Contact::new(b.id().unwrap(), b.local_addr().unwrap());

        assert!(a.ping_and_wait(&contact, Duration::from_secs(2)).unwrap());
        assert!(a.routing_table().unwrap().is_known_id(contact.id()));
    }

    #[test]
    fn ping_and_wait_silent_peer() {
        let a = Dht::builder().build().unwrap();
        let b = Dht::builder().answer_ping(AnswerPing::Never).build().unwrap();

        let contact = Contact::new(b.id().unwrap(), b.local_addr().unwrap());

        assert!(!a
            .ping_and_wait(&contact, Duration::from_millis(200))
            .unwrap());
    }

    #[test]
    fn save_and_resume_identity() {
        let dir = tempfile::tempdir().unwrap();

        let dht = Dht::builder()
            .storage(dir.path().to_path_buf())
            .build()
            .unwrap();
        let id = dht.id().unwrap();

        dht.register_contact(Contact::new(
            Id::random(4),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4001),
        ))
        .unwrap();
        dht.shutdown().unwrap();

        let resumed = Dht::builder()
            .storage(dir.path().to_path_buf())
            .build()
            .unwrap();

        assert_eq!(resumed.id().unwrap(), id);
        assert_eq!(resumed.known_contacts_count().unwrap(), 1);
    }

    #[test]
    fn testnet() {
        let testnet = Testnet::new(5).unwrap();

        for node in &testnet.nodes {
            assert!(node.is_connected().unwrap());
        }

        assert_eq!(testnet.nodes[0].known_contacts_count().unwrap(), 4);
    }
}
