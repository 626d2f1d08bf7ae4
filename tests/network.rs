use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::{Duration, Instant};

use kadnode::{Contact, Dht, Id, Testnet};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds or [TIMEOUT] elapsed.
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }

    condition()
}

fn contact(dht: &Dht) -> Contact {
    Contact::new(dht.id().unwrap(), dht.local_addr().unwrap())
}

#[test]
fn echo() {
    let a = Dht::builder().build().unwrap();
    let b = Dht::builder().build().unwrap();

    b.bootstrap(a.local_addr().unwrap()).unwrap();
    assert!(eventually(|| a.is_connected().unwrap()));

    let key = a.id().unwrap();
    a.put(key.clone(), "ECHO").unwrap();

    assert_eq!(a.get(key.clone()).unwrap(), Some("ECHO".to_string()));
    assert!(eventually(|| b.get(key.clone()).unwrap().is_some()));

    // Replicated back and forth, but stored once each.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(a.info().unwrap().stored_entries(), 1);
    assert_eq!(b.info().unwrap().stored_entries(), 1);
    assert_eq!(b.get(key).unwrap(), Some("ECHO".to_string()));
}

#[test]
fn replicate_to_closest_contacts() {
    let testnet = Testnet::new(5).unwrap();
    let first = &testnet.nodes[0];

    let key = Id::random(4);
    first.put(key.clone(), "REPLICATED").unwrap();

    for node in &testnet.nodes[1..] {
        assert!(eventually(|| node.get(key.clone()).unwrap().is_some()));
    }
}

#[test]
fn store_at_address() {
    let a = Dht::builder().build().unwrap();
    let b = Dht::builder().build().unwrap();

    let key = Id::random(4);
    assert!(a.store(b.local_addr().unwrap(), key.clone(), "HELLO").unwrap());

    assert!(eventually(|| b.get(key.clone()).unwrap().is_some()));
    assert!(eventually(|| b.is_connected().unwrap()));
}

#[test]
fn find_value() {
    let a = Dht::builder().build().unwrap();
    let b = Dht::builder().build().unwrap();

    let key = Id::random(4);
    b.put(key.clone(), "ECHO").unwrap();

    let value = a
        .find_value(b.local_addr().unwrap(), key.clone())
        .unwrap()
        .value_within(TIMEOUT);

    assert_eq!(value, Some("ECHO".to_string()));
}

#[test]
fn find_node() {
    let testnet = Testnet::new(5).unwrap();

    let node = Dht::builder().build().unwrap();
    node.bootstrap(testnet.bootstrap).unwrap();
    assert!(eventually(|| node.is_connected().unwrap()));

    let target = testnet.nodes[3].id().unwrap();

    let found = node.find_node(target.clone()).unwrap().found_within(TIMEOUT);

    assert_eq!(found.map(|event| event.observed), Some(target));
}

#[test]
fn find_node_through_intermediate() {
    let a = Dht::builder().build().unwrap();
    let b = Dht::builder().build().unwrap();
    let c = Dht::builder().build().unwrap();

    a.register_contact(contact(&b)).unwrap();
    b.register_contact(contact(&c)).unwrap();

    let target = c.id().unwrap();

    let found = a.find_node(target.clone()).unwrap().found_within(TIMEOUT);

    assert!(found.is_some());
    assert!(a.routing_table().unwrap().is_known_id(&target));
}

#[test]
fn bootstrap_learns_contacts() {
    let a = Dht::builder().build().unwrap();
    let b = Dht::builder().build().unwrap();
    let c = Dht::builder().build().unwrap();

    b.register_contact(contact(&c)).unwrap();
    a.bootstrap(b.local_addr().unwrap()).unwrap();

    assert!(eventually(|| a.known_contacts_count().unwrap() == 2));

    let table = a.routing_table().unwrap();
    assert!(table.is_known_id(&b.id().unwrap()));
    assert!(table.is_known_id(&c.id().unwrap()));
}

#[test]
fn announced_topics_are_pulled() {
    // Ids chosen so that `b`, not `c`, is the closest other contact to `c`.
    let a = Dht::builder().id(id("00000000")).build().unwrap();
    let b = Dht::builder().id(id("f0000000")).build().unwrap();
    let c = Dht::builder().id(id("f0000001")).build().unwrap();

    a.register_contact(contact(&b)).unwrap();
    a.register_contact(contact(&c)).unwrap();
    b.register_contact(contact(&a)).unwrap();

    assert!(a.announce_topic(c.id().unwrap()).unwrap());

    assert!(eventually(|| b
        .routing_table()
        .unwrap()
        .is_known_id(&c.id().unwrap())));
}

#[test]
fn unknown_target_is_not_sent() {
    let a = Dht::builder().build().unwrap();

    assert!(!a.ping(Id::random(4)).unwrap());
    assert!(a
        .ping(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9))
        .unwrap());
}

fn id(hex: &str) -> Id {
    Id::parse(hex, 4).unwrap()
}
