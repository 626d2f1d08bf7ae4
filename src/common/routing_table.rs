//! Simplified Kademlia routing table with distance-dependent bucket capacity.

use std::collections::BTreeMap;
use std::slice::Iter;

use crate::common::{Contact, Id};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K_DEPTH: usize = 20;
/// The default minimum capacity of the farthest k-buckets.
pub const DEFAULT_MIN_CONTACT: usize = 5;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k_depth: usize,
    min_contact: usize,
    interest_radius: u16,
    buckets: BTreeMap<u16, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        let interest_radius = id.bits();

        RoutingTable {
            id,
            k_depth: DEFAULT_K_DEPTH,
            min_contact: DEFAULT_MIN_CONTACT,
            interest_radius,
            buckets: BTreeMap::new(),
        }
    }

    // === Options ===

    pub fn with_k_depth(mut self, k_depth: usize) -> Self {
        self.k_depth = k_depth;
        self
    }

    pub fn with_min_contact(mut self, min_contact: usize) -> Self {
        self.min_contact = min_contact;
        self
    }

    /// Distance threshold under which third-party topics are of interest,
    /// defaults to the Id length in bits, which makes every topic interesting.
    pub fn with_interest_radius(mut self, interest_radius: u16) -> Self {
        self.interest_radius = interest_radius;
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn k_depth(&self) -> usize {
        self.k_depth
    }

    /// Returns the map of distances and their [KBucket]
    pub fn buckets(&self) -> &BTreeMap<u16, KBucket> {
        &self.buckets
    }

    // === Public Methods ===

    /// Maximum number of contacts kept in the bucket at `distance`.
    pub fn capacity(&self, distance: u16) -> usize {
        bucket_capacity(distance, self.id.bits(), self.k_depth, self.min_contact)
    }

    /// Register a sighting of a contact, returns `true` if it was already known.
    ///
    /// A known contact is moved to the tail of its bucket (most recently seen),
    /// possibly with a new address. If the bucket is full, the least recently
    /// seen contact is evicted.
    ///
    /// The local Id is never stored.
    pub fn register_contact(&mut self, contact: Contact) -> bool {
        let distance = self.id.distance(contact.id());

        if distance == 0 {
            return false;
        }

        let capacity = self.capacity(distance);
        let bucket = self.buckets.entry(distance).or_default();

        let existed = bucket.remove(contact.id());

        if bucket.len() >= capacity {
            bucket.evict_oldest();
        }

        bucket.contacts.push(contact);

        existed
    }

    /// Returns the single closest known contact to `target`.
    ///
    /// Looks in the bucket `target` would occupy first, and falls back to all
    /// known contacts if that bucket has no candidate. With `allow_exact_match`
    /// set to `false`, a contact with the target's own Id is skipped.
    pub fn closest_node(&self, target: &Id, allow_exact_match: bool) -> Option<&Contact> {
        let distance = self.id.distance(target);

        self.buckets
            .get(&distance)
            .and_then(|bucket| closest_in(bucket.iter(), target, allow_exact_match))
            .or_else(|| closest_in(self.contacts(), target, allow_exact_match))
    }

    /// Returns up to `count` contacts sorted by their distance to `target`.
    ///
    /// Ties keep the order in which buckets are scanned.
    pub fn closest_nodes(&self, target: &Id, count: usize) -> Vec<(u16, Contact)> {
        let mut closest: Vec<(u16, Contact)> = self
            .contacts()
            .map(|contact| (contact.id().distance(target), contact.clone()))
            .collect();

        // Vec::sort_by_key is stable.
        closest.sort_by_key(|(distance, _)| *distance);
        closest.truncate(count);

        closest
    }

    /// Returns `true` if `id` is within the interest radius of this node.
    pub fn is_of_interest(&self, id: &Id) -> bool {
        self.id.distance(id) <= self.interest_radius
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.contacts.len())
    }

    /// Returns `true` if a contact with this Id is known.
    pub fn is_known_id(&self, id: &Id) -> bool {
        let distance = self.id.distance(id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.contains(id))
            .unwrap_or(false)
    }

    /// Returns an iterator over the contacts in this routing table,
    /// from the closest bucket to the farthest.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of contacts from this routing table.
    pub fn to_owned_contacts(&self) -> Vec<Contact> {
        self.contacts().cloned().collect()
    }
}

fn closest_in<'a>(
    contacts: impl Iterator<Item = &'a Contact>,
    target: &Id,
    allow_exact_match: bool,
) -> Option<&'a Contact> {
    let mut closest: Option<(u16, &Contact)> = None;

    for contact in contacts {
        let distance = contact.id().distance(target);

        if distance == 0 && !allow_exact_match {
            continue;
        }

        match closest {
            Some((min, _)) if min <= distance => {}
            _ => closest = Some((distance, contact)),
        }
    }

    closest.map(|(_, contact)| contact)
}

/// Capacity of the bucket at `distance` in a table of `bits` long Ids.
///
/// `max(min_contact, round(k_depth / bits) * (bits - distance))`: close buckets
/// hold more contacts, far buckets shrink to `min_contact`.
pub fn bucket_capacity(distance: u16, bits: u16, k_depth: usize, min_contact: usize) -> usize {
    if bits == 0 {
        return min_contact;
    }

    let per_bit = (k_depth as f64 / bits as f64).round() as usize;
    let capacity = per_bit * bits.saturating_sub(distance) as usize;

    capacity.max(min_contact)
}

/// Ordered contacts at one distance from the local Id, least recently seen first.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        Self::default()
    }

    // === Public Methods ===

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.iter().any(|contact| contact.id() == id)
    }

    // === Private Methods ===

    /// Remove a contact by Id, returns `true` if it was there.
    fn remove(&mut self, id: &Id) -> bool {
        match self.iter().position(|contact| contact.id() == id) {
            Some(index) => {
                self.contacts.remove(index);
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self) {
        if !self.contacts.is_empty() {
            self.contacts.remove(0);
        }
    }
}
