use std::{fmt::Debug, net::Ipv4Addr, path::PathBuf, time::Duration};

use crate::common::{Contact, Id, DEFAULT_ID_LENGTH, DEFAULT_K_DEPTH, DEFAULT_MIN_CONTACT};

use super::socket::DEFAULT_POLL_INTERVAL;
use super::store::{DEFAULT_EXPIRY_UNIT, DEFAULT_MAX_EXPIRY};

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// Explicit node Id.
    ///
    /// Defaults to None, where the identity persisted in [Config::storage] is resumed
    /// if any, otherwise a random Id is generated.
    pub id: Option<Id>,
    /// Length of Ids and keys in bytes.
    ///
    /// Defaults to [DEFAULT_ID_LENGTH]
    pub id_length: usize,
    /// Ipv4 address to listen on and to advertise in every message.
    ///
    /// Defaults to `127.0.0.1`
    pub ip: Ipv4Addr,
    /// Explicit port to listen on.
    ///
    /// Falls back to a random port if it is already in use.
    ///
    /// Defaults to None
    pub port: Option<u16>,
    /// Maximum occupancy of the closest k-bucket, also the iteration bound of lookups
    /// and the replication fan-out.
    ///
    /// Defaults to [DEFAULT_K_DEPTH]
    pub k_depth: usize,
    /// Minimum capacity of any k-bucket.
    ///
    /// Defaults to [DEFAULT_MIN_CONTACT]
    pub min_contact: usize,
    /// Announced topics closer than this distance are pulled into this node.
    ///
    /// Defaults to None, meaning `id_length * 8`: every topic is of interest.
    pub interest_radius: Option<u16>,
    /// Expiry, in [Config::expiry_unit]s, of a stored key at distance 0.
    ///
    /// Farther keys expire sooner, down to a single unit.
    ///
    /// Defaults to [DEFAULT_MAX_EXPIRY]
    pub max_expiry: u64,
    /// Duration of one expiry unit.
    ///
    /// Defaults to [DEFAULT_EXPIRY_UNIT]
    pub expiry_unit: Duration,
    /// How long the listener blocks waiting for a datagram before checking
    /// for commands and shutdown.
    ///
    /// Defaults to [DEFAULT_POLL_INTERVAL]
    pub poll_interval: Duration,
    /// Root directory of persisted state, one sub directory per node Id.
    ///
    /// Defaults to None, where nothing is persisted.
    pub storage: Option<PathBuf>,
    /// Whom to answer pings from.
    ///
    /// Defaults to [AnswerPing::Always]
    pub answer_ping: AnswerPing,
    /// Decides whether a contact is trusted, see [AnswerPing::Trusted].
    ///
    /// Defaults to a filter that trusts nobody.
    pub trust: Box<dyn TrustFilter>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            id_length: DEFAULT_ID_LENGTH,
            ip: Ipv4Addr::LOCALHOST,
            port: None,
            k_depth: DEFAULT_K_DEPTH,
            min_contact: DEFAULT_MIN_CONTACT,
            interest_radius: None,
            max_expiry: DEFAULT_MAX_EXPIRY,
            expiry_unit: DEFAULT_EXPIRY_UNIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            storage: None,
            answer_ping: AnswerPing::Always,
            trust: Box::new(TrustNobody),
        }
    }
}

impl Config {
    pub(crate) fn interest_radius(&self) -> u16 {
        self.interest_radius
            .unwrap_or((self.id_length * 8) as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Policy for answering incoming PING requests.
pub enum AnswerPing {
    Never,
    /// Only answer contacts accepted by [Config::trust].
    Trusted,
    Always,
}

/// A hook to decide whether a peer is trusted.
///
/// Kadnode does not implement any trust model, this is where one plugs in.
pub trait TrustFilter: Send + Sync + Debug {
    /// Returns true if this contact is trusted.
    fn is_trusted(&self, contact: &Contact) -> bool;
}

#[derive(Debug, Clone)]
struct TrustNobody;

impl TrustFilter for TrustNobody {
    fn is_trusted(&self, _contact: &Contact) -> bool {
        false
    }
}
