//! Persist and restore a node's identity, routing table and store.
//!
//! Layout under the storage root:
//!
//! ```text
//! node.json                       last identity, resumed on restart
//! <id>/node.json                  {"id": "<hex>", "port": <port>, "ip": "<ipv4>"}
//! <id>/kbuckets.json              {"<distance>": [["<hex id>", "<ipv4>", <port>], ...]}
//! <id>/store.json                 {"<hex key>": "<value>"}
//! <id>/store_expiry.json          {"<hex key>": <unix epoch milliseconds>}
//! ```
//!
//! Every file is optional. Loading never fails, unreadable state is logged and skipped.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::{validate_value, Contact, Id, RoutingTable};
use crate::Result;

use super::store::Store;

const IDENTITY_FILE: &str = "node.json";
const KBUCKETS_FILE: &str = "kbuckets.json";
const STORE_FILE: &str = "store.json";
const STORE_EXPIRY_FILE: &str = "store_expiry.json";

type KBucketsRecord = BTreeMap<u16, Vec<(Id, Ipv4Addr, u16)>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Who this node is and where it listens.
pub struct Identity {
    pub id: Id,
    pub port: u16,
    pub ip: Ipv4Addr,
}

impl Identity {
    pub fn new(id: Id, address: SocketAddrV4) -> Self {
        Identity {
            id,
            port: address.port(),
            ip: *address.ip(),
        }
    }
}

#[derive(Debug, Clone)]
/// Snapshots of nodes' state under a storage root.
pub struct Snapshot {
    root: PathBuf,
}

impl Snapshot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Snapshot { root: root.into() }
    }

    // === Getters ===

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the state of the node with this Id.
    pub fn node_dir(&self, id: &Id) -> PathBuf {
        self.root.join(id.to_string())
    }

    // === Loading ===

    /// The last identity saved under this root, if it has `id_length` bytes.
    pub fn last_identity(&self, id_length: usize) -> Option<Identity> {
        let identity: Identity = read_json(&self.root.join(IDENTITY_FILE))?;

        if identity.id.len() != id_length {
            warn!(
                id = %identity.id,
                id_length,
                "Ignoring persisted identity with a different Id length"
            );
            return None;
        }

        Some(identity)
    }

    /// Register persisted contacts into `table`, returns how many were loaded.
    pub fn load_routing_table(&self, table: &mut RoutingTable) -> usize {
        let path = self.node_dir(table.id()).join(KBUCKETS_FILE);
        let Some(record) = read_json::<KBucketsRecord>(&path) else {
            return 0;
        };

        let id_length = table.id().len();
        let mut count = 0;

        for (id, ip, port) in record.into_values().flatten() {
            if id.len() != id_length || port == 0 {
                continue;
            }

            table.register_contact(Contact::new(id, SocketAddrV4::new(ip, port)));
            count += 1;
        }

        count
    }

    /// Restore persisted entries of the node `id` into `store`, skipping expired ones.
    ///
    /// Entries without a persisted expiry get a fresh one.
    pub fn load_store(&self, id: &Id, store: &mut Store) -> usize {
        let dir = self.node_dir(id);

        let Some(values) = read_json::<BTreeMap<Id, String>>(&dir.join(STORE_FILE)) else {
            return 0;
        };
        let expiries: BTreeMap<Id, u64> =
            read_json(&dir.join(STORE_EXPIRY_FILE)).unwrap_or_default();

        let now = SystemTime::now();
        let mut count = 0;

        for (key, value) in values {
            if key.len() != id.len() {
                continue;
            }
            if validate_value(&value).is_err() {
                debug!(%key, ?value, "Skipping invalid stored value");
                continue;
            }

            match expiries.get(&key) {
                Some(millis) => {
                    let expires_at = UNIX_EPOCH + Duration::from_millis(*millis);
                    if expires_at <= now {
                        continue;
                    }
                    store.restore(key, value, expires_at);
                }
                None => {
                    store.put(key, value);
                }
            }

            count += 1;
        }

        count
    }

    // === Saving ===

    /// Write the identity, both as the last identity and in its node directory.
    pub fn save_identity(&self, identity: &Identity) -> Result<()> {
        let dir = self.node_dir(&identity.id);
        fs::create_dir_all(&dir)?;

        write_json(&dir.join(IDENTITY_FILE), identity)?;
        write_json(&self.root.join(IDENTITY_FILE), identity)
    }

    pub fn save_routing_table(&self, table: &RoutingTable) -> Result<()> {
        let dir = self.node_dir(table.id());
        fs::create_dir_all(&dir)?;

        let record: KBucketsRecord = table
            .buckets()
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(distance, bucket)| {
                let contacts = bucket
                    .iter()
                    .map(|contact| (contact.id().clone(), contact.ip(), contact.port()))
                    .collect();

                (*distance, contacts)
            })
            .collect();

        write_json(&dir.join(KBUCKETS_FILE), &record)
    }

    /// Write the live entries of the node `id`'s store and their expiry times.
    pub fn save_store(&self, id: &Id, store: &Store) -> Result<()> {
        let dir = self.node_dir(id);
        fs::create_dir_all(&dir)?;

        let mut values = BTreeMap::new();
        let mut expiries = BTreeMap::new();

        for (key, value, expires_at) in store.live_entries() {
            let millis = expires_at
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_millis() as u64)
                .unwrap_or(0);

            values.insert(key.clone(), value.to_string());
            expiries.insert(key.clone(), millis);
        }

        write_json(&dir.join(STORE_FILE), &values)?;
        write_json(&dir.join(STORE_EXPIRY_FILE), &expiries)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!(?path, "No snapshot to load");
            return None;
        }
        Err(error) => {
            warn!(?path, ?error, "Failed to read snapshot");
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(?path, ?error, "Ignoring corrupt snapshot");
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;

    Ok(())
}
