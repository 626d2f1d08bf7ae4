//! Kademlia node Id, also used as the key of stored values.
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// Default length of node Ids in bytes.
pub const DEFAULT_ID_LENGTH: usize = 4;
/// Longest Id whose length in bits still fits a distance.
pub const MAX_ID_LENGTH: usize = (u16::MAX / 8) as usize;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Kademlia node Id or a lookup target.
///
/// Ids are fixed-length big-endian byte strings, rendered as lowercase hex.
/// The length is configured per node, every Id a node handles has that length.
pub struct Id(Box<[u8]>);

impl Id {
    /// Generate a random Id of `length` bytes.
    pub fn random(length: usize) -> Id {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..length).map(|_| rng.gen()).collect();

        Id(bytes.into())
    }

    /// Create a new Id from some bytes.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.is_empty() {
            return Err(Error::InvalidId("empty".to_string()));
        }

        Ok(Id(bytes.into()))
    }

    /// Parse a hex Id and check that it is exactly `length` bytes long.
    pub fn parse(hex: &str, length: usize) -> Result<Id> {
        let id = Id::from_str(hex)?;

        if id.len() != length {
            return Err(Error::IdLengthMismatch {
                expected: length,
                got: id.len(),
            });
        }

        Ok(id)
    }

    /// Length of this Id in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length of this Id in bits, which is also the maximum distance from it.
    pub fn bits(&self) -> u16 {
        (self.0.len() * 8) as u16
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the bit length of the XOR result, `bits - leading_zeros`,
    /// so Ids sharing a longer common prefix are closer.
    ///
    /// Distance to self is 0
    /// Distance to an Id differing in the first bit is `bits`
    /// Distance to an Id with 5 leading matching bits is `bits - 5`
    ///
    /// Ids of different lengths are compared as if the shorter one was left-padded with zeros.
    pub fn distance(&self, other: &Id) -> u16 {
        let length = self.len().max(other.len());
        let max_distance = (length * 8) as u16;

        for i in 0..length {
            let a = padded_byte(&self.0, length, i);
            let b = padded_byte(&other.0, length, i);

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u16;

                return max_distance - leading_zeros;
            }
        }

        0
    }
}

/// Distance between two Ids, see [Id::distance].
pub fn distance(a: &Id, b: &Id) -> u16 {
    a.distance(b)
}

fn padded_byte(bytes: &[u8], length: usize, index: usize) -> u8 {
    let offset = length - bytes.len();

    if index < offset {
        0
    } else {
        bytes[index - offset]
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidId(s.to_string()))?;

        Id::from_bytes(bytes).map_err(|_| Error::InvalidId(s.to_string()))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Id, D::Error> {
        let s = String::deserialize(deserializer)?;

        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}
