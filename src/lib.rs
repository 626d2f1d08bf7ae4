#![doc = include_str!("../README.md")]

// Public modules
mod common;

mod dht;
mod error;
pub mod rpc;

pub use crate::common::{
    bucket_capacity, distance, validate_value, Contact, DecodeError, Id, KBucket, Message,
    MessageType, RoutingTable,
};
pub use dht::{Dht, DhtBuilder, LookupResponse, Testnet};
pub use rpc::{Config, LookupEvent, Target};

pub use error::Error;

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
