pub mod config;
pub mod error;
pub mod hash;
pub mod logging;
pub mod ring;

pub mod rpc;

pub mod dht;
pub mod testing;

use std::fmt;

/// A ring member as exchanged between nodes: its position and its endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RingMember {
    pub id: u64,
    pub address: String,
}

impl RingMember {
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        RingMember {
            id,
            address: address.into(),
        }
    }
}

impl fmt::Display for RingMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.id, self.address)
    }
}
