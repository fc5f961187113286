//! The ring node and its collaborators.
//!
//! [`node::RingNode`] holds the membership state machine; `routing`,
//! `stabilize` and `migration` extend it with ownership resolution, finger
//! refresh and key movement. [`transport`] and [`store`] are the network and
//! storage seams, [`service`] exposes a node over gRPC.

pub mod fingers;
pub mod migration;
pub mod node;
pub mod routing;
pub mod service;
pub mod stabilize;
pub mod store;
pub mod transport;

use crate::RingMember;

/// Answer to a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// `None` when the key is absent, or when the result is a redirect.
    pub data: Option<Vec<u8>>,
    /// The owner that answered, or the node to ask next.
    pub responsible: RingMember,
}

impl QueryResult {
    pub fn found(data: Vec<u8>, responsible: RingMember) -> Self {
        QueryResult {
            data: Some(data),
            responsible,
        }
    }

    pub fn missing(responsible: RingMember) -> Self {
        QueryResult {
            data: None,
            responsible,
        }
    }

    /// An empty answer naming a node other than the one that was asked.
    pub fn is_redirect_from(&self, asked: &str) -> bool {
        self.data.is_none() && self.responsible.address != asked
    }
}
