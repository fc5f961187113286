//! In-process ring for tests.
//!
//! [`LocalNetwork`] implements [`Transport`] by calling straight into the
//! registered [`RingNode`]s, so a whole ring can run inside one runtime.
//! Disconnecting an address makes every later call to it fail as
//! unreachable, which is how tests simulate a crashed node.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::NodeConfig;
use crate::dht::node::RingNode;
use crate::dht::store::{MemoryStore, Storage};
use crate::dht::transport::Transport;
use crate::dht::QueryResult;
use crate::error::{Error, Result};
use crate::RingMember;

/// `config` with every timer set to `period`; `Duration::ZERO` turns them
/// off so a test drives repairs itself.
pub fn timers(mut config: NodeConfig, period: Duration) -> NodeConfig {
    config.check_successor_interval = period;
    config.stabilize_interval = period;
    config.report_interval = period;
    config
}

#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<String, Weak<RingNode>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    pub async fn register(&self, node: &Arc<RingNode>) {
        self.nodes
            .write()
            .await
            .insert(node.member().address.clone(), Arc::downgrade(node));
    }

    /// Drops `address` from the network and stops the node's background tasks.
    pub async fn disconnect(&self, address: &str) {
        if let Some(node) = self.nodes.write().await.remove(address) {
            if let Some(node) = node.upgrade() {
                node.shutdown();
            }
        }
    }

    /// Creates a node with in-memory storage, wired to this network. The
    /// node's timers run as `config` says; see [`timers`].
    pub async fn spawn_node(self: &Arc<Self>, config: NodeConfig, id: u64) -> Arc<RingNode> {
        let member = RingMember::new(id, format!("node-{}", id));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let node = RingNode::new(config, member, storage, self.clone());
        self.register(&node).await;
        node
    }

    async fn node(&self, address: &str) -> Result<Arc<RingNode>> {
        self.nodes
            .read()
            .await
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Unreachable {
                address: address.to_owned(),
                reason: "not connected".into(),
            })
    }
}

#[tonic::async_trait]
impl Transport for LocalNetwork {
    async fn ping(&self, address: &str) -> Result<()> {
        self.node(address).await.map(|_| ())
    }

    async fn successor(&self, address: &str) -> Result<Option<RingMember>> {
        Ok(self.node(address).await?.successor().await)
    }

    async fn predecessor(&self, address: &str) -> Result<Option<RingMember>> {
        Ok(self.node(address).await?.predecessor().await)
    }

    async fn handle_new_predecessor(&self, address: &str, candidate: &RingMember) -> Result<bool> {
        self.node(address)
            .await?
            .handle_new_predecessor(candidate.clone())
            .await
    }

    async fn handle_new_successor(
        &self,
        address: &str,
        candidate: &RingMember,
        next_successor: Option<&RingMember>,
    ) -> Result<bool> {
        self.node(address)
            .await?
            .handle_new_successor(candidate.clone(), next_successor.cloned())
            .await
    }

    async fn owner(&self, address: &str, key: u64, hops: u32) -> Result<RingMember> {
        self.node(address).await?.owner(key, hops).await
    }

    async fn query(&self, address: &str, key: u64, hops: u32) -> Result<QueryResult> {
        self.node(address).await?.query(key, hops).await
    }

    async fn fetch_replica(&self, address: &str, key: u64) -> Result<Option<Vec<u8>>> {
        self.node(address).await?.read_replica(key).await
    }

    async fn save(&self, address: &str, key: u64, data: Vec<u8>) -> Result<()> {
        self.node(address).await?.save(key, data).await
    }

    async fn delete(&self, address: &str, key: u64) -> Result<()> {
        self.node(address).await?.delete(key).await
    }

    async fn delete_replica(&self, address: &str, key: u64) -> Result<()> {
        self.node(address).await?.delete_replica(key).await
    }

    async fn rep_save(&self, address: &str, key: u64, data: Vec<u8>) -> Result<()> {
        self.node(address).await?.rep_save(key, data).await
    }
}
