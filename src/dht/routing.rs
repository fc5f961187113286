use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::RingMember;

use super::node::RingNode;
use super::QueryResult;

impl RingNode {
    /// Known peers ordered by how close they sit after `key`: the first one is
    /// the best guess for the owner under the `[predecessor, self)` rule.
    async fn candidates(&self, key: u64) -> Vec<RingMember> {
        let mut candidates: Vec<RingMember> = Vec::new();
        candidates.extend(self.successor().await);
        candidates.extend(self.fingers.read().await.members().cloned());
        candidates.extend(self.predecessor().await);

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| !self.is_me(c) && seen.insert(c.address.clone()));

        let ring = self.ring();
        candidates.sort_by_key(|c| ring.distance(key, c.id));
        candidates
    }

    fn check_hops(&self, key: u64, hops: u32) -> Result<()> {
        if hops >= self.config.max_hops {
            warn!("Node {} stops forwarding key {} after {} hops", self.me, key, hops);
            return Err(Error::HopLimit { key, hops });
        }
        Ok(())
    }

    /// Resolves the node responsible for `key`, forwarding through the
    /// closest known candidate. Unreachable candidates are skipped.
    pub async fn owner(&self, key: u64, hops: u32) -> Result<RingMember> {
        if self.owns(key).await {
            return Ok(self.me.clone());
        }
        self.check_hops(key, hops)?;

        for candidate in self.candidates(key).await {
            debug!("Node {} forwards owner({}) to {}", self.me, key, candidate);
            match self.transport.owner(&candidate.address, key, hops + 1).await {
                Ok(owner) => return Ok(owner),
                Err(err) if err.is_unreachable() => {
                    warn!("Skipping unreachable candidate {}: {}", candidate, err)
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::RoutingDeadEnd(key))
    }

    pub async fn query(&self, key: u64, hops: u32) -> Result<QueryResult> {
        if self.owns(key).await {
            return self.query_local(key).await;
        }
        self.check_hops(key, hops)?;

        for candidate in self.candidates(key).await {
            debug!("Node {} forwards query({}) to {}", self.me, key, candidate);
            match self.transport.query(&candidate.address, key, hops + 1).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_unreachable() => {
                    warn!("Skipping unreachable candidate {}: {}", candidate, err)
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::RoutingDeadEnd(key))
    }

    async fn query_local(&self, key: u64) -> Result<QueryResult> {
        match self.storage.read(key).await {
            Ok(data) => Ok(QueryResult::found(data, self.me.clone())),
            Err(Error::NotFound(_)) => {
                debug!("Key {} not found on owner {}", key, self.me);
                Ok(QueryResult::missing(self.me.clone()))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn read_replica(&self, key: u64) -> Result<Option<Vec<u8>>> {
        match self.storage.read(key).await {
            Ok(data) => Ok(Some(data)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Streaming read: chunks of the value when owned here, otherwise a
    /// single redirect naming the owner. Dropping the receiver stops the read.
    pub async fn query_stream(&self, key: u64) -> Result<mpsc::Receiver<Result<QueryResult>>> {
        if !self.owns(key).await {
            let owner = self.owner(key, 0).await?;
            return Ok(single(QueryResult::missing(owner)));
        }

        let mut chunks = match self.storage.read_chunks(key).await {
            Ok(chunks) => chunks,
            Err(Error::NotFound(_)) => return Ok(single(QueryResult::missing(self.me.clone()))),
            Err(err) => return Err(err),
        };

        let (tx, rx) = mpsc::channel(4);
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                let result = chunk.map(|data| QueryResult::found(data, me.clone()));
                if tx.send(result).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// The neighbor holding the replica of an owned key: the successor for
    /// the clockwise half of `[predecessor, self)`, the predecessor otherwise.
    pub async fn replica_target(&self, key: u64) -> Option<RingMember> {
        let predecessor = self.predecessor().await?;
        let ring = self.ring();
        let split = ring.midpoint(predecessor.id, self.me.id);

        let target = if ring.distance(predecessor.id, key) >= ring.distance(predecessor.id, split) {
            self.successor().await?
        } else {
            predecessor
        };
        (!self.is_me(&target)).then_some(target)
    }

    pub async fn save(&self, key: u64, data: Vec<u8>) -> Result<()> {
        if !self.owns(key).await {
            let owner = self.owner(key, 0).await?;
            if !self.is_me(&owner) {
                debug!("Node {} forwards save({}) to {}", self.me, key, owner);
                return self.transport.save(&owner.address, key, data).await;
            }
        }

        self.storage.save(key, &data).await?;
        if let Some(target) = self.replica_target(key).await {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(err) = transport.rep_save(&target.address, key, data).await {
                    warn!("Replicating key {} to {} failed: {}", key, target, err);
                }
            });
        }
        Ok(())
    }

    pub async fn delete(&self, key: u64) -> Result<()> {
        if !self.owns(key).await {
            let owner = self.owner(key, 0).await?;
            if !self.is_me(&owner) {
                debug!("Node {} forwards delete({}) to {}", self.me, key, owner);
                return self.transport.delete(&owner.address, key).await;
            }
        }

        self.storage.delete(key).await?;
        if let Some(target) = self.replica_target(key).await {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(err) = transport.delete_replica(&target.address, key).await {
                    warn!("Deleting replica {} on {} failed: {}", key, target, err);
                }
            });
        }
        Ok(())
    }

    /// Removes the local copy only; replica deletes are never forwarded.
    pub async fn delete_replica(&self, key: u64) -> Result<()> {
        self.storage.delete(key).await
    }
}

fn single(result: QueryResult) -> mpsc::Receiver<Result<QueryResult>> {
    let (tx, rx) = mpsc::channel(1);
    // fresh channel with room for one
    let _ = tx.try_send(Ok(result));
    rx
}
