//! Replica writes and key movement between ring neighbors.
//!
//! All pulls are best effort and idempotent: a key is only ever written with
//! the value a neighbor currently holds, so overlapping sweeps are harmless.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{Error, Result};
use crate::RingMember;

use super::node::{RingNode, Successors};

/// A replica write waiting for the replication worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: u64,
    pub data: Vec<u8>,
}

/// Resync requested by a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTask {
    Successor,
    Predecessor,
}

impl RingNode {
    /// Queues a replica write; waits for room when the queue is full.
    pub async fn rep_save(&self, key: u64, data: Vec<u8>) -> Result<()> {
        let entry = Entry { key, data };
        let entry = match self.replication_tx.try_send(entry) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(entry)) => {
                warn!(
                    "Replication queue of {} is full, waiting to enqueue key {}",
                    self.me, key
                );
                entry
            }
            Err(TrySendError::Closed(_)) => {
                return Err(Error::Internal("replication queue closed".into()))
            }
        };
        self.replication_tx
            .send(entry)
            .await
            .map_err(|_| Error::Internal("replication queue closed".into()))
    }

    pub(super) async fn run_replication(self: Arc<Self>, mut queue: mpsc::Receiver<Entry>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            let entry = tokio::select! {
                entry = queue.recv() => entry,
                _ = shutdown.changed() => None,
            };
            let Some(entry) = entry else { break };
            if let Err(err) = self.storage.save(entry.key, &entry.data).await {
                warn!("Node {} failed to store replica {}: {}", self.me, entry.key, err);
            }
        }
        debug!("Replication worker of {} stopped", self.me);
    }

    pub(super) fn request_sync(&self, task: SyncTask) {
        match self.sync_tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Node {} already has resyncs pending, dropping {:?}", self.me, task)
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Node {} cannot schedule {:?} resync", self.me, task)
            }
        }
    }

    pub(super) async fn run_sync(self: Arc<Self>, mut tasks: mpsc::Receiver<SyncTask>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            let task = tokio::select! {
                task = tasks.recv() => task,
                _ = shutdown.changed() => None,
            };
            let Some(task) = task else { break };
            let pulled = match task {
                SyncTask::Successor => self.sync_successor_keys().await,
                SyncTask::Predecessor => self.sync_predecessor_keys().await,
            };
            debug!("Node {} pulled {} keys during {:?} resync", self.me, pulled, task);
        }
        debug!("Sync worker of {} stopped", self.me);
    }

    /// Start of the replica range held for the predecessor: halfway between
    /// the predecessor's predecessor and the predecessor.
    async fn predecessor_replica_start(&self, predecessor: &RingMember) -> Option<u64> {
        match self.transport.predecessor(&predecessor.address).await {
            Ok(Some(pred_of_pred)) => Some(self.ring().midpoint(pred_of_pred.id, predecessor.id)),
            Ok(None) => None,
            Err(err) => {
                warn!("Could not ask {} for its predecessor: {}", predecessor, err);
                None
            }
        }
    }

    /// Coarse sweep over everything this node may now own or replicate:
    /// from halfway before the predecessor to halfway past the successor.
    pub async fn sync_keys(&self) -> usize {
        let Some(predecessor) = self.predecessor().await else {
            return 0;
        };
        let Some(successor) = self.successor().await else {
            return 0;
        };
        let next = self.next_successor().await;
        let ring = self.ring();

        let start = self
            .predecessor_replica_start(&predecessor)
            .await
            .unwrap_or(predecessor.id);
        let end = match next {
            Some(next) if next.address != predecessor.address => {
                ring.midpoint(successor.id, next.id)
            }
            // three members or fewer, or no known next: sweep the whole ring
            _ => ring.add(start, ring.size() - 1),
        };

        let before_predecessor = ring.distance(start, predecessor.id);
        let mut pulled = 0;
        let mut predecessor_alive = true;
        let mut successor_alive = true;
        for key in ring.arc(start, end) {
            let (source, alive) = if ring.distance(start, key) < before_predecessor {
                (&predecessor, &mut predecessor_alive)
            } else {
                (&successor, &mut successor_alive)
            };
            if !*alive {
                continue;
            }
            match self.pull(source, key).await {
                Ok(true) => pulled += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!("Node {} stops pulling from {}: {}", self.me, source, err);
                    *alive = false;
                }
            }
        }
        pulled
    }

    /// Pulls `[self, midpoint(successor, next successor)]` from the successor.
    pub async fn sync_successor_keys(&self) -> usize {
        let Successors {
            successor: Some(successor),
            next: Some(next),
        } = self.successors.read().await.clone()
        else {
            return 0;
        };

        let end = self.ring().midpoint(successor.id, next.id);
        self.pull_range(&successor, self.me.id, end).await
    }

    /// Pulls `[midpoint(pred of pred, predecessor), predecessor)` from the predecessor.
    pub async fn sync_predecessor_keys(&self) -> usize {
        let Some(predecessor) = self.predecessor().await else {
            return 0;
        };
        let Some(start) = self.predecessor_replica_start(&predecessor).await else {
            return 0;
        };

        let ring = self.ring();
        if start == predecessor.id {
            return 0;
        }
        let end = ring.add(predecessor.id, ring.size() - 1);
        self.pull_range(&predecessor, start, end).await
    }

    /// Pushes the replicas held for a failed successor's lower half,
    /// `[self, midpoint(self, failed))`, to the member that now owns it.
    pub async fn hand_over(&self, failed: &RingMember, heir: &RingMember) -> usize {
        let ring = self.ring();
        let split = ring.midpoint(self.me.id, failed.id);
        if split == self.me.id {
            return 0;
        }

        let mut pushed = 0;
        for key in ring.arc(self.me.id, ring.add(split, ring.size() - 1)) {
            let data = match self.storage.read(key).await {
                Ok(data) => data,
                Err(Error::NotFound(_)) => continue,
                Err(err) => {
                    warn!("Node {} cannot read replica {}: {}", self.me, key, err);
                    continue;
                }
            };
            match self.transport.rep_save(&heir.address, key, data).await {
                Ok(()) => pushed += 1,
                Err(err) if err.is_unreachable() => {
                    warn!("Node {} stops handing keys to {}: {}", self.me, heir, err);
                    break;
                }
                Err(err) => debug!("Handing key {} to {} failed: {}", key, heir, err),
            }
        }
        pushed
    }

    async fn pull_range(&self, source: &RingMember, start: u64, end: u64) -> usize {
        let mut pulled = 0;
        for key in self.ring().arc(start, end) {
            match self.pull(source, key).await {
                Ok(true) => pulled += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!("Node {} stops pulling from {}: {}", self.me, source, err);
                    break;
                }
            }
        }
        pulled
    }

    /// Copies the neighbor's value of `key` locally. Only an unreachable
    /// neighbor is an error; anything else is logged and skipped.
    async fn pull(&self, source: &RingMember, key: u64) -> Result<bool> {
        let data = match self.transport.fetch_replica(&source.address, key).await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(false),
            Err(err) if err.is_unreachable() => return Err(err),
            Err(err) => {
                debug!("Pulling key {} from {} failed: {}", key, source, err);
                return Ok(false);
            }
        };
        self.storage.save(key, &data).await?;
        Ok(true)
    }
}
