use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::ring::Ring;
use crate::RingMember;

use super::fingers::FingerTable;
use super::migration::{Entry, SyncTask};
use super::store::Storage;
use super::transport::Transport;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Successors {
    pub successor: Option<RingMember>,
    pub next: Option<RingMember>,
}

struct Workers {
    replication_rx: mpsc::Receiver<Entry>,
    sync_rx: mpsc::Receiver<SyncTask>,
}

// No guard on predecessor, successors or fingers is held across a remote call.
pub struct RingNode {
    pub(super) me: RingMember,
    pub(super) config: NodeConfig,
    pub(super) predecessor: RwLock<Option<RingMember>>,
    pub(super) successors: RwLock<Successors>,
    pub(super) fingers: RwLock<FingerTable>,
    pub(super) storage: Arc<dyn Storage>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) replication_tx: mpsc::Sender<Entry>,
    pub(super) sync_tx: mpsc::Sender<SyncTask>,
    workers: Mutex<Option<Workers>>,
    shutdown: watch::Sender<bool>,
}

impl RingNode {
    pub fn new(
        config: NodeConfig,
        me: RingMember,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (replication_tx, replication_rx) = mpsc::channel(config.replication_capacity.max(1));
        let (sync_tx, sync_rx) = mpsc::channel(config.sync_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let fingers = FingerTable::new(config.ring.bits());

        Arc::new(RingNode {
            me,
            config,
            predecessor: RwLock::new(None),
            successors: RwLock::new(Successors::default()),
            fingers: RwLock::new(fingers),
            storage,
            transport,
            replication_tx,
            sync_tx,
            workers: Mutex::new(Some(Workers {
                replication_rx,
                sync_rx,
            })),
            shutdown,
        })
    }

    pub fn id(&self) -> u64 {
        self.me.id
    }

    pub fn member(&self) -> &RingMember {
        &self.me
    }

    pub fn ring(&self) -> Ring {
        self.config.ring
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn predecessor(&self) -> Option<RingMember> {
        self.predecessor.read().await.clone()
    }

    pub async fn successor(&self) -> Option<RingMember> {
        self.successors.read().await.successor.clone()
    }

    pub async fn next_successor(&self) -> Option<RingMember> {
        self.successors.read().await.next.clone()
    }

    pub async fn finger_table(&self) -> Vec<Option<RingMember>> {
        let mut table = vec![self.successor().await];
        table.extend(self.fingers.read().await.entries().iter().cloned());
        table
    }

    /// Whether `key` falls in `[predecessor, self)`; a node without a
    /// predecessor owns the whole ring.
    pub async fn owns(&self, key: u64) -> bool {
        match self.predecessor.read().await.as_ref() {
            Some(predecessor) => self.ring().in_range(key, predecessor.id, self.me.id),
            None => true,
        }
    }

    pub(super) fn is_me(&self, member: &RingMember) -> bool {
        member.address == self.me.address
    }

    pub async fn start(self: &Arc<Self>, bootstrap: &RingMember) -> Result<()> {
        let workers = self
            .workers
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal(format!("node {} already started", self.me)))?;

        if self.is_me(bootstrap) {
            info!("Node {} starts a new ring", self.me);
        } else {
            self.join(bootstrap).await?;
        }

        tokio::spawn(self.clone().run_replication(workers.replication_rx));
        tokio::spawn(self.clone().run_sync(workers.sync_rx));

        let intervals = [
            (self.config.check_successor_interval, Timer::CheckSuccessor),
            (self.config.stabilize_interval, Timer::Stabilize),
            (self.config.report_interval, Timer::Report),
        ];
        for (period, timer) in intervals {
            self.spawn_periodic(period, move |node| async move {
                match timer {
                    Timer::CheckSuccessor => {
                        if let Err(err) = node.check_successor().await {
                            warn!("Successor check on {} failed: {}", node.me, err);
                        }
                    }
                    Timer::Stabilize => node.stabilize().await,
                    Timer::Report => node.log_state().await,
                }
            });
        }

        self.log_state().await;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(super) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, tick: F)
    where
        F: Fn(Arc<RingNode>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return;
        }
        let node = self.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(node.clone()).await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    pub async fn join(&self, partner: &RingMember) -> Result<()> {
        info!("Node {} joining through {}", self.me, partner);

        let successor = self.transport.owner(&partner.address, self.me.id, 0).await?;
        if self.is_me(&successor) {
            return Err(Error::Protocol(format!(
                "{} resolved our own id to us",
                partner
            )));
        }

        let (next, predecessor) = match self.transport.successor(&successor.address).await? {
            // a ring of one: the sole member is both our successor and predecessor
            None => (None, successor.clone()),
            Some(next) => {
                let predecessor = self
                    .transport
                    .predecessor(&successor.address)
                    .await?
                    .ok_or_else(|| {
                        Error::Protocol(format!("{} has a successor but no predecessor", successor))
                    })?;
                (Some(next).filter(|n| !self.is_me(n)), predecessor)
            }
        };

        *self.successors.write().await = Successors {
            successor: Some(successor.clone()),
            next,
        };
        *self.predecessor.write().await = Some(predecessor.clone());

        self.refresh_fingers().await;

        if !self
            .transport
            .handle_new_predecessor(&successor.address, &self.me)
            .await?
        {
            return Err(Error::Protocol(format!(
                "{} did not accept {} as predecessor",
                successor, self.me
            )));
        }
        if !self
            .transport
            .handle_new_successor(&predecessor.address, &self.me, Some(&successor))
            .await?
        {
            return Err(Error::Protocol(format!(
                "{} did not accept {} as successor",
                predecessor, self.me
            )));
        }

        info!(
            "Node {} joined between {} and {}",
            self.me, predecessor, successor
        );
        let pulled = self.sync_keys().await;
        debug!("Node {} pulled {} keys after joining", self.me, pulled);
        Ok(())
    }

    pub async fn check_successor(&self) -> Result<()> {
        let Successors { successor, next } = self.successors.read().await.clone();
        let Some(successor) = successor else {
            return Ok(());
        };

        match self.transport.ping(&successor.address).await {
            Ok(()) => {
                self.refresh_next_successor(&successor).await;
                return Ok(());
            }
            Err(err) => warn!("Successor {} of {} failed: {}", successor, self.me, err),
        }

        let Some(next) = next else {
            warn!("Node {} has no next successor to fail over to", self.me);
            return Ok(());
        };

        if !self
            .transport
            .handle_new_predecessor(&next.address, &self.me)
            .await?
        {
            return Err(Error::Protocol(format!(
                "{} refused {} as predecessor",
                next, self.me
            )));
        }

        let next_next = match self.transport.successor(&next.address).await {
            Ok(member) => member.filter(|m| !self.is_me(m) && m.address != next.address),
            Err(err) => {
                warn!("Could not ask {} for its successor: {}", next, err);
                None
            }
        };

        *self.successors.write().await = Successors {
            successor: Some(next.clone()),
            next: next_next,
        };
        let moved = self.fingers.write().await.replace(&successor, &next);
        info!(
            "Node {} replaced failed successor {} with {} ({} fingers moved)",
            self.me, successor, next, moved
        );

        let pushed = self.hand_over(&successor, &next).await;
        let pulled = self.sync_keys().await;
        debug!(
            "Node {} handed {} keys to {} and pulled {} after failover",
            self.me, pushed, next, pulled
        );
        Ok(())
    }

    async fn refresh_next_successor(&self, successor: &RingMember) {
        let next = match self.transport.successor(&successor.address).await {
            Ok(next) => next.filter(|n| !self.is_me(n) && n.address != successor.address),
            Err(err) => {
                debug!("Could not refresh next successor from {}: {}", successor, err);
                return;
            }
        };

        let mut successors = self.successors.write().await;
        // the successor may have moved while we were asking
        if successors.successor.as_ref() == Some(successor) {
            successors.next = next;
        }
    }

    pub async fn handle_new_successor(
        &self,
        candidate: RingMember,
        next: Option<RingMember>,
    ) -> Result<bool> {
        if self.is_me(&candidate) {
            return Ok(false);
        }

        let current = self.successor().await;
        if let Some(current) = current {
            let ring = self.ring();
            if current != candidate
                && ring.distance(self.me.id, candidate.id) > ring.distance(self.me.id, current.id)
                && self.transport.ping(&current.address).await.is_ok()
            {
                warn!(
                    "Node {} rejects successor {}: {} is closer and alive",
                    self.me, candidate, current
                );
                return Ok(false);
            }
        }

        {
            let mut successors = self.successors.write().await;
            successors.successor = Some(candidate.clone());
            if let Some(next) = next.filter(|n| !self.is_me(n) && n.address != candidate.address) {
                successors.next = Some(next);
            }
        }
        info!("Node {} accepted successor {}", self.me, candidate);

        self.request_sync(SyncTask::Successor);
        Ok(true)
    }

    pub async fn handle_new_predecessor(&self, candidate: RingMember) -> Result<bool> {
        if self.is_me(&candidate) {
            return Ok(false);
        }

        let current = self.predecessor().await;
        if let Some(current) = current {
            let ring = self.ring();
            if current != candidate
                && ring.distance(self.me.id, candidate.id) < ring.distance(self.me.id, current.id)
                && self.transport.ping(&current.address).await.is_ok()
            {
                warn!(
                    "Node {} rejects predecessor {}: {} is closer and alive",
                    self.me, candidate, current
                );
                return Ok(false);
            }
        }

        *self.predecessor.write().await = Some(candidate.clone());
        info!("Node {} accepted predecessor {}", self.me, candidate);

        self.request_sync(SyncTask::Predecessor);
        Ok(true)
    }

    pub async fn log_state(&self) {
        let describe = |member: &Option<RingMember>| match member {
            Some(member) => member.to_string(),
            None => "-".to_owned(),
        };
        let fingers: Vec<String> = self.finger_table().await.iter().map(describe).collect();
        info!(
            "State of {}: successor {}, predecessor {}, next successor {}, fingers [{}]",
            self.me,
            describe(&self.successor().await),
            describe(&self.predecessor().await),
            describe(&self.next_successor().await),
            fingers.join(", ")
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    CheckSuccessor,
    Stabilize,
    Report,
}
