use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tonic::transport::{Channel, Endpoint};
use tonic::{Response, Status};

use crate::error::{Error, Result};
use crate::rpc::dht::dht_node_client::DhtNodeClient;
use crate::rpc::dht::{
    DeleteRequest, Empty, HandleNewPredecessorRequest, HandleNewSuccessorRequest, Member,
    OwnerRequest, QueryRequest, RepSaveRequest, SaveRequest,
};
use crate::RingMember;

use super::QueryResult;

#[tonic::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn ping(&self, address: &str) -> Result<()>;

    async fn successor(&self, address: &str) -> Result<Option<RingMember>>;

    async fn predecessor(&self, address: &str) -> Result<Option<RingMember>>;

    async fn handle_new_predecessor(&self, address: &str, candidate: &RingMember) -> Result<bool>;

    async fn handle_new_successor(
        &self,
        address: &str,
        candidate: &RingMember,
        next_successor: Option<&RingMember>,
    ) -> Result<bool>;

    async fn owner(&self, address: &str, key: u64, hops: u32) -> Result<RingMember>;

    async fn query(&self, address: &str, key: u64, hops: u32) -> Result<QueryResult>;

    /// Reads the peer's local copy of `key`, bypassing ownership routing.
    async fn fetch_replica(&self, address: &str, key: u64) -> Result<Option<Vec<u8>>>;

    async fn save(&self, address: &str, key: u64, data: Vec<u8>) -> Result<()>;

    async fn delete(&self, address: &str, key: u64) -> Result<()>;

    async fn delete_replica(&self, address: &str, key: u64) -> Result<()>;

    async fn rep_save(&self, address: &str, key: u64, data: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    /// Retries stop once this much time has passed since the first attempt.
    pub max_elapsed: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Each delay is scaled by a random factor in `1 ± randomization`.
    pub randomization: f64,
}

impl RetryPolicy {
    pub fn ping() -> Self {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(5),
            max_elapsed: Duration::ZERO,
            ..Self::data()
        }
    }

    pub fn protocol() -> Self {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(120),
            ..Self::data()
        }
    }

    pub fn data() -> Self {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(10),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            randomization: 0.5,
        }
    }

    /// `Owner`/`Query` sent at hop `hops`. Forwarded hops get no retries and
    /// a deadline that shrinks with depth, so an inner hop gives up on a dead
    /// candidate before its caller gives up on it.
    pub fn forward(hops: u32) -> Self {
        if hops == 0 {
            return Self::data();
        }
        let spent = FORWARD_HOP_BUDGET.saturating_mul(hops);
        RetryPolicy {
            attempt_timeout: Self::data()
                .attempt_timeout
                .saturating_sub(spent)
                .max(MIN_FORWARD_TIMEOUT),
            max_elapsed: Duration::ZERO,
            ..Self::data()
        }
    }
}

const FORWARD_HOP_BUDGET: Duration = Duration::from_millis(500);
const MIN_FORWARD_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    started: Instant,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Backoff {
            policy,
            current: policy.initial_interval,
            started: Instant::now(),
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        let spread = self.current.as_secs_f64() * self.policy.randomization;
        let delay = if spread > 0.0 {
            let low = self.current.as_secs_f64() - spread;
            let high = self.current.as_secs_f64() + spread;
            Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
        } else {
            self.current
        };

        if self.started.elapsed() + delay > self.policy.max_elapsed {
            return None;
        }

        let grown = self.current.as_secs_f64() * self.policy.multiplier;
        self.current = Duration::from_secs_f64(grown).min(self.policy.max_interval);
        Some(delay)
    }
}

pub const MAX_REDIRECTS: u32 = 8;

/// [`Transport`] over tonic, with one lazily connected client per peer.
#[derive(Debug, Default)]
pub struct GrpcTransport {
    clients: RwLock<HashMap<String, DhtNodeClient<Channel>>>,
}

fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_owned()
    } else {
        format!("http://{}", address)
    }
}

impl GrpcTransport {
    pub fn new() -> Self {
        GrpcTransport::default()
    }

    async fn client(&self, address: &str) -> Result<DhtNodeClient<Channel>> {
        if let Some(client) = self.clients.read().await.get(address) {
            return Ok(client.clone());
        }

        let channel = Endpoint::from_shared(endpoint_uri(address))?
            .connect_timeout(Duration::from_secs(5))
            .connect_lazy();
        let client = DhtNodeClient::new(channel);

        let mut clients = self.clients.write().await;
        Ok(clients
            .entry(address.to_owned())
            .or_insert(client)
            .clone())
    }

    async fn call<T, F, Fut>(&self, address: &str, policy: RetryPolicy, mut rpc: F) -> Result<T>
    where
        F: FnMut(DhtNodeClient<Channel>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<T>, Status>>,
    {
        let mut backoff = Backoff::new(policy);
        loop {
            let client = self.client(address).await?;
            let err = match tokio::time::timeout(policy.attempt_timeout, rpc(client)).await {
                Ok(Ok(response)) => return Ok(response.into_inner()),
                Ok(Err(status)) => Error::from_status(address, status),
                Err(_) => Error::Unreachable {
                    address: address.to_owned(),
                    reason: format!("no answer within {:?}", policy.attempt_timeout),
                },
            };

            if !err.is_unreachable() {
                return Err(err);
            }
            match backoff.next_delay() {
                Some(delay) => {
                    debug!("Call to {} failed ({}), retrying in {:?}", address, err, delay);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            }
        }
    }

    /// Streams the value of `key` starting at `address`, following redirects
    /// to the owner. Dropping the receiver stops the transfer.
    pub fn query_stream(
        self: &Arc<Self>,
        address: &str,
        key: u64,
    ) -> mpsc::Receiver<Result<QueryResult>> {
        let (tx, rx) = mpsc::channel(8);
        let transport = self.clone();
        let address = address.to_owned();

        tokio::spawn(async move {
            if let Err(err) = transport.follow_query_stream(&address, key, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });

        rx
    }

    /// Runs the transfer behind [`GrpcTransport::query_stream`] on the current
    /// task. Returns as soon as `tx` is closed.
    pub async fn follow_query_stream(
        &self,
        address: &str,
        key: u64,
        tx: &mpsc::Sender<Result<QueryResult>>,
    ) -> Result<()> {
        let mut target = address.to_owned();
        for _ in 0..=MAX_REDIRECTS {
            if tx.is_closed() {
                return Ok(());
            }
            let mut client = self.client(&target).await?;
            let request = QueryRequest {
                key,
                hops: 0,
                replica: false,
            };
            let mut stream = client
                .query_stream(request)
                .await
                .map_err(|status| Error::from_status(&target, status))?
                .into_inner();

            let mut redirect = None;
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => return Ok(()),
                    message = stream.message() => message,
                };
                let result = match message.map_err(|status| Error::from_status(&target, status))? {
                    Some(response) => QueryResult::from(response),
                    None => break,
                };
                if result.is_redirect_from(&target) {
                    redirect = Some(result.responsible.address);
                    break;
                }
                if tx.send(Ok(result)).await.is_err() {
                    return Ok(());
                }
            }

            match redirect {
                Some(next) => {
                    debug!("Query for key {} redirected from {} to {}", key, target, next);
                    target = next;
                }
                None => return Ok(()),
            }
        }

        warn!("Gave up following redirects for key {}", key);
        Err(Error::HopLimit {
            key,
            hops: MAX_REDIRECTS,
        })
    }

    pub async fn save_stream(&self, address: &str, key: u64, chunks: Vec<Vec<u8>>) -> Result<()> {
        let mut client = self.client(address).await?;
        let requests = chunks
            .into_iter()
            .map(move |data| SaveRequest { key, data });
        client
            .save_stream(tokio_stream::iter(requests))
            .await
            .map_err(|status| Error::from_status(address, status))?;
        Ok(())
    }
}

fn member(member: Option<Member>, address: &str) -> Result<RingMember> {
    member
        .map(RingMember::from)
        .ok_or_else(|| Error::Protocol(format!("{} answered without a member", address)))
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn ping(&self, address: &str) -> Result<()> {
        self.call(address, RetryPolicy::ping(), |mut client| async move {
            client.ping(Empty {}).await
        })
        .await?;
        Ok(())
    }

    async fn successor(&self, address: &str) -> Result<Option<RingMember>> {
        let response = self
            .call(address, RetryPolicy::protocol(), |mut client| async move {
                client.successor(Empty {}).await
            })
            .await?;
        Ok(response.member.map(RingMember::from))
    }

    async fn predecessor(&self, address: &str) -> Result<Option<RingMember>> {
        let response = self
            .call(address, RetryPolicy::protocol(), |mut client| async move {
                client.predecessor(Empty {}).await
            })
            .await?;
        Ok(response.member.map(RingMember::from))
    }

    async fn handle_new_predecessor(&self, address: &str, candidate: &RingMember) -> Result<bool> {
        let request = HandleNewPredecessorRequest {
            candidate: Some(candidate.into()),
        };
        let response = self
            .call(address, RetryPolicy::protocol(), |mut client| {
                let request = request.clone();
                async move { client.handle_new_predecessor(request).await }
            })
            .await?;
        Ok(response.accepted)
    }

    async fn handle_new_successor(
        &self,
        address: &str,
        candidate: &RingMember,
        next_successor: Option<&RingMember>,
    ) -> Result<bool> {
        let request = HandleNewSuccessorRequest {
            candidate: Some(candidate.into()),
            next_successor: next_successor.map(Member::from),
        };
        let response = self
            .call(address, RetryPolicy::protocol(), |mut client| {
                let request = request.clone();
                async move { client.handle_new_successor(request).await }
            })
            .await?;
        Ok(response.accepted)
    }

    async fn owner(&self, address: &str, key: u64, hops: u32) -> Result<RingMember> {
        let response = self
            .call(address, RetryPolicy::forward(hops), |mut client| async move {
                client.owner(OwnerRequest { key, hops }).await
            })
            .await?;
        member(response.owner, address)
    }

    async fn query(&self, address: &str, key: u64, hops: u32) -> Result<QueryResult> {
        let response = self
            .call(address, RetryPolicy::forward(hops), |mut client| async move {
                let request = QueryRequest {
                    key,
                    hops,
                    replica: false,
                };
                client.query(request).await
            })
            .await?;
        Ok(response.into())
    }

    async fn fetch_replica(&self, address: &str, key: u64) -> Result<Option<Vec<u8>>> {
        let response = self
            .call(address, RetryPolicy::data(), |mut client| async move {
                let request = QueryRequest {
                    key,
                    hops: 0,
                    replica: true,
                };
                client.query(request).await
            })
            .await?;
        Ok(QueryResult::from(response).data)
    }

    async fn save(&self, address: &str, key: u64, data: Vec<u8>) -> Result<()> {
        self.call(address, RetryPolicy::data(), |mut client| {
            let request = SaveRequest {
                key,
                data: data.clone(),
            };
            async move { client.save(request).await }
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, address: &str, key: u64) -> Result<()> {
        self.call(address, RetryPolicy::data(), |mut client| async move {
            client.delete(DeleteRequest { key, replica: false }).await
        })
        .await?;
        Ok(())
    }

    async fn delete_replica(&self, address: &str, key: u64) -> Result<()> {
        self.call(address, RetryPolicy::data(), |mut client| async move {
            client.delete(DeleteRequest { key, replica: true }).await
        })
        .await?;
        Ok(())
    }

    async fn rep_save(&self, address: &str, key: u64, data: Vec<u8>) -> Result<()> {
        self.call(address, RetryPolicy::data(), |mut client| {
            let request = RepSaveRequest {
                key,
                data: data.clone(),
            };
            async move { client.rep_save(request).await }
        })
        .await?;
        Ok(())
    }
}
