use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use log::debug;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};

use crate::rpc::dht::dht_node_server::DhtNode;
use crate::rpc::dht::{
    AcceptResponse, DeleteRequest, Empty, HandleNewPredecessorRequest, HandleNewSuccessorRequest,
    NeighborResponse, OwnerRequest, OwnerResponse, QueryRequest, QueryResponse, RepSaveRequest,
    SaveRequest,
};
use crate::RingMember;

use super::node::RingNode;
use super::QueryResult;

/// gRPC front of a [`RingNode`]. Handlers only decode, dispatch and encode.
#[derive(Clone)]
pub struct DhtNodeService {
    node: Arc<RingNode>,
}

impl DhtNodeService {
    pub fn new(node: Arc<RingNode>) -> Self {
        DhtNodeService { node }
    }
}

fn candidate(member: Option<crate::rpc::dht::Member>) -> Result<RingMember, Status> {
    member
        .map(RingMember::from)
        .ok_or_else(|| Status::invalid_argument("missing candidate"))
}

#[tonic::async_trait]
impl DhtNode for DhtNodeService {
    type QueryStreamStream =
        Pin<Box<dyn Stream<Item = Result<QueryResponse, Status>> + Send + 'static>>;

    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }

    async fn successor(&self, _request: Request<Empty>) -> Result<Response<NeighborResponse>, Status> {
        let member = self.node.successor().await.map(Into::into);
        Ok(Response::new(NeighborResponse { member }))
    }

    async fn predecessor(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<NeighborResponse>, Status> {
        let member = self.node.predecessor().await.map(Into::into);
        Ok(Response::new(NeighborResponse { member }))
    }

    async fn handle_new_predecessor(
        &self,
        request: Request<HandleNewPredecessorRequest>,
    ) -> Result<Response<AcceptResponse>, Status> {
        let candidate = candidate(request.into_inner().candidate)?;
        debug!("{} offered as predecessor of {}", candidate, self.node.member());
        let accepted = self.node.handle_new_predecessor(candidate).await?;
        Ok(Response::new(AcceptResponse { accepted }))
    }

    async fn handle_new_successor(
        &self,
        request: Request<HandleNewSuccessorRequest>,
    ) -> Result<Response<AcceptResponse>, Status> {
        let request = request.into_inner();
        let candidate = candidate(request.candidate)?;
        let next = request.next_successor.map(RingMember::from);
        debug!("{} offered as successor of {}", candidate, self.node.member());
        let accepted = self.node.handle_new_successor(candidate, next).await?;
        Ok(Response::new(AcceptResponse { accepted }))
    }

    async fn owner(&self, request: Request<OwnerRequest>) -> Result<Response<OwnerResponse>, Status> {
        let OwnerRequest { key, hops } = request.into_inner();
        let owner = self.node.owner(key, hops).await?;
        Ok(Response::new(OwnerResponse {
            owner: Some(owner.into()),
        }))
    }

    async fn query(&self, request: Request<QueryRequest>) -> Result<Response<QueryResponse>, Status> {
        let QueryRequest { key, hops, replica } = request.into_inner();
        let result = if replica {
            let me = self.node.member().clone();
            match self.node.read_replica(key).await? {
                Some(data) => QueryResult::found(data, me),
                None => QueryResult::missing(me),
            }
        } else {
            self.node.query(key, hops).await?
        };
        Ok(Response::new(result.into()))
    }

    async fn query_stream(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<Self::QueryStreamStream>, Status> {
        let key = request.into_inner().key;
        debug!("Streaming key {} from {}", key, self.node.member());
        let results = self.node.query_stream(key).await?;
        let stream = ReceiverStream::new(results).map(|result| {
            result
                .map(QueryResponse::from)
                .map_err(Status::from)
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn save(&self, request: Request<SaveRequest>) -> Result<Response<Empty>, Status> {
        let SaveRequest { key, data } = request.into_inner();
        self.node.save(key, data).await?;
        Ok(Response::new(Empty {}))
    }

    async fn save_stream(
        &self,
        request: Request<Streaming<SaveRequest>>,
    ) -> Result<Response<Empty>, Status> {
        let mut chunks = request.into_inner();
        let mut key = None;
        let mut data = Vec::new();
        while let Some(chunk) = chunks.message().await? {
            match key {
                None => key = Some(chunk.key),
                Some(key) if key != chunk.key => {
                    return Err(Status::invalid_argument("chunks for different keys"))
                }
                Some(_) => {}
            }
            data.extend_from_slice(&chunk.data);
        }

        let key = key.ok_or_else(|| Status::invalid_argument("empty save stream"))?;
        debug!("Received {} bytes for key {} over a stream", data.len(), key);
        self.node.save(key, data).await?;
        Ok(Response::new(Empty {}))
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> Result<Response<Empty>, Status> {
        let DeleteRequest { key, replica } = request.into_inner();
        if replica {
            self.node.delete_replica(key).await?;
        } else {
            self.node.delete(key).await?;
        }
        Ok(Response::new(Empty {}))
    }

    async fn rep_save(&self, request: Request<RepSaveRequest>) -> Result<Response<Empty>, Status> {
        let RepSaveRequest { key, data } = request.into_inner();
        self.node.rep_save(key, data).await?;
        Ok(Response::new(Empty {}))
    }
}
