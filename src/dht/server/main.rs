use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use ringdht::{
    config::{NodeArgs, StorageKind},
    dht::{
        node::RingNode,
        service::DhtNodeService,
        store::{DiskStore, MemoryStore, Storage},
        transport::GrpcTransport,
    },
    error::{Error, Result},
    logging,
    rpc::dht::dht_node_server::DhtNodeServer,
};
use tonic::transport::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = NodeArgs::parse();
    logging::init(args.log_file.as_deref())?;

    let me = args.member()?;
    let partner = args.partner()?;
    let config = args.node_config()?;
    let storage: Arc<dyn Storage> = match args.storage {
        StorageKind::Mem => Arc::new(MemoryStore::new()),
        StorageKind::Disk => Arc::new(DiskStore::open(args.data_dir.join(me.id.to_string())).await?),
    };

    info!("Initializing node {} with {:?} storage", me, args.storage);
    let node = RingNode::new(config, me, storage, Arc::new(GrpcTransport::new()));

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let server = tokio::spawn(
        Server::builder()
            .add_service(DhtNodeServer::new(DhtNodeService::new(node.clone())))
            .serve_with_shutdown(addr, async {
                let _ = tokio::signal::ctrl_c().await;
            }),
    );

    if let Err(err) = node.start(&partner).await {
        error!("Node {} could not start: {}", node.member(), err);
        server.abort();
        return Err(err);
    }

    let served = server
        .await
        .map_err(|err| Error::Internal(format!("server task failed: {}", err)))?;
    node.shutdown();
    served?;
    info!("Node {} stopped", node.member());
    Ok(())
}
