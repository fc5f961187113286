use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router, Server,
};
use clap::Parser;
use log::{info, warn};
use ringdht::{
    config::GatewayArgs,
    dht::transport::{GrpcTransport, Transport},
    error::{Error, Result},
    hash, logging,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone)]
struct Gateway {
    root: String,
    bits: u32,
    transport: Arc<GrpcTransport>,
}

impl Gateway {
    fn key(&self, identifier: &str) -> std::result::Result<u64, HttpError> {
        hash::ring_id(identifier, self.bits).map_err(HttpError::from)
    }
}

#[derive(Debug, Deserialize)]
struct SaveBody {
    key: Value,
    value: Value,
}

#[derive(Debug)]
enum HttpError {
    NotFound,
    Ring(Error),
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        HttpError::Ring(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            HttpError::NotFound => (StatusCode::NOT_FOUND, "Key not present".to_owned()),
            HttpError::Ring(err) => {
                warn!("Request failed: {}", err);
                let code = if err.is_unreachable() {
                    StatusCode::BAD_GATEWAY
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (code, err.to_string())
            }
        };
        (code, Json(json!(msg))).into_response()
    }
}

/// JSON strings are used as-is; anything else by its JSON text.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn version() -> Json<Value> {
    Json(json!({ "version": "v1" }))
}

async fn save(
    State(gateway): State<Gateway>,
    Json(body): Json<SaveBody>,
) -> std::result::Result<StatusCode, HttpError> {
    let identifier = plain(&body.key);
    info!("Save request received. Key: {}", identifier);
    let key = gateway.key(&identifier)?;
    gateway
        .transport
        .save(&gateway.root, key, plain(&body.value).into_bytes())
        .await?;
    Ok(StatusCode::CREATED)
}

async fn retrieve(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Value>, HttpError> {
    info!("Retrieval request received. Key: {}", id);
    let key = gateway.key(&id)?;
    let result = gateway.transport.query(&gateway.root, key, 0).await?;
    let data = result.data.ok_or(HttpError::NotFound)?;
    Ok(Json(json!(String::from_utf8_lossy(&data))))
}

async fn remove(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, HttpError> {
    info!("Remove request received. Key: {}", id);
    let key = gateway.key(&id)?;
    gateway.transport.delete(&gateway.root, key).await?;
    Ok(StatusCode::OK)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = GatewayArgs::parse();
    logging::init(args.log_file.as_deref())?;

    let gateway = Gateway {
        root: args.root_node_addr.clone(),
        bits: args.bits,
        transport: Arc::new(GrpcTransport::new()),
    };
    let app = Router::new()
        .route("/api/version", get(version))
        .route("/api/dht", put(save))
        .route("/api/dht/:id", get(retrieve).delete(remove))
        .with_state(gateway);

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    info!("Gateway listening on http://{} for ring node {}", addr, args.root_node_addr);
    Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| Error::Internal(format!("http server failed: {}", err)))?;
    Ok(())
}
