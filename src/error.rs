use std::array::TryFromSliceError;
use std::net::AddrParseError;

use tonic::{Code, Status};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key is absent on the node that owns it.
    #[error("key {0} not found")]
    NotFound(u64),

    #[error("peer {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// A membership notification was rejected or a neighbor answered inconsistently.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no route to the owner of key {0}")]
    RoutingDeadEnd(u64),

    #[error("hop limit reached after {hops} hops resolving key {key}")]
    HopLimit { key: u64, hops: u32 },

    #[error("remote error: {0}")]
    Remote(Status),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    AddrParse(#[from] AddrParseError),

    #[error(transparent)]
    Slice(#[from] TryFromSliceError),
}

impl Error {
    /// Classifies a status returned by the peer at `address`.
    pub fn from_status(address: &str, status: Status) -> Self {
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => Error::Unreachable {
                address: address.to_owned(),
                reason: status.message().to_owned(),
            },
            Code::FailedPrecondition => Error::Protocol(status.message().to_owned()),
            _ => Error::Remote(status),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::Unreachable { .. })
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(_) => Status::not_found(err.to_string()),
            Error::Protocol(_) => Status::failed_precondition(err.to_string()),
            // Never answer Unavailable ourselves: callers read it as "this node is down".
            Error::Unreachable { .. } | Error::RoutingDeadEnd(_) | Error::HopLimit { .. } => {
                Status::aborted(err.to_string())
            }
            Error::Remote(status) => status,
            Error::Config(_) => Status::invalid_argument(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}
