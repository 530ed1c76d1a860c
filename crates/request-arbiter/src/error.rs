use local_store::StoreError;
use origin_key::{OriginError, OriginKey};
use rate_gate::RateLimited;
use thiserror::Error;
use walletgate_core_types::RequestId;

/// Errors surfaced by the arbitration engine.
///
/// Rate-limit and duplicate failures are expected, recoverable conditions,
/// not bugs; callers should not log them as errors.
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error("the source {0} has a pending authorization request")]
    DuplicatePending(OriginKey),
    #[error("the source {0} is not allowed to interact with this wallet")]
    AccessDenied(OriginKey),
    #[error("the source {0} is not known")]
    UnknownOrigin(OriginKey),
    #[error("no pending request with id {0}")]
    UnknownRequest(RequestId),
    #[error("connection request was cancelled by the user")]
    Cancelled,
    #[error("connection request was rejected by the user")]
    Denied,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
