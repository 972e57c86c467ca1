use cid::Cid;
use thiserror::Error;

/// Conditions callers are expected to match on.
///
/// Public operations return [`anyhow::Result`], use `err.downcast_ref::<Error>()`
/// to inspect these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("bitswap is closed")]
    Closed,
    #[error("request was cancelled")]
    Cancelled,
    #[error("malformed message: {0}")]
    Malformed(MalformedReason),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    #[error("empty message that is not a full wantlist")]
    Empty,
    #[error("block {0} is both sent and cancelled")]
    BlockAndCancel(Cid),
}
