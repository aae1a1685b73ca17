//! Control-plane error types.

use std::net::IpAddr;

use l4lb_common::VipKey;
use thiserror::Error;

/// Errors returned by control-plane operations.
///
/// A call that returns an error other than `PublishFailure` has left the
/// control-plane state untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LbError {
    /// VIP is not configured.
    #[error("vip {0} not found")]
    VipNotFound(VipKey),

    /// Real is not in the pool.
    #[error("real {0} not found")]
    RealNotFound(IpAddr),

    /// Mapping, rule, index or destination is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// VIP exists with different parameters.
    #[error("vip {0} already exists with different flags")]
    VipAlreadyExists(VipKey),

    /// Duplicate add where the existing entry conflicts.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Conflicting flags, malformed prefix, bad weight and similar.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Index space or table capacity exhausted.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// New tables were computed but could not be handed to the datapath.
    /// Control-plane state is committed; retry with `republish`.
    #[error("failed to publish tables: {0}")]
    PublishFailure(String),
}

impl LbError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LbError::VipNotFound(_) | LbError::RealNotFound(_) | LbError::NotFound(_)
        )
    }
}

/// Result type for control-plane operations.
pub type LbResult<T> = Result<T, LbError>;
