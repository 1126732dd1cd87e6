//! Data-plane error types.

use std::net::Ipv4Addr;

use etcd_kv::StoreError;
use thiserror::Error;

/// Errors surfaced by the lease engine. The handler maps these to a NAK
/// or a dropped packet; none are fatal past setup.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The free set is empty.
    #[error("no free IP addresses")]
    NoFreeAddress,

    /// The address is no longer available to this client: a contended
    /// claim or a stale renewal attempt.
    #[error("ip {0} is no longer free")]
    AlreadyLeased(Ipv4Addr),

    /// The revoke transaction did not apply; the binding changed under us.
    #[error("could not revoke lease on {0}")]
    RevokeConflict(Ipv4Addr),

    /// A stored value did not parse as the type the key family implies.
    #[error("bad stored value for {key}: {value:?}")]
    BadStoredValue {
        /// Key whose value was malformed.
        key: String,
        /// The offending value text.
        value: String,
    },

    /// The store failed underneath us.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    /// True for the contended-claim / stale-renewal case that should be
    /// answered with a NAK rather than a drop.
    pub fn is_already_leased(&self) -> bool {
        matches!(self, LeaseError::AlreadyLeased(_))
    }
}

/// Shorthand result alias for lease operations.
pub type LeaseResult<T> = Result<T, LeaseError>;
