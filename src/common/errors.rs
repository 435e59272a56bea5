// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use std::result;

use thiserror::Error;

use crate::proto::errorpb;
use crate::region::RegionVerId;

/// An error originating from the RangeKV client or its dependencies.
///
/// Every variant carries enough context for the caller to decide locally
/// whether to retry, refresh topology, or surface the failure.
#[derive(Debug, Error)]
pub enum Error {
    /// A client-side precondition was violated (e.g. mismatched batch sizes).
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
    /// An invariant was violated (e.g. `start >= end` for a range).
    #[error("Illegal state: {message}")]
    IllegalState { message: String },
    /// The key does not exist. `Get` on a missing key returns this rather
    /// than an empty value.
    #[error("Key not found")]
    KeyNotFound,
    /// No region is known for the given key, on the client or the coordinator.
    #[error("Region is not found for key: {:?}", key)]
    RegionForKeyNotFound { key: Vec<u8> },
    /// The store no longer hosts the region we addressed.
    #[error("Region {} is not found on the store", region_id)]
    RegionNotFound { region_id: u64 },
    /// The region epoch we sent is stale (split, merge, or conf change).
    #[error("Epoch mismatch for region {}", region.id)]
    EpochMismatch { region: RegionVerId },
    /// The addressed replica is not the leader any more.
    #[error("Leader of region {} changed (hint: {:?})", region.id, hint)]
    LeaderChanged {
        region: RegionVerId,
        hint: Option<String>,
    },
    /// No leader is known for the region and probing found none.
    #[error("Leader of region {} is not found", region.id)]
    LeaderNotFound { region: RegionVerId },
    /// The per-call deadline expired before the call completed.
    #[error("Deadline exceeded: {message}")]
    DeadlineExceeded { message: String },
    /// A transport-level failure (connect, send, or receive).
    #[error("Network error: {message}")]
    Network { message: String },
    /// Errors reported by a store that do not map to a dedicated variant.
    #[error("Region error: {0:?}")]
    RegionError(Box<errorpb::Error>),
    /// Wraps a `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{message}")]
    Internal { message: String },
}

impl From<errorpb::Error> for Error {
    fn from(e: errorpb::Error) -> Error {
        Error::RegionError(Box::new(e))
    }
}

/// A result holding an [`Error`](enum@Error).
pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// An unexpected condition that indicates a bug in the client, not a
    /// condition of the cluster.
    pub(crate) fn internal(message: impl Into<String>) -> Error {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Whether the controller may retry the call against another replica
    /// without refreshing topology first.
    pub fn is_transport_retryable(&self) -> bool {
        matches!(self, Error::Network { .. })
    }

    /// Whether the error signals stale region metadata that a cache refresh
    /// can fix.
    pub fn is_topology_stale(&self) -> bool {
        matches!(
            self,
            Error::RegionNotFound { .. }
                | Error::EpochMismatch { .. }
                | Error::LeaderChanged { .. }
                | Error::LeaderNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let network = Error::Network {
            message: "connection reset".to_owned(),
        };
        assert!(network.is_transport_retryable());
        assert!(!network.is_topology_stale());

        let epoch = Error::EpochMismatch {
            region: RegionVerId {
                id: 3,
                conf_ver: 1,
                ver: 2,
            },
        };
        assert!(epoch.is_topology_stale());
        assert!(!epoch.is_transport_retryable());

        let internal = Error::internal("lost a response slot");
        assert!(!internal.is_transport_retryable());
        assert!(!internal.is_topology_stale());

        assert!(!Error::KeyNotFound.is_topology_stale());
    }
}
