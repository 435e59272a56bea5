// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

//! This crate provides an easy-to-use client for RangeKV, a distributed,
//! range-partitioned key-value store.
//!
//! The keyspace is sharded into *regions*, each a contiguous key range with
//! its own replica group and a `(conf_ver, version)` epoch identifying its
//! topology generation. The client keeps a best-effort map of the regions in
//! a meta cache, turns every operation into per-region RPCs, and repairs its
//! view from the errors the cluster reports (leader moved, epoch stale,
//! region gone) before retrying.
//!
//! [`Client`] is the entry point. Single-key operations (`get`, `put`,
//! `delete`, `compare_and_set`, ...) resolve one region and issue one call;
//! batch operations partition their input by region and scatter the
//! per-region sub-batches concurrently, gathering the results before
//! returning. `delete_range` walks every region the range touches.
//!
//! The transport is pluggable: implement
//! [`CoordinatorConnect`](coordinator::CoordinatorConnect) and
//! [`KvConnect`](store::KvConnect) over your RPC channel and hand them to
//! [`Client::new`].
//!
//! # Examples
//!
//! ```rust,no_run
//! # use rangekv_client::{Client, Config, Result};
//! # use rangekv_client::coordinator::CoordinatorConnect;
//! # use rangekv_client::store::KvConnect;
//! # async fn example<C: CoordinatorConnect, K: KvConnect>(
//! #     coordinator_connect: C,
//! #     kv_connect: K,
//! # ) -> Result<()> {
//! let client = Client::new(
//!     vec!["127.0.0.1:22001".to_owned()],
//!     coordinator_connect,
//!     kv_connect,
//!     Config::default(),
//! );
//! client.put("key".to_owned(), "value".to_owned()).await?;
//! let _value = client.get("key".to_owned()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Since this crate provides an async API, you need an async runtime
//! (Tokio-only).
//!
//! # Batch semantics
//!
//! Batch operations are partial-success: per-region sub-requests are atomic
//! at most within their region, the aggregate status is the first sub-batch
//! failure (the rest are logged), and the merge order of results is the
//! concatenation of sub-batches rather than the input order. Size batches
//! to a single region if you need stricter guarantees.

pub mod backoff;
pub mod coordinator;
pub mod store;

mod common;
mod config;
mod kv;
pub mod proto;
mod raw;
mod region;
mod region_cache;
mod router;

#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(feature = "test-util", allow(dead_code))]
mod mock;

/// Test utilities (feature-gated): an in-memory cluster speaking the full
/// store protocol.
#[cfg(feature = "test-util")]
pub mod test_util {
    pub use super::mock::region;
    pub use super::mock::region_with_leader;
    pub use super::mock::ClusterRouter;
    pub use super::mock::MockCluster;
    pub use super::mock::MockClusterConnect;
    pub use super::mock::MockCoordinator;
    pub use super::mock::MockKvClient;
}

#[doc(inline)]
pub use common::Error;
#[doc(inline)]
pub use common::Result;
#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use config::CoordinatorRetryConfig;

#[doc(inline)]
pub use crate::backoff::Backoff;
#[doc(inline)]
pub use crate::kv::Key;
#[doc(inline)]
pub use crate::kv::KeyOpState;
#[doc(inline)]
pub use crate::kv::KvPair;
#[doc(inline)]
pub use crate::kv::Value;
#[doc(inline)]
pub use crate::raw::Client;
#[doc(inline)]
pub use crate::region::Region;
#[doc(inline)]
pub use crate::region::RegionVerId;
#[doc(inline)]
pub use crate::router::RouterClient;
#[doc(inline)]
pub use crate::router::RouterRpcClient;
