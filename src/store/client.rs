// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use super::StoreRequest;
use super::StoreResponse;
use crate::Result;

/// A factory for store connections.
///
/// This is the transport seam: the crate never dials anything itself. A
/// production deployment implements `KvConnect` over its RPC channel of
/// choice; tests plug in an in-memory cluster.
#[async_trait]
pub trait KvConnect: Sized + Send + Sync + 'static {
    type KvClient: KvClient + Clone + Send + Sync + 'static;

    async fn connect(&self, address: &str) -> Result<Self::KvClient>;
}

/// A client for a single store node.
#[async_trait]
pub trait KvClient {
    async fn dispatch(&self, request: StoreRequest) -> Result<StoreResponse>;
}
