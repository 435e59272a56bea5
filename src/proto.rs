// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

//! Wire message definitions.
//!
//! These mirror the server's protobuf schema and are kept as plain prost
//! messages. The transport that carries them is behind
//! [`KvConnect`](crate::store::KvConnect) and
//! [`CoordinatorClient`](crate::coordinator::CoordinatorClient), so the rest
//! of the crate treats each RPC as an opaque request/response pair with a
//! common context shape.

/// Region topology metadata, shared by the coordinator and store protocols.
pub mod metapb {
    /// The topology generation of a region.
    ///
    /// `conf_ver` is bumped on replica membership change, `version` on split
    /// or merge. Higher epochs supersede lower ones.
    #[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
    pub struct RegionEpoch {
        #[prost(uint64, tag = "1")]
        pub conf_ver: u64,
        #[prost(uint64, tag = "2")]
        pub version: u64,
    }

    /// One replica of a region, addressed by its store endpoint.
    #[derive(Clone, PartialEq, Eq, ::prost::Message)]
    pub struct Replica {
        #[prost(string, tag = "1")]
        pub address: String,
    }

    /// A contiguous key-range shard of the keyspace.
    ///
    /// `start_key` is inclusive and `end_key` exclusive; an empty `end_key`
    /// means "+inf".
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Region {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(bytes = "vec", tag = "2")]
        pub start_key: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub end_key: Vec<u8>,
        #[prost(message, optional, tag = "4")]
        pub region_epoch: Option<RegionEpoch>,
        #[prost(message, repeated, tag = "5")]
        pub replicas: Vec<Replica>,
    }
}

/// The coordinator's region metadata protocol.
pub mod coordpb {
    use super::metapb;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ScanRegionsRequest {
        #[prost(bytes = "vec", tag = "1")]
        pub start_key: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub end_key: Vec<u8>,
        /// Zero means no limit.
        #[prost(uint32, tag = "3")]
        pub limit: u32,
    }

    /// A region descriptor plus the coordinator's current leader knowledge.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RegionBundle {
        #[prost(message, optional, tag = "1")]
        pub region: Option<metapb::Region>,
        #[prost(message, optional, tag = "2")]
        pub leader: Option<metapb::Replica>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ScanRegionsResponse {
        #[prost(message, repeated, tag = "1")]
        pub regions: Vec<RegionBundle>,
    }
}

/// Routing errors a store may attach to any response.
pub mod errorpb {
    use super::metapb;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NotLeader {
        #[prost(uint64, tag = "1")]
        pub region_id: u64,
        /// The leader the store believes in, if it knows one.
        #[prost(message, optional, tag = "2")]
        pub leader: Option<metapb::Replica>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RegionNotFound {
        #[prost(uint64, tag = "1")]
        pub region_id: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KeyNotInRegion {
        #[prost(bytes = "vec", tag = "1")]
        pub key: Vec<u8>,
        #[prost(uint64, tag = "2")]
        pub region_id: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EpochNotMatch {
        #[prost(string, tag = "1")]
        pub message: String,
        /// The store's current view of the regions covering the requested
        /// range, so the client can tell whether it is ahead or behind.
        #[prost(message, repeated, tag = "2")]
        pub current_regions: Vec<metapb::Region>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerIsBusy {
        #[prost(string, tag = "1")]
        pub reason: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Error {
        #[prost(string, tag = "1")]
        pub message: String,
        #[prost(message, optional, tag = "2")]
        pub not_leader: Option<NotLeader>,
        #[prost(message, optional, tag = "3")]
        pub region_not_found: Option<RegionNotFound>,
        #[prost(message, optional, tag = "4")]
        pub key_not_in_region: Option<KeyNotInRegion>,
        #[prost(message, optional, tag = "5")]
        pub epoch_not_match: Option<EpochNotMatch>,
        #[prost(message, optional, tag = "6")]
        pub server_is_busy: Option<ServerIsBusy>,
    }
}

/// The store's key-value protocol.
pub mod kvrpcpb {
    use super::errorpb;
    use super::metapb;

    /// The routing context carried by every store request.
    ///
    /// `request_id` identifies one logical call and is reused verbatim across
    /// retries; the store applies a write at most once per request id.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RpcContext {
        #[prost(uint64, tag = "1")]
        pub region_id: u64,
        #[prost(message, optional, tag = "2")]
        pub region_epoch: Option<metapb::RegionEpoch>,
        #[prost(uint64, tag = "3")]
        pub request_id: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvPair {
        #[prost(bytes = "vec", tag = "1")]
        pub key: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub value: Vec<u8>,
    }

    /// A `[start_key, end_key)` byte interval.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Range {
        #[prost(bytes = "vec", tag = "1")]
        pub start_key: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub end_key: Vec<u8>,
    }

    /// A range plus the caller's boundary inclusivity.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RangeWithOptions {
        #[prost(message, optional, tag = "1")]
        pub range: Option<Range>,
        #[prost(bool, tag = "2")]
        pub with_start: bool,
        #[prost(bool, tag = "3")]
        pub with_end: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvGetRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(bytes = "vec", tag = "2")]
        pub key: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvGetResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
        #[prost(bytes = "vec", tag = "2")]
        pub value: Vec<u8>,
        #[prost(bool, tag = "3")]
        pub not_found: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchGetRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub keys: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchGetResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
        /// Missing keys are omitted.
        #[prost(message, repeated, tag = "2")]
        pub kvs: Vec<KvPair>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvPutRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(message, optional, tag = "2")]
        pub kv: Option<KvPair>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvPutResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchPutRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(message, repeated, tag = "2")]
        pub kvs: Vec<KvPair>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchPutResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvPutIfAbsentRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(message, optional, tag = "2")]
        pub kv: Option<KvPair>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvPutIfAbsentResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
        /// Whether the write was applied (the key was absent).
        #[prost(bool, tag = "2")]
        pub key_state: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchPutIfAbsentRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(message, repeated, tag = "2")]
        pub kvs: Vec<KvPair>,
        /// When set, either all keys in this request are written or none are.
        /// Atomicity never spans regions.
        #[prost(bool, tag = "3")]
        pub is_atomic: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchPutIfAbsentResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
        /// One entry per request kv, in request order.
        #[prost(bool, repeated, tag = "2")]
        pub key_states: Vec<bool>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchDeleteRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub keys: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchDeleteResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvDeleteRangeRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(message, optional, tag = "2")]
        pub range: Option<RangeWithOptions>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvDeleteRangeResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
        #[prost(int64, tag = "2")]
        pub delete_count: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvCompareAndSetRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(message, optional, tag = "2")]
        pub kv: Option<KvPair>,
        /// An empty expectation means "expect absent".
        #[prost(bytes = "vec", tag = "3")]
        pub expect_value: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvCompareAndSetResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
        #[prost(bool, tag = "2")]
        pub key_state: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchCompareAndSetRequest {
        #[prost(message, optional, tag = "1")]
        pub context: Option<RpcContext>,
        #[prost(message, repeated, tag = "2")]
        pub kvs: Vec<KvPair>,
        #[prost(bytes = "vec", repeated, tag = "3")]
        pub expect_values: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KvBatchCompareAndSetResponse {
        #[prost(message, optional, tag = "1")]
        pub region_error: Option<errorpb::Error>,
        #[prost(bool, repeated, tag = "2")]
        pub key_states: Vec<bool>,
    }
}
