// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use crate::proto::errorpb;
use crate::proto::kvrpcpb;
use crate::region::Region;
use crate::Result;

/// A store request, tagged by method.
///
/// The controller and orchestrator are generic over [`KvRpc`]; the tagged
/// pair is what actually crosses the [`KvClient`](super::KvClient) seam, so
/// no downcasting is ever needed on the way back.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreRequest {
    KvGet(kvrpcpb::KvGetRequest),
    KvBatchGet(kvrpcpb::KvBatchGetRequest),
    KvPut(kvrpcpb::KvPutRequest),
    KvBatchPut(kvrpcpb::KvBatchPutRequest),
    KvPutIfAbsent(kvrpcpb::KvPutIfAbsentRequest),
    KvBatchPutIfAbsent(kvrpcpb::KvBatchPutIfAbsentRequest),
    KvBatchDelete(kvrpcpb::KvBatchDeleteRequest),
    KvDeleteRange(kvrpcpb::KvDeleteRangeRequest),
    KvCompareAndSet(kvrpcpb::KvCompareAndSetRequest),
    KvBatchCompareAndSet(kvrpcpb::KvBatchCompareAndSetRequest),
}

/// A store response, tagged by method.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreResponse {
    KvGet(kvrpcpb::KvGetResponse),
    KvBatchGet(kvrpcpb::KvBatchGetResponse),
    KvPut(kvrpcpb::KvPutResponse),
    KvBatchPut(kvrpcpb::KvBatchPutResponse),
    KvPutIfAbsent(kvrpcpb::KvPutIfAbsentResponse),
    KvBatchPutIfAbsent(kvrpcpb::KvBatchPutIfAbsentResponse),
    KvBatchDelete(kvrpcpb::KvBatchDeleteResponse),
    KvDeleteRange(kvrpcpb::KvDeleteRangeResponse),
    KvCompareAndSet(kvrpcpb::KvCompareAndSetResponse),
    KvBatchCompareAndSet(kvrpcpb::KvBatchCompareAndSetResponse),
}

impl StoreRequest {
    pub fn label(&self) -> &'static str {
        match self {
            StoreRequest::KvGet(_) => "kv_get",
            StoreRequest::KvBatchGet(_) => "kv_batch_get",
            StoreRequest::KvPut(_) => "kv_put",
            StoreRequest::KvBatchPut(_) => "kv_batch_put",
            StoreRequest::KvPutIfAbsent(_) => "kv_put_if_absent",
            StoreRequest::KvBatchPutIfAbsent(_) => "kv_batch_put_if_absent",
            StoreRequest::KvBatchDelete(_) => "kv_batch_delete",
            StoreRequest::KvDeleteRange(_) => "kv_delete_range",
            StoreRequest::KvCompareAndSet(_) => "kv_compare_and_set",
            StoreRequest::KvBatchCompareAndSet(_) => "kv_batch_compare_and_set",
        }
    }

    pub fn context(&self) -> Option<&kvrpcpb::RpcContext> {
        match self {
            StoreRequest::KvGet(req) => req.context.as_ref(),
            StoreRequest::KvBatchGet(req) => req.context.as_ref(),
            StoreRequest::KvPut(req) => req.context.as_ref(),
            StoreRequest::KvBatchPut(req) => req.context.as_ref(),
            StoreRequest::KvPutIfAbsent(req) => req.context.as_ref(),
            StoreRequest::KvBatchPutIfAbsent(req) => req.context.as_ref(),
            StoreRequest::KvBatchDelete(req) => req.context.as_ref(),
            StoreRequest::KvDeleteRange(req) => req.context.as_ref(),
            StoreRequest::KvCompareAndSet(req) => req.context.as_ref(),
            StoreRequest::KvBatchCompareAndSet(req) => req.context.as_ref(),
        }
    }
}

impl StoreResponse {
    pub fn label(&self) -> &'static str {
        match self {
            StoreResponse::KvGet(_) => "kv_get",
            StoreResponse::KvBatchGet(_) => "kv_batch_get",
            StoreResponse::KvPut(_) => "kv_put",
            StoreResponse::KvBatchPut(_) => "kv_batch_put",
            StoreResponse::KvPutIfAbsent(_) => "kv_put_if_absent",
            StoreResponse::KvBatchPutIfAbsent(_) => "kv_batch_put_if_absent",
            StoreResponse::KvBatchDelete(_) => "kv_batch_delete",
            StoreResponse::KvDeleteRange(_) => "kv_delete_range",
            StoreResponse::KvCompareAndSet(_) => "kv_compare_and_set",
            StoreResponse::KvBatchCompareAndSet(_) => "kv_batch_compare_and_set",
        }
    }
}

/// Responses that may carry a routing error from the store.
pub trait HasRegionError {
    /// Takes the routing error out of the response, if any. A response with
    /// a routing error carries no usable payload.
    fn region_error(&mut self) -> Option<errorpb::Error>;
}

/// One method-specific request/response pair.
///
/// The request type itself implements this trait; the controller uses it to
/// stamp the routing context, cross the transport seam, and get the typed
/// response back.
pub trait KvRpc: Clone + Send + Sync + 'static {
    type Response: HasRegionError + Send + 'static;

    fn label(&self) -> &'static str;
    fn context_mut(&mut self) -> &mut kvrpcpb::RpcContext;
    fn into_store_request(self) -> StoreRequest;
    fn from_store_response(resp: StoreResponse) -> Result<Self::Response>;
}

macro_rules! impl_kv_rpc {
    ($req: ident, $resp: ident, $variant: ident, $label: literal) => {
        impl KvRpc for kvrpcpb::$req {
            type Response = kvrpcpb::$resp;

            fn label(&self) -> &'static str {
                $label
            }

            fn context_mut(&mut self) -> &mut kvrpcpb::RpcContext {
                self.context.get_or_insert_with(kvrpcpb::RpcContext::default)
            }

            fn into_store_request(self) -> StoreRequest {
                StoreRequest::$variant(self)
            }

            fn from_store_response(resp: StoreResponse) -> Result<Self::Response> {
                match resp {
                    StoreResponse::$variant(resp) => Ok(resp),
                    other => Err(crate::Error::internal(format!(
                        "store answered {} with a {} response",
                        $label,
                        other.label()
                    ))),
                }
            }
        }

        impl HasRegionError for kvrpcpb::$resp {
            fn region_error(&mut self) -> Option<errorpb::Error> {
                self.region_error.take()
            }
        }
    };
}

impl_kv_rpc!(KvGetRequest, KvGetResponse, KvGet, "kv_get");
impl_kv_rpc!(KvBatchGetRequest, KvBatchGetResponse, KvBatchGet, "kv_batch_get");
impl_kv_rpc!(KvPutRequest, KvPutResponse, KvPut, "kv_put");
impl_kv_rpc!(KvBatchPutRequest, KvBatchPutResponse, KvBatchPut, "kv_batch_put");
impl_kv_rpc!(
    KvPutIfAbsentRequest,
    KvPutIfAbsentResponse,
    KvPutIfAbsent,
    "kv_put_if_absent"
);
impl_kv_rpc!(
    KvBatchPutIfAbsentRequest,
    KvBatchPutIfAbsentResponse,
    KvBatchPutIfAbsent,
    "kv_batch_put_if_absent"
);
impl_kv_rpc!(
    KvBatchDeleteRequest,
    KvBatchDeleteResponse,
    KvBatchDelete,
    "kv_batch_delete"
);
impl_kv_rpc!(
    KvDeleteRangeRequest,
    KvDeleteRangeResponse,
    KvDeleteRange,
    "kv_delete_range"
);
impl_kv_rpc!(
    KvCompareAndSetRequest,
    KvCompareAndSetResponse,
    KvCompareAndSet,
    "kv_compare_and_set"
);
impl_kv_rpc!(
    KvBatchCompareAndSetRequest,
    KvBatchCompareAndSetResponse,
    KvBatchCompareAndSet,
    "kv_batch_compare_and_set"
);

/// Stamp the routing context for one attempt against `region`.
pub fn fill_rpc_context<R: KvRpc>(rpc: &mut R, region: &Region, request_id: u64) {
    let context = rpc.context_mut();
    context.region_id = region.id();
    context.region_epoch = Some(region.epoch());
    context.request_id = request_id;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::metapb;

    #[test]
    fn labels_are_consistent_across_request_and_response() {
        let req = kvrpcpb::KvGetRequest::default();
        assert_eq!(req.label(), "kv_get");
        assert_eq!(req.clone().into_store_request().label(), "kv_get");
        assert_eq!(StoreResponse::KvGet(Default::default()).label(), "kv_get");
    }

    #[test]
    fn fill_rpc_context_stamps_region_and_request_id() {
        let region = Region {
            region: metapb::Region {
                id: 7,
                start_key: vec![1],
                end_key: vec![9],
                region_epoch: Some(metapb::RegionEpoch {
                    conf_ver: 3,
                    version: 4,
                }),
                replicas: vec![],
            },
            leader: None,
        };

        let mut req = kvrpcpb::KvPutRequest::default();
        fill_rpc_context(&mut req, &region, 42);
        let context = req.context.expect("context must be stamped");
        assert_eq!(context.region_id, 7);
        assert_eq!(
            context.region_epoch,
            Some(metapb::RegionEpoch {
                conf_ver: 3,
                version: 4
            })
        );
        assert_eq!(context.request_id, 42);
    }

    #[test]
    fn mismatched_response_variant_is_an_internal_error() {
        let resp = StoreResponse::KvPut(Default::default());
        let err = kvrpcpb::KvGetRequest::from_store_response(resp).unwrap_err();
        assert!(err.to_string().contains("kv_get"), "{err}");
    }

    #[test]
    fn region_error_is_taken_once() {
        let mut resp = kvrpcpb::KvGetResponse {
            region_error: Some(errorpb::Error {
                message: "stale".to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(resp.region_error().is_some());
        assert!(resp.region_error().is_none());
    }
}
