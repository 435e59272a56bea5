// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

//! Test doubles: a scriptable coordinator, a closure-backed store client, and
//! an in-memory cluster that speaks the full store protocol (epoch checks,
//! leader checks, key containment) against a shared `BTreeMap`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::coordinator::CoordinatorClient;
use crate::proto::errorpb;
use crate::proto::kvrpcpb;
use crate::proto::metapb;
use crate::raw;
use crate::region::Region;
use crate::router::RouterRpcClient;
use crate::store::KvClient;
use crate::store::KvConnect;
use crate::store::StoreRequest;
use crate::store::StoreResponse;
use crate::Config;
use crate::Result;

/// A region on the default single mock node, with epoch `(1, 1)`.
pub fn region(id: u64, start_key: Vec<u8>, end_key: Vec<u8>) -> Region {
    region_with_leader(id, start_key, end_key, &["store-1"], Some("store-1"))
}

pub fn region_with_leader(
    id: u64,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    replicas: &[&str],
    leader: Option<&str>,
) -> Region {
    Region {
        region: metapb::Region {
            id,
            start_key,
            end_key,
            region_epoch: Some(metapb::RegionEpoch {
                conf_ver: 1,
                version: 1,
            }),
            replicas: replicas
                .iter()
                .map(|address| metapb::Replica {
                    address: (*address).to_owned(),
                })
                .collect(),
        },
        leader: leader.map(|address| metapb::Replica {
            address: address.to_owned(),
        }),
    }
}

/// A coordinator serving a region table from memory.
#[derive(Default)]
pub struct MockCoordinator {
    regions: Arc<Mutex<Vec<Region>>>,
    scan_count: AtomicUsize,
    hold: AtomicBool,
}

impl MockCoordinator {
    fn with_shared(regions: Arc<Mutex<Vec<Region>>>) -> MockCoordinator {
        MockCoordinator {
            regions,
            scan_count: AtomicUsize::new(0),
            hold: AtomicBool::new(false),
        }
    }

    pub fn set_regions(&self, regions: Vec<Region>) {
        *self.regions.lock().unwrap() = regions;
    }

    pub fn scan_count(&self) -> usize {
        self.scan_count.load(SeqCst)
    }

    /// Park incoming scans (after counting them) until released. Lets tests
    /// assert single-flight behavior deterministically.
    pub fn hold_scans(&self, hold: bool) {
        self.hold.store(hold, SeqCst);
    }
}

#[async_trait]
impl CoordinatorClient for MockCoordinator {
    async fn scan_regions(
        self: Arc<Self>,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: u32,
    ) -> Result<Vec<Region>> {
        self.scan_count.fetch_add(1, SeqCst);
        while self.hold.load(SeqCst) {
            tokio::task::yield_now().await;
        }

        let mut matching: Vec<Region> = self
            .regions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                let r_start = &r.region.start_key;
                let r_end = &r.region.end_key;
                let after_start = r_end.is_empty() || r_end > &start_key;
                let before_end = end_key.is_empty() || r_start < &end_key;
                after_start && before_end
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.region.start_key.cmp(&b.region.start_key));
        if limit > 0 {
            matching.truncate(limit as usize);
        }
        Ok(matching)
    }
}

type Handler = dyn Fn(&str, StoreRequest) -> Result<StoreResponse> + Send + Sync;

/// A store client answering from a closure.
#[derive(Clone)]
pub struct MockKvClient {
    address: String,
    handler: Arc<Handler>,
}

impl MockKvClient {
    pub fn new(
        address: String,
        handler: impl Fn(&str, StoreRequest) -> Result<StoreResponse> + Send + Sync + 'static,
    ) -> MockKvClient {
        MockKvClient {
            address,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl KvClient for MockKvClient {
    async fn dispatch(&self, request: StoreRequest) -> Result<StoreResponse> {
        (self.handler)(&self.address, request)
    }
}

struct ClusterState {
    regions: Arc<Mutex<Vec<Region>>>,
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    leader_of: Mutex<HashMap<u64, String>>,
    injected: Mutex<HashMap<u64, VecDeque<errorpb::Error>>>,
    store_requests: AtomicUsize,
}

/// An in-memory cluster: one logical data plane shared by every mock node,
/// fronted by a region table that the coordinator and the stores both read.
pub struct MockCluster {
    pub coordinator: Arc<MockCoordinator>,
    state: Arc<ClusterState>,
}

impl MockCluster {
    pub fn new(regions: Vec<Region>) -> MockCluster {
        let leader_of = regions
            .iter()
            .filter_map(|r| Some((r.id(), r.leader.as_ref()?.address.clone())))
            .collect();
        let regions = Arc::new(Mutex::new(regions));
        let state = Arc::new(ClusterState {
            regions: regions.clone(),
            data: Mutex::new(BTreeMap::new()),
            leader_of: Mutex::new(leader_of),
            injected: Mutex::new(HashMap::new()),
            store_requests: AtomicUsize::new(0),
        });
        MockCluster {
            coordinator: Arc::new(MockCoordinator::with_shared(regions)),
            state,
        }
    }

    pub fn connect(&self) -> MockClusterConnect {
        MockClusterConnect {
            state: self.state.clone(),
        }
    }

    /// A ready-to-use client over this cluster.
    pub fn client(&self, config: Config) -> raw::Client<ClusterRouter> {
        let router = Arc::new(RouterRpcClient::new(
            self.coordinator.clone(),
            self.connect(),
            &config,
        ));
        raw::Client::with_router(router, config)
    }

    /// Bump the region's epoch version, as a split-free topology change.
    /// Clients holding the old epoch get `epoch_not_match` until they
    /// refresh.
    pub fn bump_epoch(&self, region_id: u64) {
        let mut regions = self.state.regions.lock().unwrap();
        for r in regions.iter_mut() {
            if r.id() == region_id {
                let epoch = r.region.region_epoch.get_or_insert_with(Default::default);
                epoch.version += 1;
            }
        }
    }

    /// Move the leadership of a region on the store side only; the client
    /// learns about it from `not_leader` hints.
    pub fn set_leader(&self, region_id: u64, address: &str) {
        self.state
            .leader_of
            .lock()
            .unwrap()
            .insert(region_id, address.to_owned());
    }

    /// Queue a canned routing error for the next request to the region.
    pub fn inject_region_error(&self, region_id: u64, error: errorpb::Error) {
        self.state
            .injected
            .lock()
            .unwrap()
            .entry(region_id)
            .or_default()
            .push_back(error);
    }

    pub fn store_request_count(&self) -> usize {
        self.state.store_requests.load(SeqCst)
    }

    /// Write directly into the data plane, without going through a client.
    pub fn seed(&self, key: &[u8], value: &[u8]) {
        self.state
            .data
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
    }

    pub fn value_of(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.data.lock().unwrap().get(key).cloned()
    }
}

pub type ClusterRouter = RouterRpcClient<MockCoordinator, MockClusterConnect>;

#[derive(Clone)]
pub struct MockClusterConnect {
    state: Arc<ClusterState>,
}

#[async_trait]
impl KvConnect for MockClusterConnect {
    type KvClient = MockKvClient;

    async fn connect(&self, address: &str) -> Result<MockKvClient> {
        let state = self.state.clone();
        Ok(MockKvClient::new(address.to_owned(), move |addr, request| {
            dispatch_at(&state, addr, request)
        }))
    }
}

fn region_error_response(request: &StoreRequest, error: errorpb::Error) -> StoreResponse {
    let error = Some(error);
    match request {
        StoreRequest::KvGet(_) => StoreResponse::KvGet(kvrpcpb::KvGetResponse {
            region_error: error,
            ..Default::default()
        }),
        StoreRequest::KvBatchGet(_) => StoreResponse::KvBatchGet(kvrpcpb::KvBatchGetResponse {
            region_error: error,
            ..Default::default()
        }),
        StoreRequest::KvPut(_) => StoreResponse::KvPut(kvrpcpb::KvPutResponse {
            region_error: error,
        }),
        StoreRequest::KvBatchPut(_) => StoreResponse::KvBatchPut(kvrpcpb::KvBatchPutResponse {
            region_error: error,
        }),
        StoreRequest::KvPutIfAbsent(_) => {
            StoreResponse::KvPutIfAbsent(kvrpcpb::KvPutIfAbsentResponse {
                region_error: error,
                ..Default::default()
            })
        }
        StoreRequest::KvBatchPutIfAbsent(_) => {
            StoreResponse::KvBatchPutIfAbsent(kvrpcpb::KvBatchPutIfAbsentResponse {
                region_error: error,
                ..Default::default()
            })
        }
        StoreRequest::KvBatchDelete(_) => {
            StoreResponse::KvBatchDelete(kvrpcpb::KvBatchDeleteResponse {
                region_error: error,
            })
        }
        StoreRequest::KvDeleteRange(_) => {
            StoreResponse::KvDeleteRange(kvrpcpb::KvDeleteRangeResponse {
                region_error: error,
                ..Default::default()
            })
        }
        StoreRequest::KvCompareAndSet(_) => {
            StoreResponse::KvCompareAndSet(kvrpcpb::KvCompareAndSetResponse {
                region_error: error,
                ..Default::default()
            })
        }
        StoreRequest::KvBatchCompareAndSet(_) => {
            StoreResponse::KvBatchCompareAndSet(kvrpcpb::KvBatchCompareAndSetResponse {
                region_error: error,
                ..Default::default()
            })
        }
    }
}

fn key_in_region(region: &Region, key: &[u8]) -> bool {
    region.contains(&key.to_vec().into())
}

fn dispatch_at(
    state: &ClusterState,
    address: &str,
    request: StoreRequest,
) -> Result<StoreResponse> {
    state.store_requests.fetch_add(1, SeqCst);
    let context = request
        .context()
        .cloned()
        .ok_or_else(|| crate::Error::internal("store request without context"))?;

    if let Some(error) = state
        .injected
        .lock()
        .unwrap()
        .get_mut(&context.region_id)
        .and_then(|queue| queue.pop_front())
    {
        return Ok(region_error_response(&request, error));
    }

    let region = {
        let regions = state.regions.lock().unwrap();
        regions.iter().find(|r| r.id() == context.region_id).cloned()
    };
    let Some(region) = region else {
        return Ok(region_error_response(
            &request,
            errorpb::Error {
                message: "region not found".to_owned(),
                region_not_found: Some(errorpb::RegionNotFound {
                    region_id: context.region_id,
                }),
                ..Default::default()
            },
        ));
    };

    if let Some(leader) = state.leader_of.lock().unwrap().get(&region.id()) {
        if leader != address {
            return Ok(region_error_response(
                &request,
                errorpb::Error {
                    message: "not leader".to_owned(),
                    not_leader: Some(errorpb::NotLeader {
                        region_id: region.id(),
                        leader: Some(metapb::Replica {
                            address: leader.clone(),
                        }),
                    }),
                    ..Default::default()
                },
            ));
        }
    }

    if context.region_epoch != Some(region.epoch()) {
        return Ok(region_error_response(
            &request,
            errorpb::Error {
                message: "epoch not match".to_owned(),
                epoch_not_match: Some(errorpb::EpochNotMatch {
                    message: "epoch not match".to_owned(),
                    current_regions: vec![region.region.clone()],
                }),
                ..Default::default()
            },
        ));
    }

    let misrouted = |key: &[u8]| {
        region_error_response(
            &request,
            errorpb::Error {
                message: "key not in region".to_owned(),
                key_not_in_region: Some(errorpb::KeyNotInRegion {
                    key: key.to_vec(),
                    region_id: region.id(),
                }),
                ..Default::default()
            },
        )
    };

    let mut data = state.data.lock().unwrap();
    let response = match &request {
        StoreRequest::KvGet(req) => {
            if !key_in_region(&region, &req.key) {
                return Ok(misrouted(&req.key));
            }
            match data.get(&req.key) {
                Some(value) => StoreResponse::KvGet(kvrpcpb::KvGetResponse {
                    region_error: None,
                    value: value.clone(),
                    not_found: false,
                }),
                None => StoreResponse::KvGet(kvrpcpb::KvGetResponse {
                    region_error: None,
                    value: vec![],
                    not_found: true,
                }),
            }
        }
        StoreRequest::KvBatchGet(req) => {
            let mut kvs = Vec::new();
            for key in &req.keys {
                if !key_in_region(&region, key) {
                    return Ok(misrouted(key));
                }
                if let Some(value) = data.get(key) {
                    kvs.push(kvrpcpb::KvPair {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
            StoreResponse::KvBatchGet(kvrpcpb::KvBatchGetResponse {
                region_error: None,
                kvs,
            })
        }
        StoreRequest::KvPut(req) => {
            let kv = req.kv.clone().unwrap_or_default();
            if !key_in_region(&region, &kv.key) {
                return Ok(misrouted(&kv.key));
            }
            data.insert(kv.key, kv.value);
            StoreResponse::KvPut(kvrpcpb::KvPutResponse { region_error: None })
        }
        StoreRequest::KvBatchPut(req) => {
            for kv in &req.kvs {
                if !key_in_region(&region, &kv.key) {
                    return Ok(misrouted(&kv.key));
                }
            }
            for kv in &req.kvs {
                data.insert(kv.key.clone(), kv.value.clone());
            }
            StoreResponse::KvBatchPut(kvrpcpb::KvBatchPutResponse { region_error: None })
        }
        StoreRequest::KvPutIfAbsent(req) => {
            let kv = req.kv.clone().unwrap_or_default();
            if !key_in_region(&region, &kv.key) {
                return Ok(misrouted(&kv.key));
            }
            let taken = !data.contains_key(&kv.key);
            if taken {
                data.insert(kv.key, kv.value);
            }
            StoreResponse::KvPutIfAbsent(kvrpcpb::KvPutIfAbsentResponse {
                region_error: None,
                key_state: taken,
            })
        }
        StoreRequest::KvBatchPutIfAbsent(req) => {
            for kv in &req.kvs {
                if !key_in_region(&region, &kv.key) {
                    return Ok(misrouted(&kv.key));
                }
            }
            let key_states: Vec<bool> = if req.is_atomic {
                let all_absent = req.kvs.iter().all(|kv| !data.contains_key(&kv.key));
                if all_absent {
                    for kv in &req.kvs {
                        data.insert(kv.key.clone(), kv.value.clone());
                    }
                }
                req.kvs.iter().map(|_| all_absent).collect()
            } else {
                req.kvs
                    .iter()
                    .map(|kv| {
                        let taken = !data.contains_key(&kv.key);
                        if taken {
                            data.insert(kv.key.clone(), kv.value.clone());
                        }
                        taken
                    })
                    .collect()
            };
            StoreResponse::KvBatchPutIfAbsent(kvrpcpb::KvBatchPutIfAbsentResponse {
                region_error: None,
                key_states,
            })
        }
        StoreRequest::KvBatchDelete(req) => {
            for key in &req.keys {
                if !key_in_region(&region, key) {
                    return Ok(misrouted(key));
                }
            }
            for key in &req.keys {
                data.remove(key);
            }
            StoreResponse::KvBatchDelete(kvrpcpb::KvBatchDeleteResponse { region_error: None })
        }
        StoreRequest::KvDeleteRange(req) => {
            let options = req.range.clone().unwrap_or_default();
            let range = options.range.unwrap_or_default();
            if !key_in_region(&region, &range.start_key)
                || !(region.region.end_key.is_empty()
                    || range.end_key <= region.region.end_key)
            {
                return Ok(misrouted(&range.start_key));
            }
            let doomed: Vec<Vec<u8>> = data
                .keys()
                .filter(|k| {
                    let k = k.as_slice();
                    let after_start = k > range.start_key.as_slice()
                        || (options.with_start && k == range.start_key.as_slice());
                    let before_end = k < range.end_key.as_slice()
                        || (options.with_end && k == range.end_key.as_slice());
                    after_start && before_end
                })
                .cloned()
                .collect();
            let delete_count = doomed.len() as i64;
            for key in doomed {
                data.remove(&key);
            }
            StoreResponse::KvDeleteRange(kvrpcpb::KvDeleteRangeResponse {
                region_error: None,
                delete_count,
            })
        }
        StoreRequest::KvCompareAndSet(req) => {
            let kv = req.kv.clone().unwrap_or_default();
            if !key_in_region(&region, &kv.key) {
                return Ok(misrouted(&kv.key));
            }
            let taken = match data.get(&kv.key) {
                Some(current) => current == &req.expect_value,
                None => req.expect_value.is_empty(),
            };
            if taken {
                data.insert(kv.key, kv.value);
            }
            StoreResponse::KvCompareAndSet(kvrpcpb::KvCompareAndSetResponse {
                region_error: None,
                key_state: taken,
            })
        }
        StoreRequest::KvBatchCompareAndSet(req) => {
            for kv in &req.kvs {
                if !key_in_region(&region, &kv.key) {
                    return Ok(misrouted(&kv.key));
                }
            }
            let key_states: Vec<bool> = req
                .kvs
                .iter()
                .zip(&req.expect_values)
                .map(|(kv, expect)| {
                    let taken = match data.get(&kv.key) {
                        Some(current) => current == expect,
                        None => expect.is_empty(),
                    };
                    if taken {
                        data.insert(kv.key.clone(), kv.value.clone());
                    }
                    taken
                })
                .collect();
            StoreResponse::KvBatchCompareAndSet(kvrpcpb::KvBatchCompareAndSetResponse {
                region_error: None,
                key_states,
            })
        }
    };
    Ok(response)
}
