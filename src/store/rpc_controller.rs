// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;

use super::fill_rpc_context;
use super::HasRegionError;
use super::KvRpc;
use crate::backoff::Backoff;
use crate::backoff::DEFAULT_REGION_BACKOFF;
use crate::proto::errorpb;
use crate::region::EpochCompare;
use crate::region::Region;
use crate::router::RouterClient;
use crate::Config;
use crate::Error;
use crate::Result;

/// Executes one logical RPC against one region.
///
/// The controller owns leader following, retry, and epoch-aware cache
/// invalidation for a single call:
///
/// ```text
/// PICK_LEADER -> SEND -> interpret(response) ->
///    { DONE_OK
///    | RETRY_SAME_LEADER   (transient transport failure)
///    | RETRY_NEW_LEADER    (not_leader -> use hint or probe replicas)
///    | REFRESH_AND_RETRY   (epoch_not_match / region_not_found)
///    | DONE_FAIL           (budget exhausted or non-retryable) }
/// ```
///
/// On `Err`, the response must not be consumed by the caller; `call` only
/// hands the typed response out on success.
pub(crate) struct RpcController<Router: RouterClient> {
    router: Arc<Router>,
    backoff: Backoff,
    attempt_timeout: Duration,
    deadline: Duration,
}

impl<Router: RouterClient> RpcController<Router> {
    pub(crate) fn new(router: Arc<Router>, config: &Config) -> Self {
        RpcController {
            router,
            backoff: DEFAULT_REGION_BACKOFF,
            attempt_timeout: config.timeout,
            deadline: config.deadline,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) async fn call<R: KvRpc>(
        &mut self,
        mut rpc: R,
        mut region: Arc<Region>,
    ) -> Result<R::Response> {
        let deadline = Instant::now() + self.deadline;
        let request_id = self.router.next_request_id();
        let mut probe_attempt = 0usize;
        let mut needs_refresh = false;

        loop {
            if needs_refresh {
                self.refresh_region(&mut region).await?;
                needs_refresh = false;
            }

            fill_rpc_context(&mut rpc, &region, request_id);
            let address = match region.leader_address() {
                Ok(address) => address.to_owned(),
                Err(_) => region.replica_address(probe_attempt)?.to_owned(),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::DeadlineExceeded {
                    message: format!("{} to region {}", rpc.label(), region.id()),
                });
            }
            let attempt_timeout = self.attempt_timeout.min(remaining);

            match self.dispatch_once(&rpc, &address, attempt_timeout).await {
                Ok(mut response) => match response.region_error() {
                    None => return Ok(response),
                    Some(region_error) => {
                        debug!(
                            "{} to region {}: region error: {:?}",
                            rpc.label(),
                            region.id(),
                            region_error
                        );
                        let resolved = self
                            .on_region_error(&region_error, &mut region, &mut needs_refresh)
                            .await?;
                        // A resolved error (fresh leader hint, superseded
                        // epoch) is retried immediately; otherwise wait for
                        // the cluster to converge.
                        if !resolved && !self.sleep_within(deadline).await {
                            return Err(to_status(region_error, &region));
                        }
                    }
                },
                Err(err)
                    if err.is_transport_retryable()
                        || matches!(err, Error::DeadlineExceeded { .. }) =>
                {
                    if deadline.saturating_duration_since(Instant::now()).is_zero() {
                        return Err(Error::DeadlineExceeded {
                            message: format!("{} to region {}", rpc.label(), region.id()),
                        });
                    }
                    debug!(
                        "{} to {}: transport failure: {}",
                        rpc.label(),
                        address,
                        err
                    );
                    // The leader may be fine and the link flaky, or the node
                    // may be gone; probing advances only when no leader hint
                    // pins the target.
                    probe_attempt += 1;
                    if !self.sleep_within(deadline).await {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch_once<R: KvRpc>(
        &self,
        rpc: &R,
        address: &str,
        attempt_timeout: Duration,
    ) -> Result<R::Response> {
        let client = self.router.kv_client(address).await?;
        let request = rpc.clone().into_store_request();
        let response = timeout(attempt_timeout, client.dispatch(request))
            .await
            .map_err(|_| Error::DeadlineExceeded {
                message: format!("{} attempt to {} timed out", rpc.label(), address),
            })??;
        R::from_store_response(response)
    }

    /// Interpret a routing error from the store.
    ///
    /// Returns `Ok(true)` when the error has been resolved and the call may
    /// be retried immediately, `Ok(false)` when the retry should wait for a
    /// backoff delay first, and `Err` when the error cannot be recovered
    /// here.
    async fn on_region_error(
        &mut self,
        e: &errorpb::Error,
        region: &mut Arc<Region>,
        needs_refresh: &mut bool,
    ) -> Result<bool> {
        let ver_id = region.ver_id();
        if let Some(not_leader) = &e.not_leader {
            if let Some(leader) = &not_leader.leader {
                self.router.update_leader(ver_id, leader.clone()).await;
                let mut updated = (**region).clone();
                updated.leader = Some(leader.clone());
                *region = Arc::new(updated);
                // Topology refreshed successfully: the retry starts over.
                self.backoff.reset();
                Ok(true)
            } else {
                // The peer doesn't know who the current leader is. Generally
                // the group is in an election, but the peer may also have
                // been isolated and removed, so reload from the coordinator.
                self.router.invalidate_region(ver_id).await;
                *needs_refresh = true;
                Ok(false)
            }
        } else if let Some(epoch_not_match) = &e.epoch_not_match {
            self.on_epoch_not_match(epoch_not_match, region, needs_refresh)
                .await
        } else if e.region_not_found.is_some() || e.key_not_in_region.is_some() {
            self.router.invalidate_region(ver_id).await;
            *needs_refresh = true;
            Ok(true)
        } else if e.server_is_busy.is_some() {
            Ok(false)
        } else {
            debug!("unknown region error: {:?}", e);
            self.router.invalidate_region(ver_id).await;
            *needs_refresh = true;
            Ok(false)
        }
    }

    async fn on_epoch_not_match(
        &mut self,
        error: &errorpb::EpochNotMatch,
        region: &mut Arc<Region>,
        needs_refresh: &mut bool,
    ) -> Result<bool> {
        let ver_id = region.ver_id();
        for current in &error.current_regions {
            if current.id != region.id() {
                continue;
            }
            let current_epoch = current.region_epoch.unwrap_or_default();
            // If our view is ahead of the store's, the store has to catch
            // up; invalidating would only thrash the cache.
            if region.epoch().is_newer_than(&current_epoch) {
                return Ok(false);
            }
        }
        // We are behind the store (or the mismatch comes from a split or
        // merge): invalidate and retry immediately on the new layout.
        self.router.invalidate_region(ver_id).await;
        *needs_refresh = true;
        Ok(true)
    }

    /// Re-resolve the region after an invalidation.
    ///
    /// The refreshed region must still cover the whole range of the original
    /// one; if a split shrank it, the payload may now span regions and only
    /// the orchestrator can re-partition it, so the routing error surfaces.
    async fn refresh_region(&mut self, region: &mut Arc<Region>) -> Result<()> {
        let fresh = self.router.region_for_key(&region.start_key()).await?;
        let covers = fresh.region.start_key <= region.region.start_key
            && (fresh.region.end_key.is_empty()
                || (!region.region.end_key.is_empty()
                    && fresh.region.end_key >= region.region.end_key));
        if !covers {
            return Err(Error::EpochMismatch {
                region: region.ver_id(),
            });
        }
        self.backoff.reset();
        *region = fresh;
        Ok(())
    }

    /// Sleep for the next backoff delay. Returns `false` when the attempt
    /// budget or the deadline is exhausted.
    async fn sleep_within(&mut self, deadline: Instant) -> bool {
        let Some(delay) = self.backoff.next_delay_duration() else {
            return false;
        };
        if Instant::now() + delay >= deadline {
            return false;
        }
        sleep(delay).await;
        true
    }
}

/// Map a routing error the controller gave up on to the caller-facing status.
fn to_status(e: errorpb::Error, region: &Region) -> Error {
    let ver_id = region.ver_id();
    if let Some(not_leader) = e.not_leader {
        Error::LeaderChanged {
            region: ver_id,
            hint: not_leader.leader.map(|l| l.address),
        }
    } else if e.epoch_not_match.is_some() {
        Error::EpochMismatch { region: ver_id }
    } else if let Some(region_not_found) = e.region_not_found {
        Error::RegionNotFound {
            region_id: region_not_found.region_id,
        }
    } else {
        Error::RegionError(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::mock::region_with_leader;
    use crate::proto::kvrpcpb;
    use crate::proto::metapb;
    use crate::region::RegionVerId;
    use crate::store::KvClient;
    use crate::store::StoreRequest;
    use crate::store::StoreResponse;
    use crate::Key;

    /// A router that serves one region and replays a scripted sequence of
    /// store responses.
    struct ScriptedRouter {
        region: Mutex<Arc<Region>>,
        script: Arc<Mutex<VecDeque<Result<StoreResponse>>>>,
        dispatched_to: Arc<Mutex<Vec<String>>>,
        invalidations: AtomicUsize,
        request_id: AtomicU64,
    }

    impl ScriptedRouter {
        fn new(region: Region, script: Vec<Result<StoreResponse>>) -> Self {
            ScriptedRouter {
                region: Mutex::new(Arc::new(region)),
                script: Arc::new(Mutex::new(script.into_iter().collect())),
                dispatched_to: Arc::new(Mutex::new(Vec::new())),
                invalidations: AtomicUsize::new(0),
                request_id: AtomicU64::new(1),
            }
        }
    }

    struct ScriptedKvClient {
        address: String,
        script: Arc<Mutex<VecDeque<Result<StoreResponse>>>>,
        dispatched_to: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl KvClient for ScriptedKvClient {
        async fn dispatch(&self, _request: StoreRequest) -> Result<StoreResponse> {
            self.dispatched_to
                .lock()
                .unwrap()
                .push(self.address.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(StoreResponse::KvPut(Default::default())))
        }
    }

    #[async_trait]
    impl RouterClient for ScriptedRouter {
        async fn region_for_key(&self, _key: &Key) -> Result<Arc<Region>> {
            Ok(self.region.lock().unwrap().clone())
        }

        async fn kv_client(&self, address: &str) -> Result<Arc<dyn KvClient + Send + Sync>> {
            Ok(Arc::new(ScriptedKvClient {
                address: address.to_owned(),
                script: self.script.clone(),
                dispatched_to: self.dispatched_to.clone(),
            }))
        }

        async fn update_leader(&self, _ver_id: RegionVerId, leader: metapb::Replica) {
            let mut guard = self.region.lock().unwrap();
            let mut updated = (**guard).clone();
            updated.leader = Some(leader);
            *guard = Arc::new(updated);
        }

        async fn invalidate_region(&self, _ver_id: RegionVerId) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }

        fn next_request_id(&self) -> u64 {
            self.request_id.fetch_add(1, Ordering::Relaxed)
        }
    }

    fn fast_config() -> Config {
        Config::default()
            .with_timeout(Duration::from_millis(50))
            .with_deadline(Duration::from_secs(1))
    }

    fn get_response_ok(value: &[u8]) -> Result<StoreResponse> {
        Ok(StoreResponse::KvGet(kvrpcpb::KvGetResponse {
            region_error: None,
            value: value.to_vec(),
            not_found: false,
        }))
    }

    fn get_response_region_error(e: errorpb::Error) -> Result<StoreResponse> {
        Ok(StoreResponse::KvGet(kvrpcpb::KvGetResponse {
            region_error: Some(e),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn success_returns_typed_response() {
        let router = Arc::new(ScriptedRouter::new(
            region_with_leader(1, vec![], vec![], &["s1", "s2"], Some("s1")),
            vec![get_response_ok(b"v")],
        ));
        let mut controller = RpcController::new(router.clone(), &fast_config());
        let region = router.region_for_key(&Key::EMPTY).await.unwrap();

        let resp = controller
            .call(kvrpcpb::KvGetRequest::default(), region)
            .await
            .unwrap();
        assert_eq!(resp.value, b"v");
        assert_eq!(*router.dispatched_to.lock().unwrap(), vec!["s1".to_owned()]);
    }

    #[tokio::test]
    async fn not_leader_hint_is_followed_without_backoff() {
        let not_leader = errorpb::Error {
            message: "not leader".to_owned(),
            not_leader: Some(errorpb::NotLeader {
                region_id: 1,
                leader: Some(metapb::Replica {
                    address: "s2".to_owned(),
                }),
            }),
            ..Default::default()
        };
        let router = Arc::new(ScriptedRouter::new(
            region_with_leader(1, vec![], vec![], &["s1", "s2"], Some("s1")),
            vec![get_response_region_error(not_leader), get_response_ok(b"v")],
        ));
        // A zero-attempt backoff proves the leader hint path never sleeps.
        let mut controller = RpcController::new(router.clone(), &fast_config())
            .with_backoff(Backoff::no_backoff());
        let region = router.region_for_key(&Key::EMPTY).await.unwrap();

        let resp = controller
            .call(kvrpcpb::KvGetRequest::default(), region)
            .await
            .unwrap();
        assert_eq!(resp.value, b"v");
        assert_eq!(
            *router.dispatched_to.lock().unwrap(),
            vec!["s1".to_owned(), "s2".to_owned()]
        );
    }

    #[tokio::test]
    async fn epoch_mismatch_invalidates_and_retries() {
        let epoch_not_match = errorpb::Error {
            message: "epoch not match".to_owned(),
            epoch_not_match: Some(errorpb::EpochNotMatch {
                message: String::new(),
                current_regions: vec![],
            }),
            ..Default::default()
        };
        let router = Arc::new(ScriptedRouter::new(
            region_with_leader(1, vec![], vec![], &["s1"], Some("s1")),
            vec![
                get_response_region_error(epoch_not_match),
                get_response_ok(b"v"),
            ],
        ));
        let mut controller = RpcController::new(router.clone(), &fast_config());
        let region = router.region_for_key(&Key::EMPTY).await.unwrap();

        let resp = controller
            .call(kvrpcpb::KvGetRequest::default(), region)
            .await
            .unwrap();
        assert_eq!(resp.value, b"v");
        assert_eq!(router.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_store_exhausts_backoff_budget() {
        let busy = || {
            get_response_region_error(errorpb::Error {
                message: "busy".to_owned(),
                server_is_busy: Some(errorpb::ServerIsBusy {
                    reason: "write stall".to_owned(),
                }),
                ..Default::default()
            })
        };
        let router = Arc::new(ScriptedRouter::new(
            region_with_leader(1, vec![], vec![], &["s1"], Some("s1")),
            vec![busy(), busy(), busy(), busy()],
        ));
        let mut controller = RpcController::new(router.clone(), &fast_config())
            .with_backoff(Backoff::no_jitter_backoff(1, 2, 2));
        let region = router.region_for_key(&Key::EMPTY).await.unwrap();

        let err = controller
            .call(kvrpcpb::KvGetRequest::default(), region)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegionError(_)), "{err:?}");
        // initial attempt + one per backoff delay
        assert_eq!(router.dispatched_to.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn transport_errors_probe_other_replicas() {
        let router = Arc::new(ScriptedRouter::new(
            region_with_leader(1, vec![], vec![], &["s1", "s2"], None),
            vec![
                Err(Error::Network {
                    message: "connection refused".to_owned(),
                }),
                get_response_ok(b"v"),
            ],
        ));
        let mut controller = RpcController::new(router.clone(), &fast_config())
            .with_backoff(Backoff::no_jitter_backoff(1, 1, 5));
        let region = router.region_for_key(&Key::EMPTY).await.unwrap();

        let resp = controller
            .call(kvrpcpb::KvGetRequest::default(), region)
            .await
            .unwrap();
        assert_eq!(resp.value, b"v");
        assert_eq!(
            *router.dispatched_to.lock().unwrap(),
            vec!["s1".to_owned(), "s2".to_owned()]
        );
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let router = Arc::new(ScriptedRouter::new(
            region_with_leader(1, vec![], vec![], &["s1"], Some("s1")),
            vec![Err(Error::KeyNotFound)],
        ));
        let mut controller = RpcController::new(router.clone(), &fast_config());
        let region = router.region_for_key(&Key::EMPTY).await.unwrap();

        let err = controller
            .call(kvrpcpb::KvGetRequest::default(), region)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound));
        assert_eq!(router.dispatched_to.lock().unwrap().len(), 1);
    }
}
