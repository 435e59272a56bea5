// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;

use crate::coordinator::CoordinatorClient;
use crate::proto::metapb;
use crate::region::Region;
use crate::region::RegionVerId;
use crate::region_cache::RegionCache;
use crate::store::KvClient;
use crate::store::KvConnect;
use crate::Config;
use crate::Key;
use crate::Result;

/// Everything the controller and orchestrator need from the routing layer:
/// key-to-region resolution, store connections, and staleness feedback.
///
/// One implementation ([`RouterRpcClient`]) serves production; tests
/// substitute their own.
#[async_trait]
pub trait RouterClient: Send + Sync + 'static {
    async fn region_for_key(&self, key: &Key) -> Result<Arc<Region>>;

    async fn kv_client(&self, address: &str) -> Result<Arc<dyn KvClient + Send + Sync>>;

    /// Publish a leader hint reported by a store.
    async fn update_leader(&self, ver_id: RegionVerId, leader: metapb::Replica);

    /// Drop a region the cluster told us is stale.
    async fn invalidate_region(&self, ver_id: RegionVerId);

    /// Allocate the id for one logical call. The id is reused across retries
    /// of that call so the store can deduplicate replayed writes.
    fn next_request_id(&self) -> u64;
}

/// One address's connection state. The slot mutex serializes dialing: the
/// first caller through it connects, everyone queued behind it finds the
/// client already there. A failed dial leaves the slot empty, so the next
/// caller simply dials again.
type ConnectionSlot<K> = Arc<Mutex<Option<K>>>;

/// The production router: a meta cache backed by a coordinator client plus a
/// per-address store connection cache.
pub struct RouterRpcClient<C, KvC: KvConnect> {
    region_cache: RegionCache<C>,
    kv_connect: KvC,
    connections: Mutex<HashMap<String, ConnectionSlot<KvC::KvClient>>>,
    request_id: AtomicU64,
}

impl<C: CoordinatorClient, KvC: KvConnect> RouterRpcClient<C, KvC> {
    pub fn new(coordinator: Arc<C>, kv_connect: KvC, config: &Config) -> Self {
        RouterRpcClient {
            region_cache: RegionCache::new_with_ttl(
                coordinator,
                config.region_cache_ttl,
                config.region_cache_ttl_jitter,
            ),
            kv_connect,
            connections: Mutex::new(HashMap::new()),
            request_id: AtomicU64::new(1),
        }
    }

    async fn connection_for(&self, address: &str) -> Result<KvC::KvClient> {
        let slot = {
            let mut connections = self.connections.lock().await;
            connections.entry(address.to_owned()).or_default().clone()
        };

        // Dials to one address are funneled through its slot; dials to
        // different addresses proceed independently.
        let mut slot = slot.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        debug!("dialing store {address}");
        let client = self.kv_connect.connect(address).await?;
        *slot = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl<C: CoordinatorClient, KvC: KvConnect> RouterClient for RouterRpcClient<C, KvC> {
    async fn region_for_key(&self, key: &Key) -> Result<Arc<Region>> {
        self.region_cache.get_region_by_key(key).await
    }

    async fn kv_client(&self, address: &str) -> Result<Arc<dyn KvClient + Send + Sync>> {
        let client = self.connection_for(address).await?;
        Ok(Arc::new(client))
    }

    async fn update_leader(&self, ver_id: RegionVerId, leader: metapb::Replica) {
        self.region_cache.update_leader(ver_id, leader).await;
    }

    async fn invalidate_region(&self, ver_id: RegionVerId) {
        self.region_cache.invalidate_region(ver_id).await;
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::mock::MockCoordinator;
    use crate::mock::MockKvClient;
    use crate::store::StoreRequest;
    use crate::store::StoreResponse;
    use crate::Error;

    /// Counts dials; the first `fail` of them return an error, and every
    /// dial parks briefly so racing callers pile up on the slot.
    #[derive(Clone)]
    struct SlowConnect {
        dials: Arc<AtomicUsize>,
        fail: Arc<AtomicUsize>,
    }

    impl SlowConnect {
        fn new() -> Self {
            SlowConnect {
                dials: Arc::new(AtomicUsize::new(0)),
                fail: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl KvConnect for SlowConnect {
        type KvClient = MockKvClient;

        async fn connect(&self, address: &str) -> Result<MockKvClient> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self
                .fail
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(Error::Network {
                    message: format!("{address} refused"),
                });
            }
            Ok(MockKvClient::new(address.to_owned(), |_, _| {
                Ok(StoreResponse::KvPut(Default::default()))
            }))
        }
    }

    fn router(connect: SlowConnect) -> Arc<RouterRpcClient<MockCoordinator, SlowConnect>> {
        Arc::new(RouterRpcClient::new(
            Arc::new(MockCoordinator::default()),
            connect,
            &Config::default(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_callers_share_one_dial() {
        let connect = SlowConnect::new();
        let router = router(connect.clone());

        // Every dial sleeps, so all of these overlap with the first one.
        let results = futures::future::join_all(
            (0..16).map(|_| {
                let router = router.clone();
                async move { router.kv_client("store-7").await }
            }),
        )
        .await;

        for result in results {
            result.unwrap();
        }
        assert_eq!(connect.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn each_address_dials_once() {
        let connect = SlowConnect::new();
        let router = router(connect.clone());

        router.kv_client("a").await.unwrap();
        router.kv_client("b").await.unwrap();
        router.kv_client("a").await.unwrap();
        assert_eq!(connect.dials.load(Ordering::SeqCst), 2);

        let resp = router
            .kv_client("a")
            .await
            .unwrap()
            .dispatch(StoreRequest::KvPut(Default::default()))
            .await
            .unwrap();
        assert!(matches!(resp, StoreResponse::KvPut(_)));
    }

    #[tokio::test]
    async fn failed_dial_leaves_the_slot_retryable() {
        let connect = SlowConnect::new();
        connect.fail.store(1, Ordering::SeqCst);
        let router = router(connect.clone());

        let err = router.kv_client("a").await.map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::Network { .. }), "{err:?}");

        // The failure must not be cached.
        router.kv_client("a").await.unwrap();
        assert_eq!(connect.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let router = router(SlowConnect::new());
        let a = router.next_request_id();
        let b = router.next_request_id();
        assert_ne!(a, b);
    }
}
