// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

//! The upstream seam for region metadata.
//!
//! The meta cache refreshes itself through [`CoordinatorClient`]. Production
//! deployments wrap their transport in a [`CoordinatorConnect`] and use
//! [`RetryCoordinatorClient`] for endpoint failover; tests substitute a mock.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use log::warn;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::config::CoordinatorRetryConfig;
use crate::proto::coordpb;
use crate::region::Region;
use crate::Error;
use crate::Result;

/// Access to the coordinator's region metadata.
#[async_trait]
pub trait CoordinatorClient: Send + Sync + 'static {
    /// Returns the regions whose ranges intersect `[start_key, end_key)`,
    /// ordered by start key, at most `limit` of them (zero meaning no limit).
    async fn scan_regions(
        self: Arc<Self>,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: u32,
    ) -> Result<Vec<Region>>;
}

/// One established connection to a coordinator endpoint.
#[async_trait]
pub trait CoordinatorConnection: Send + Sync + 'static {
    async fn scan_regions(
        &self,
        req: coordpb::ScanRegionsRequest,
    ) -> Result<coordpb::ScanRegionsResponse>;
}

/// A factory for coordinator connections.
#[async_trait]
pub trait CoordinatorConnect: Send + Sync + 'static {
    type Connection: CoordinatorConnection;

    async fn connect(&self, address: &str) -> Result<Self::Connection>;
}

/// A [`CoordinatorClient`] that sweeps an endpoint list.
///
/// A request is tried on the currently connected endpoint first; on failure
/// the remaining endpoints are probed in order, with a pause between full
/// sweeps, until the configured attempt budget runs out.
pub struct RetryCoordinatorClient<C: CoordinatorConnect> {
    endpoints: Vec<String>,
    connect: C,
    current: RwLock<Option<(usize, Arc<C::Connection>)>>,
    retry: CoordinatorRetryConfig,
}

impl<C: CoordinatorConnect> RetryCoordinatorClient<C> {
    pub fn new(endpoints: Vec<String>, connect: C, retry: CoordinatorRetryConfig) -> Self {
        RetryCoordinatorClient {
            endpoints,
            connect,
            current: RwLock::new(None),
            retry,
        }
    }

    async fn connection_at(&self, index: usize) -> Result<Arc<C::Connection>> {
        {
            let guard = self.current.read().await;
            if let Some((current_index, conn)) = guard.as_ref() {
                if *current_index == index {
                    return Ok(conn.clone());
                }
            }
        }
        let address = &self.endpoints[index];
        info!("connect to coordinator endpoint: {:?}", address);
        let conn = Arc::new(self.connect.connect(address).await?);
        *self.current.write().await = Some((index, conn.clone()));
        Ok(conn)
    }

    async fn with_failover<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<C::Connection>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if self.endpoints.is_empty() {
            return Err(Error::IllegalState {
                message: "no coordinator endpoints configured".to_owned(),
            });
        }

        let start_index = {
            let guard = self.current.read().await;
            guard.as_ref().map(|(index, _)| *index).unwrap_or(0)
        };

        let mut last_err = None;
        for sweep in 0..self.retry.max_reconnect_attempts.max(1) {
            if sweep > 0 {
                sleep(self.retry.reconnect_interval).await;
            }
            for offset in 0..self.endpoints.len() {
                let index = (start_index + offset) % self.endpoints.len();
                let conn = match self.connection_at(index).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(
                            "coordinator endpoint {:?} unreachable: {}",
                            self.endpoints[index], err
                        );
                        last_err = Some(err);
                        continue;
                    }
                };
                match op(conn).await {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_transport_retryable() => {
                        warn!(
                            "coordinator request to {:?} failed: {}",
                            self.endpoints[index], err
                        );
                        *self.current.write().await = None;
                        last_err = Some(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Network {
            message: "all coordinator endpoints failed".to_owned(),
        }))
    }
}

#[async_trait]
impl<C: CoordinatorConnect> CoordinatorClient for RetryCoordinatorClient<C> {
    async fn scan_regions(
        self: Arc<Self>,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: u32,
    ) -> Result<Vec<Region>> {
        let response = self
            .with_failover(|conn| {
                let req = coordpb::ScanRegionsRequest {
                    start_key: start_key.clone(),
                    end_key: end_key.clone(),
                    limit,
                };
                async move { conn.scan_regions(req).await }
            })
            .await?;

        let mut regions = Vec::with_capacity(response.regions.len());
        for bundle in response.regions {
            let Some(region) = bundle.region else {
                return Err(Error::internal(
                    "coordinator returned a region bundle without a descriptor",
                ));
            };
            regions.push(Region {
                region,
                leader: bundle.leader,
            });
        }
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::proto::metapb;

    struct FlakyConnection {
        address: String,
        healthy: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CoordinatorConnection for FlakyConnection {
        async fn scan_regions(
            &self,
            _req: coordpb::ScanRegionsRequest,
        ) -> Result<coordpb::ScanRegionsResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.healthy {
                return Err(Error::Network {
                    message: format!("{} is down", self.address),
                });
            }
            Ok(coordpb::ScanRegionsResponse {
                regions: vec![coordpb::RegionBundle {
                    region: Some(metapb::Region {
                        id: 1,
                        start_key: vec![],
                        end_key: vec![],
                        region_epoch: Some(metapb::RegionEpoch {
                            conf_ver: 1,
                            version: 1,
                        }),
                        replicas: vec![],
                    }),
                    leader: None,
                }],
            })
        }
    }

    struct FlakyConnect {
        down: Vec<String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CoordinatorConnect for FlakyConnect {
        type Connection = FlakyConnection;

        async fn connect(&self, address: &str) -> Result<FlakyConnection> {
            Ok(FlakyConnection {
                address: address.to_owned(),
                healthy: !self.down.iter().any(|d| d == address),
                calls: self.calls.clone(),
            })
        }
    }

    fn retry_config() -> CoordinatorRetryConfig {
        CoordinatorRetryConfig {
            reconnect_interval: Duration::from_millis(1),
            max_reconnect_attempts: 2,
        }
    }

    #[tokio::test]
    async fn fails_over_to_next_endpoint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(RetryCoordinatorClient::new(
            vec!["c1".to_owned(), "c2".to_owned()],
            FlakyConnect {
                down: vec!["c1".to_owned()],
                calls: calls.clone(),
            },
            retry_config(),
        ));

        let regions = client.scan_regions(vec![], vec![], 1).await.unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id(), 1);
        // one failed call on c1, one successful on c2
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(RetryCoordinatorClient::new(
            vec!["c1".to_owned()],
            FlakyConnect {
                down: vec!["c1".to_owned()],
                calls: calls.clone(),
            },
            retry_config(),
        ));

        let err = client.scan_regions(vec![], vec![], 1).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_endpoints_is_illegal_state() {
        let client = Arc::new(RetryCoordinatorClient::new(
            vec![],
            FlakyConnect {
                down: vec![],
                calls: Arc::new(AtomicUsize::new(0)),
            },
            retry_config(),
        ));
        let err = client.scan_regions(vec![], vec![], 1).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState { .. }));
    }
}
