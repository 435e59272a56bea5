// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use std::future::Future;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::warn;
use tokio::sync::Semaphore;

use super::sub_batch::group_by_region;
use super::sub_batch::plan_delete_range;
use super::sub_batch::CasEntry;
use super::sub_batch::SubBatch;
use crate::coordinator::CoordinatorConnect;
use crate::coordinator::RetryCoordinatorClient;
use crate::proto::kvrpcpb;
use crate::router::RouterClient;
use crate::router::RouterRpcClient;
use crate::store::KvConnect;
use crate::store::RpcController;
use crate::Config;
use crate::Error;
use crate::KeyOpState;
use crate::Key;
use crate::KvPair;
use crate::Result;
use crate::Value;

/// The RangeKV `Client` routes key-value operations to the regions owning
/// them.
///
/// Single-key operations resolve one region and issue one RPC through the
/// retrying controller. Batch operations partition their input by region,
/// fan the per-region sub-batches out concurrently, and merge the results;
/// the fan-out is bounded by [`Config::max_batch_concurrency`] and every
/// sub-batch completes before the call returns.
///
/// Batch semantics are partial-success per region: per-region requests are
/// atomic only within their region, the merge order of results is the
/// concatenation of sub-batches (not the input order), and when any
/// sub-batch fails the first failure (in partition order, after a scheduled
/// point delete for `delete_range`) is returned while the remaining failures
/// are only logged. Callers that need stricter semantics must size their
/// batches to single regions.
pub struct Client<Router: RouterClient> {
    router: Arc<Router>,
    config: Config,
}

impl<Router: RouterClient> Clone for Client<Router> {
    fn clone(&self) -> Self {
        Client {
            router: self.router.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C, KvC> Client<RouterRpcClient<RetryCoordinatorClient<C>, KvC>>
where
    C: CoordinatorConnect,
    KvC: KvConnect,
{
    /// Create a client against a coordinator endpoint list, with the given
    /// transport factories.
    ///
    /// Endpoints and connections are dialed lazily; include every coordinator
    /// endpoint to avoid a single point of failure.
    pub fn new(
        coordinator_endpoints: Vec<String>,
        coordinator_connect: C,
        kv_connect: KvC,
        config: Config,
    ) -> Self {
        let coordinator = Arc::new(RetryCoordinatorClient::new(
            coordinator_endpoints,
            coordinator_connect,
            config.coordinator_retry,
        ));
        let router = Arc::new(RouterRpcClient::new(coordinator, kv_connect, &config));
        Client { router, config }
    }
}

impl<Router: RouterClient> Client<Router> {
    /// Create a client over an existing router.
    pub fn with_router(router: Arc<Router>, config: Config) -> Self {
        Client { router, config }
    }

    fn controller(&self) -> RpcController<Router> {
        RpcController::new(self.router.clone(), &self.config)
    }

    /// Fetch the value of `key`. A missing key is [`Error::KeyNotFound`],
    /// not an empty value.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Value> {
        let key = key.into();
        let region = self.router.region_for_key(&key).await?;
        let rpc = kvrpcpb::KvGetRequest {
            context: None,
            key: key.into(),
        };
        let resp = self.controller().call(rpc, region).await?;
        if resp.not_found {
            return Err(Error::KeyNotFound);
        }
        Ok(resp.value)
    }

    /// Fetch the values of `keys`. Missing keys are omitted from the output;
    /// the result order is unrelated to the input order.
    pub async fn batch_get(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<KvPair>> {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        let batches = group_by_region(&self.router, keys).await?;
        let tagged = self.tag(
            batches,
            |router: Arc<Router>, config: Config, batch: SubBatch<Key>| async move {
                let rpc = kvrpcpb::KvBatchGetRequest {
                    context: None,
                    keys: batch.payload.into_iter().map(Into::into).collect(),
                };
                let resp = RpcController::new(router, &config)
                    .call(rpc, batch.region)
                    .await?;
                Ok(resp.kvs.into_iter().map(KvPair::from).collect::<Vec<_>>())
            },
        );
        let (status, groups) = self.join_sub_batches("kv_batch_get", tagged).await;
        status?;
        Ok(groups.into_iter().flatten().collect())
    }

    /// Store `value` at `key`, overwriting any previous value.
    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let region = self.router.region_for_key(&key).await?;
        let rpc = kvrpcpb::KvPutRequest {
            context: None,
            kv: Some(kvrpcpb::KvPair {
                key: key.into(),
                value: value.into(),
            }),
        };
        self.controller().call(rpc, region).await?;
        Ok(())
    }

    /// Store every pair. Atomic per region only; pairs landing in different
    /// regions may be applied independently.
    pub async fn batch_put(
        &self,
        pairs: impl IntoIterator<Item = impl Into<KvPair>>,
    ) -> Result<()> {
        let pairs: Vec<KvPair> = pairs.into_iter().map(Into::into).collect();
        let batches = group_by_region(&self.router, pairs).await?;
        let tagged = self.tag(
            batches,
            |router: Arc<Router>, config: Config, batch: SubBatch<KvPair>| async move {
                let rpc = kvrpcpb::KvBatchPutRequest {
                    context: None,
                    kvs: batch.payload.into_iter().map(Into::into).collect(),
                };
                RpcController::new(router, &config)
                    .call(rpc, batch.region)
                    .await?;
                Ok(())
            },
        );
        let (status, _) = self.join_sub_batches("kv_batch_put", tagged).await;
        status
    }

    /// Store `value` at `key` only if the key is absent. Returns whether the
    /// write was applied.
    pub async fn put_if_absent(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<bool> {
        let key = key.into();
        let region = self.router.region_for_key(&key).await?;
        let rpc = kvrpcpb::KvPutIfAbsentRequest {
            context: None,
            kv: Some(kvrpcpb::KvPair {
                key: key.into(),
                value: value.into(),
            }),
        };
        let resp = self.controller().call(rpc, region).await?;
        Ok(resp.key_state)
    }

    /// `put_if_absent` over a batch. Within one region the writes are
    /// applied atomically (all keys absent, or nothing written); atomicity
    /// does not span regions.
    pub async fn batch_put_if_absent(
        &self,
        pairs: impl IntoIterator<Item = impl Into<KvPair>>,
    ) -> Result<Vec<KeyOpState>> {
        let pairs: Vec<KvPair> = pairs.into_iter().map(Into::into).collect();
        let batches = group_by_region(&self.router, pairs).await?;
        let tagged = self.tag(
            batches,
            |router: Arc<Router>, config: Config, batch: SubBatch<KvPair>| async move {
                let keys: Vec<Key> = batch.payload.iter().map(|kv| kv.key.clone()).collect();
                let rpc = kvrpcpb::KvBatchPutIfAbsentRequest {
                    context: None,
                    kvs: batch.payload.into_iter().map(Into::into).collect(),
                    is_atomic: true,
                };
                let resp = RpcController::new(router, &config)
                    .call(rpc, batch.region)
                    .await?;
                zip_key_states(keys, resp.key_states)
            },
        );
        let (status, groups) = self
            .join_sub_batches("kv_batch_put_if_absent", tagged)
            .await;
        status?;
        Ok(groups.into_iter().flatten().collect())
    }

    /// Remove `key`.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        let region = self.router.region_for_key(&key).await?;
        // a point delete is a one-element batch on the wire
        let rpc = kvrpcpb::KvBatchDeleteRequest {
            context: None,
            keys: vec![key.into()],
        };
        self.controller().call(rpc, region).await?;
        Ok(())
    }

    /// Remove every key. On failure, which keys were removed is unspecified.
    pub async fn batch_delete(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<()> {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        let batches = group_by_region(&self.router, keys).await?;
        let tagged = self.tag(
            batches,
            |router: Arc<Router>, config: Config, batch: SubBatch<Key>| async move {
                let rpc = kvrpcpb::KvBatchDeleteRequest {
                    context: None,
                    keys: batch.payload.into_iter().map(Into::into).collect(),
                };
                RpcController::new(router, &config)
                    .call(rpc, batch.region)
                    .await?;
                Ok(())
            },
        );
        let (status, _) = self.join_sub_batches("kv_batch_delete", tagged).await;
        status
    }

    /// Remove every key in the range between `start` and `end`, with the
    /// given boundary inclusivity. Returns the number of keys removed.
    ///
    /// The range may span any number of regions; one sub-request per region
    /// runs concurrently. When `end` is inclusive and coincides with a
    /// region boundary, the point `end` is owned by the next region and is
    /// removed by one extra point delete.
    pub async fn delete_range(
        &self,
        start: impl Into<Key>,
        end: impl Into<Key>,
        with_start: bool,
        with_end: bool,
    ) -> Result<i64> {
        let start = start.into();
        let end = end.into();
        if start.is_empty() || end.is_empty() || start >= end {
            return Err(Error::IllegalState {
                message: "start key must < end key".to_owned(),
            });
        }

        let plan =
            plan_delete_range(&self.router, start, end.clone(), with_start, with_end).await?;

        let tagged: Vec<(u64, _)> = plan
            .legs
            .into_iter()
            .map(|leg| {
                let router = self.router.clone();
                let config = self.config.clone();
                let region_id = leg.region.id();
                let fut = async move {
                    let rpc = kvrpcpb::KvDeleteRangeRequest {
                        context: None,
                        range: Some(kvrpcpb::RangeWithOptions {
                            range: Some(kvrpcpb::Range {
                                start_key: leg.start.into(),
                                end_key: leg.end.into(),
                            }),
                            with_start: leg.with_start,
                            with_end: leg.with_end,
                        }),
                    };
                    let resp = RpcController::new(router, &config)
                        .call(rpc, leg.region)
                        .await?;
                    Ok(resp.delete_count)
                };
                (region_id, fut)
            })
            .collect();

        let legs_fut = self.join_sub_batches("kv_delete_range", tagged);
        let point_fut = async {
            if plan.delete_end_key {
                Some(self.delete(end.clone()).await)
            } else {
                None
            }
        };
        let ((status, counts), point) = futures::join!(legs_fut, point_fut);

        let mut delete_count: i64 = counts.into_iter().sum();
        match point {
            Some(Ok(())) => delete_count += 1,
            // The point delete was recorded first, so its failure wins.
            Some(Err(err)) => return Err(err),
            None => {}
        }
        status?;
        Ok(delete_count)
    }

    /// Store `value` at `key` only if the current value equals `expected`.
    /// An empty `expected` means "expect absent". Returns whether the write
    /// was applied.
    pub async fn compare_and_set(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        expected: impl Into<Value>,
    ) -> Result<bool> {
        let key = key.into();
        let region = self.router.region_for_key(&key).await?;
        let rpc = kvrpcpb::KvCompareAndSetRequest {
            context: None,
            kv: Some(kvrpcpb::KvPair {
                key: key.into(),
                value: value.into(),
            }),
            expect_value: expected.into(),
        };
        let resp = self.controller().call(rpc, region).await?;
        Ok(resp.key_state)
    }

    /// `compare_and_set` over a batch; `expected` pairs up with `pairs` by
    /// index and the two must have the same length.
    pub async fn batch_compare_and_set(
        &self,
        pairs: impl IntoIterator<Item = impl Into<KvPair>>,
        expected: Vec<Value>,
    ) -> Result<Vec<KeyOpState>> {
        let pairs: Vec<KvPair> = pairs.into_iter().map(Into::into).collect();
        if pairs.len() != expected.len() {
            return Err(Error::InvalidArgument {
                message: format!(
                    "kvs size:{} must equal expected_values size:{}",
                    pairs.len(),
                    expected.len()
                ),
            });
        }

        let entries: Vec<CasEntry> = pairs
            .into_iter()
            .zip(expected)
            .map(|(kv, expect)| CasEntry { kv, expect })
            .collect();
        let batches = group_by_region(&self.router, entries).await?;
        let tagged = self.tag(
            batches,
            |router: Arc<Router>, config: Config, batch: SubBatch<CasEntry>| async move {
                let keys: Vec<Key> =
                    batch.payload.iter().map(|entry| entry.kv.key.clone()).collect();
                let mut kvs = Vec::with_capacity(batch.payload.len());
                let mut expect_values = Vec::with_capacity(batch.payload.len());
                for entry in batch.payload {
                    kvs.push(entry.kv.into());
                    expect_values.push(entry.expect);
                }
                let rpc = kvrpcpb::KvBatchCompareAndSetRequest {
                    context: None,
                    kvs,
                    expect_values,
                };
                let resp = RpcController::new(router, &config)
                    .call(rpc, batch.region)
                    .await?;
                zip_key_states(keys, resp.key_states)
            },
        );
        let (status, groups) = self
            .join_sub_batches("kv_batch_compare_and_set", tagged)
            .await;
        status?;
        Ok(groups.into_iter().flatten().collect())
    }

    /// Pair every sub-batch with its worker future, tagged by region id for
    /// failure logging.
    fn tag<P, O, F, Fut>(&self, batches: Vec<SubBatch<P>>, run: F) -> Vec<(u64, Fut)>
    where
        F: Fn(Arc<Router>, Config, SubBatch<P>) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        batches
            .into_iter()
            .map(|batch| {
                let region_id = batch.region.id();
                (
                    region_id,
                    run(self.router.clone(), self.config.clone(), batch),
                )
            })
            .collect()
    }

    /// Run the tagged sub-batch futures with bounded parallelism, join them
    /// all, and reduce to (first failure in partition order, successful
    /// outputs in partition order).
    async fn join_sub_batches<O, Fut>(
        &self,
        label: &'static str,
        tagged: Vec<(u64, Fut)>,
    ) -> (Result<()>, Vec<O>)
    where
        Fut: Future<Output = Result<O>>,
    {
        let permits = Arc::new(Semaphore::new(self.config.max_batch_concurrency.max(1)));
        let mut slots: Vec<Option<(u64, Result<O>)>> =
            tagged.iter().map(|_| None).collect();
        let mut tasks: FuturesUnordered<_> = tagged
            .into_iter()
            .enumerate()
            .map(|(index, (region_id, fut))| {
                let permits = permits.clone();
                async move {
                    let outcome = match permits.acquire_owned().await {
                        Ok(_permit) => fut.await,
                        Err(closed) => Err(Error::internal(format!(
                            "semaphore closed while acquiring permit: {closed:?}"
                        ))),
                    };
                    (index, region_id, outcome)
                }
            })
            .collect();

        while let Some((index, region_id, outcome)) = tasks.next().await {
            slots[index] = Some((region_id, outcome));
        }

        let mut first_err: Option<Error> = None;
        let mut outputs = Vec::with_capacity(slots.len());
        for slot in slots {
            let Some((region_id, outcome)) = slot else {
                continue;
            };
            match outcome {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    warn!("rpc: {label} send to region: {region_id} fail: {err}");
                    // only the first fail status is returned
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        (first_err.map_or(Ok(()), Err), outputs)
    }
}

fn zip_key_states(keys: Vec<Key>, key_states: Vec<bool>) -> Result<Vec<KeyOpState>> {
    if keys.len() != key_states.len() {
        return Err(Error::internal(format!(
            "store answered {} key states for {} keys",
            key_states.len(),
            keys.len()
        )));
    }
    Ok(keys
        .into_iter()
        .zip(key_states)
        .map(|(key, taken)| KeyOpState { key, taken })
        .collect())
}
