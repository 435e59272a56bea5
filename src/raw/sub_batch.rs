// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

//! Partitioning of user-level batches into per-region sub-batches.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::kv::Value;
use crate::region::Region;
use crate::router::RouterClient;
use crate::Key;
use crate::KvPair;
use crate::Result;

/// One region's share of a user-level batch operation.
#[derive(Debug)]
pub(crate) struct SubBatch<P> {
    pub region: Arc<Region>,
    pub payload: Vec<P>,
}

/// One element of a `batch_compare_and_set` payload.
pub(crate) struct CasEntry {
    pub kv: KvPair,
    pub expect: Value,
}

impl AsRef<Key> for CasEntry {
    fn as_ref(&self) -> &Key {
        &self.kv.key
    }
}

/// Partition `items` by owning region.
///
/// Any lookup failure aborts the whole batch: without a region nothing can be
/// sent, and partial cluster visibility is treated as fatal here. Groups keep
/// the first-appearance order of their regions and items keep input order
/// within a group.
pub(crate) async fn group_by_region<Router, P>(
    router: &Arc<Router>,
    items: Vec<P>,
) -> Result<Vec<SubBatch<P>>>
where
    Router: RouterClient,
    P: AsRef<Key>,
{
    let mut batches: Vec<SubBatch<P>> = Vec::new();
    let mut batch_of: HashMap<u64, usize> = HashMap::new();
    for item in items {
        let region = router.region_for_key(item.as_ref()).await?;
        match batch_of.entry(region.id()) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                batches[*entry.get()].payload.push(item);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(batches.len());
                batches.push(SubBatch {
                    region,
                    payload: vec![item],
                });
            }
        }
    }
    Ok(batches)
}

/// One per-region sub-request of a range deletion.
#[derive(Debug)]
pub(crate) struct DeleteRangeLeg {
    pub region: Arc<Region>,
    pub start: Key,
    pub with_start: bool,
    pub end: Key,
    pub with_end: bool,
}

#[derive(Debug)]
pub(crate) struct DeleteRangePlan {
    pub legs: Vec<DeleteRangeLeg>,
    /// The user asked for an inclusive `end` and `end` sits exactly on a
    /// region boundary, so it may be owned by the next region: deleting it
    /// takes one extra point delete after the range legs.
    pub delete_end_key: bool,
}

/// Where the deletion's end key falls relative to one region's end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EndPosition {
    /// `end` is inside the region: this leg is the last one.
    Interior,
    /// `end` lies beyond the region: cut at the region boundary and walk on.
    Crosses,
    /// `end` coincides with the region boundary.
    AtBoundary,
}

fn classify_end(end: &Key, region_end: &Key) -> EndPosition {
    use std::cmp::Ordering::*;
    if region_end.is_empty() {
        // The region stretches to +inf, so any end key is interior.
        return EndPosition::Interior;
    }
    match end.cmp(region_end) {
        Less => EndPosition::Interior,
        Greater => EndPosition::Crosses,
        Equal => EndPosition::AtBoundary,
    }
}

/// Walk the regions covering `[start, end]` and emit one sub-request per
/// region.
///
/// Every emitted leg lies entirely within one region; interior boundaries
/// become half-open (`with_end = false`) and the walk never visits a region
/// twice. Only the first leg carries the user's `with_start`; continuation
/// legs start exactly at the previous region's end key, inclusively.
pub(crate) async fn plan_delete_range<Router: RouterClient>(
    router: &Arc<Router>,
    start: Key,
    end: Key,
    with_start: bool,
    with_end: bool,
) -> Result<DeleteRangePlan> {
    let mut legs = Vec::new();
    let mut delete_end_key = false;
    let mut visited: HashSet<u64> = HashSet::new();

    let region = router.region_for_key(&start).await?;
    visited.insert(region.id());

    let mut next = Key::EMPTY;
    {
        // process the start key
        let region_end = region.end_key();
        match classify_end(&end, &region_end) {
            EndPosition::Interior => legs.push(DeleteRangeLeg {
                region,
                start,
                with_start,
                end: end.clone(),
                with_end,
            }),
            EndPosition::Crosses => {
                legs.push(DeleteRangeLeg {
                    region,
                    start,
                    with_start,
                    end: region_end.clone(),
                    with_end: false,
                });
                next = region_end;
            }
            EndPosition::AtBoundary => {
                legs.push(DeleteRangeLeg {
                    region,
                    start,
                    with_start,
                    end: end.clone(),
                    with_end: false,
                });
                if with_end {
                    delete_end_key = true;
                }
            }
        }
    }

    debug_assert_ne!(next, end);

    // process the rest of the range
    while !next.is_empty() {
        debug_assert_ne!(next, end);
        debug_assert!(!delete_end_key);

        let region = router.region_for_key(&next).await?;
        let first_visit = visited.insert(region.id());
        debug_assert!(first_visit, "region {} visited twice", region.id());

        let region_end = region.end_key();
        match classify_end(&end, &region_end) {
            EndPosition::Interior => {
                legs.push(DeleteRangeLeg {
                    region,
                    start: next,
                    with_start: true,
                    end: end.clone(),
                    with_end,
                });
                break;
            }
            EndPosition::Crosses => {
                legs.push(DeleteRangeLeg {
                    region,
                    start: next,
                    with_start: true,
                    end: region_end.clone(),
                    with_end: false,
                });
                next = region_end;
            }
            EndPosition::AtBoundary => {
                legs.push(DeleteRangeLeg {
                    region,
                    start: next,
                    with_start: true,
                    end: end.clone(),
                    with_end: false,
                });
                if with_end {
                    delete_end_key = true;
                }
                break;
            }
        }
    }

    Ok(DeleteRangePlan {
        legs,
        delete_end_key,
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::mock::region;
    use crate::proto::metapb;
    use crate::region::RegionVerId;
    use crate::store::KvClient;
    use crate::Error;

    /// A router resolving keys against a fixed region table.
    struct TableRouter {
        regions: Vec<Region>,
    }

    #[async_trait]
    impl RouterClient for TableRouter {
        async fn region_for_key(&self, key: &Key) -> Result<Arc<Region>> {
            self.regions
                .iter()
                .find(|r| r.contains(key))
                .cloned()
                .map(Arc::new)
                .ok_or_else(|| Error::RegionForKeyNotFound {
                    key: key.clone().into(),
                })
        }

        async fn kv_client(&self, _address: &str) -> Result<Arc<dyn KvClient + Send + Sync>> {
            Err(Error::internal("TableRouter has no transport"))
        }

        async fn update_leader(&self, _ver_id: RegionVerId, _leader: metapb::Replica) {}

        async fn invalidate_region(&self, _ver_id: RegionVerId) {}

        fn next_request_id(&self) -> u64 {
            0
        }
    }

    fn router(regions: Vec<Region>) -> Arc<TableRouter> {
        Arc::new(TableRouter { regions })
    }

    fn check_plan(
        plan: &DeleteRangePlan,
        start: &Key,
        end: &Key,
        with_start: bool,
        with_end: bool,
    ) {
        let legs = &plan.legs;
        assert!(!legs.is_empty());

        // legs lie within their regions, tile the range, and never repeat a
        // region
        let mut seen = HashSet::new();
        for leg in legs {
            assert!(seen.insert(leg.region.id()));
            assert!(leg.start >= leg.region.start_key());
            let region_end = leg.region.end_key();
            assert!(region_end.is_empty() || leg.end <= region_end);
            assert!(leg.start < leg.end);
        }
        for pair in legs.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(!pair[0].with_end);
            assert!(pair[1].with_start);
        }

        // boundary inclusivity reconstructs the user's range exactly
        assert_eq!(&legs[0].start, start);
        assert_eq!(legs[0].with_start, with_start);
        let last = legs.last().unwrap();
        assert_eq!(&last.end, end);
        if plan.delete_end_key {
            assert!(with_end);
            assert!(!last.with_end);
            assert_eq!(last.end, last.region.end_key());
        } else {
            assert_eq!(last.with_end, with_end);
        }
    }

    async fn plan(
        regions: Vec<Region>,
        start: &[u8],
        end: &[u8],
        with_start: bool,
        with_end: bool,
    ) -> DeleteRangePlan {
        plan_delete_range(
            &router(regions),
            start.to_vec().into(),
            end.to_vec().into(),
            with_start,
            with_end,
        )
        .await
        .unwrap()
    }

    fn three_regions() -> Vec<Region> {
        vec![
            region(1, b"a".to_vec(), b"g".to_vec()),
            region(2, b"g".to_vec(), b"p".to_vec()),
            region(3, b"p".to_vec(), b"z".to_vec()),
        ]
    }

    #[tokio::test]
    async fn single_region_range_is_one_leg() {
        let plan = plan(three_regions(), b"b", b"d", true, true).await;
        assert_eq!(plan.legs.len(), 1);
        assert!(!plan.delete_end_key);
        let leg = &plan.legs[0];
        assert_eq!(leg.region.id(), 1);
        assert!(leg.with_start);
        assert!(leg.with_end);
        check_plan(&plan, &b"b".to_vec().into(), &b"d".to_vec().into(), true, true);
    }

    #[tokio::test]
    async fn boundary_end_inclusive_defers_the_end_point() {
        // end "p" is region 2's end key: the point lives in region 3, so the
        // walk stops at region 2 and schedules a separate point delete.
        let plan = plan(three_regions(), b"c", b"p", true, true).await;
        assert_eq!(plan.legs.len(), 2);
        assert!(plan.delete_end_key);
        assert_eq!(plan.legs[0].region.id(), 1);
        assert_eq!(plan.legs[1].region.id(), 2);
        assert_eq!(plan.legs[0].end, b"g".to_vec().into());
        assert!(!plan.legs[0].with_end);
        assert!(!plan.legs[1].with_end);
        check_plan(&plan, &b"c".to_vec().into(), &b"p".to_vec().into(), true, true);
    }

    #[tokio::test]
    async fn boundary_end_exclusive_needs_no_point_delete() {
        let regions = vec![region(1, b"a".to_vec(), b"m".to_vec())];
        let plan = plan(regions, b"a", b"m", true, false).await;
        assert_eq!(plan.legs.len(), 1);
        assert!(!plan.delete_end_key);
        assert_eq!(plan.legs[0].region.id(), 1);
        assert!(!plan.legs[0].with_end);
        check_plan(&plan, &b"a".to_vec().into(), &b"m".to_vec().into(), true, false);
    }

    #[tokio::test]
    async fn three_region_span_tiles_the_range() {
        let plan = plan(three_regions(), b"c", b"q", false, true).await;
        assert_eq!(plan.legs.len(), 3);
        assert!(!plan.delete_end_key);
        assert_eq!(
            plan.legs.iter().map(|l| l.region.id()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(!plan.legs[0].with_start);
        assert!(plan.legs[1].with_start);
        assert!(plan.legs[2].with_end);
        check_plan(&plan, &b"c".to_vec().into(), &b"q".to_vec().into(), false, true);
    }

    #[tokio::test]
    async fn lookup_gap_aborts_the_walk() {
        // hole between g and p
        let regions = vec![
            region(1, b"a".to_vec(), b"g".to_vec()),
            region(3, b"p".to_vec(), b"z".to_vec()),
        ];
        let err = plan_delete_range(
            &router(regions),
            b"c".to_vec().into(),
            b"q".to_vec().into(),
            true,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::RegionForKeyNotFound { .. }));
    }

    #[tokio::test]
    async fn grouping_preserves_first_appearance_order() {
        let router = router(three_regions());
        let keys: Vec<Key> = [b"q", b"b", b"h", b"c", b"r"]
            .iter()
            .map(|k| k.to_vec().into())
            .collect();
        let batches = group_by_region(&router, keys).await.unwrap();
        assert_eq!(
            batches.iter().map(|b| b.region.id()).collect::<Vec<_>>(),
            vec![3, 1, 2]
        );
        assert_eq!(
            batches[0]
                .payload
                .iter()
                .map(|k: &Key| Vec::<u8>::from(k.clone()))
                .collect::<Vec<_>>(),
            vec![b"q".to_vec(), b"r".to_vec()]
        );
        assert_eq!(batches[1].payload.len(), 2);
        assert_eq!(batches[2].payload.len(), 1);
    }

    #[tokio::test]
    async fn grouping_aborts_on_first_lookup_failure() {
        let router = router(vec![region(1, b"a".to_vec(), b"g".to_vec())]);
        let keys: Vec<Key> = vec![b"b".to_vec().into(), b"x".to_vec().into()];
        let err = group_by_region(&router, keys).await.unwrap_err();
        assert!(matches!(err, Error::RegionForKeyNotFound { .. }));
    }

    proptest! {
        /// Random layouts and ranges: the emitted legs always tile the range
        /// within single regions, reconstructing the user's inclusivity.
        #[test]
        fn walker_tiles_any_layout(
            boundaries in proptest::collection::btree_set(2u8..250, 0..6),
            raw_start in 1u8..250,
            span in 1u8..50,
            with_start in any::<bool>(),
            with_end in any::<bool>(),
        ) {
            // regions: [ , b1), [b1, b2), ..., [bn, )
            let mut regions = Vec::new();
            let mut prev: Vec<u8> = Vec::new();
            let boundaries: Vec<u8> = boundaries.into_iter().collect();
            for (index, boundary) in boundaries.iter().enumerate() {
                regions.push(region(index as u64 + 1, prev.clone(), vec![*boundary]));
                prev = vec![*boundary];
            }
            regions.push(region(boundaries.len() as u64 + 1, prev, vec![]));

            let start = vec![raw_start];
            let end = vec![raw_start.saturating_add(span).max(raw_start + 1)];
            prop_assume!(start < end);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let plan = runtime
                .block_on(plan_delete_range(
                    &router(regions),
                    start.clone().into(),
                    end.clone().into(),
                    with_start,
                    with_end,
                ))
                .unwrap();
            check_plan(&plan, &start.into(), &end.into(), with_start, with_end);
        }
    }
}
