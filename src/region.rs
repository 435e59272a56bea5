// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use derive_new::new;

use crate::proto::metapb;
use crate::Error;
use crate::Key;
use crate::Result;

pub type RegionId = u64;

/// The unique identifier of a region *across time*.
///
/// A region id may be reused by different incarnations of a region after
/// splits and merges; the epoch pair disambiguates them.
#[derive(new, Clone, Default, Debug, PartialEq, Eq, Hash)]
pub struct RegionVerId {
    pub id: RegionId,
    pub conf_ver: u64,
    pub ver: u64,
}

/// A region descriptor together with the client's current leader hint.
///
/// `Region` values are immutable once published by the meta cache; topology
/// changes publish a fresh value and swap it in, so concurrent readers always
/// observe a consistent snapshot.
#[derive(new, Clone, Default, Debug, PartialEq)]
pub struct Region {
    pub region: metapb::Region,
    /// May be stale; the RPC controller falls back to probing replicas.
    pub leader: Option<metapb::Replica>,
}

impl Eq for Region {}

impl Region {
    pub fn contains(&self, key: &Key) -> bool {
        let key: &[u8] = key.into();
        let start_key = &self.region.start_key;
        let end_key = &self.region.end_key;
        key >= start_key.as_slice() && (key < end_key.as_slice() || end_key.is_empty())
    }

    pub fn id(&self) -> RegionId {
        self.region.id
    }

    pub fn start_key(&self) -> Key {
        self.region.start_key.to_vec().into()
    }

    pub fn end_key(&self) -> Key {
        self.region.end_key.to_vec().into()
    }

    pub fn range(&self) -> (Key, Key) {
        (self.start_key(), self.end_key())
    }

    pub fn epoch(&self) -> metapb::RegionEpoch {
        self.region.region_epoch.unwrap_or_default()
    }

    pub fn ver_id(&self) -> RegionVerId {
        let epoch = self.epoch();
        RegionVerId {
            id: self.region.id,
            conf_ver: epoch.conf_ver,
            ver: epoch.version,
        }
    }

    /// The address of the leader replica, if a hint is known.
    pub fn leader_address(&self) -> Result<&str> {
        self.leader
            .as_ref()
            .map(|l| l.address.as_str())
            .ok_or_else(|| Error::LeaderNotFound {
                region: self.ver_id(),
            })
    }

    /// The replica probed on the given attempt when no leader is known.
    pub fn replica_address(&self, attempt: usize) -> Result<&str> {
        if self.region.replicas.is_empty() {
            return Err(Error::LeaderNotFound {
                region: self.ver_id(),
            });
        }
        let index = attempt % self.region.replicas.len();
        Ok(self.region.replicas[index].address.as_str())
    }
}

/// Epoch ordering helpers.
///
/// Epoch components advance independently, so the order is partial: an epoch
/// supersedes another only when it is not older on either component.
pub trait EpochCompare {
    /// Not older on both components.
    fn at_least(&self, other: &Self) -> bool;
    /// Not older on both components and newer on at least one.
    fn is_newer_than(&self, other: &Self) -> bool;
}

impl EpochCompare for metapb::RegionEpoch {
    fn at_least(&self, other: &Self) -> bool {
        self.conf_ver >= other.conf_ver && self.version >= other.version
    }

    fn is_newer_than(&self, other: &Self) -> bool {
        self.at_least(other) && (self.conf_ver > other.conf_ver || self.version > other.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: RegionId, start_key: Vec<u8>, end_key: Vec<u8>) -> Region {
        Region {
            region: metapb::Region {
                id,
                start_key,
                end_key,
                region_epoch: Some(metapb::RegionEpoch {
                    conf_ver: 1,
                    version: 1,
                }),
                replicas: vec![
                    metapb::Replica {
                        address: "s1".to_owned(),
                    },
                    metapb::Replica {
                        address: "s2".to_owned(),
                    },
                ],
            },
            leader: None,
        }
    }

    #[test]
    fn contains_is_half_open() {
        let r = region(1, vec![10], vec![20]);
        assert!(r.contains(&vec![10].into()));
        assert!(r.contains(&vec![15].into()));
        assert!(!r.contains(&vec![20].into()));
        assert!(!r.contains(&vec![9].into()));

        // empty end key means +inf
        let tail = region(2, vec![20], vec![]);
        assert!(tail.contains(&vec![20].into()));
        assert!(tail.contains(&vec![255, 255].into()));
        assert!(!tail.contains(&vec![19].into()));
    }

    #[test]
    fn replica_probe_round_robins() {
        let r = region(1, vec![], vec![]);
        assert_eq!(r.replica_address(0).unwrap(), "s1");
        assert_eq!(r.replica_address(1).unwrap(), "s2");
        assert_eq!(r.replica_address(2).unwrap(), "s1");

        let mut no_replicas = r.clone();
        no_replicas.region.replicas.clear();
        assert!(matches!(
            no_replicas.replica_address(0),
            Err(Error::LeaderNotFound { .. })
        ));
    }

    #[test]
    fn leader_address_requires_hint() {
        let mut r = region(1, vec![], vec![]);
        assert!(matches!(
            r.leader_address(),
            Err(Error::LeaderNotFound { .. })
        ));
        r.leader = Some(metapb::Replica {
            address: "s2".to_owned(),
        });
        assert_eq!(r.leader_address().unwrap(), "s2");
    }

    #[test]
    fn epoch_partial_order() {
        let e = |conf_ver, version| metapb::RegionEpoch { conf_ver, version };
        assert!(e(2, 2).is_newer_than(&e(1, 2)));
        assert!(e(2, 2).is_newer_than(&e(2, 1)));
        assert!(!e(2, 2).is_newer_than(&e(2, 2)));
        // incomparable: newer conf_ver but older version
        assert!(!e(2, 1).is_newer_than(&e(1, 2)));
        assert!(!e(1, 2).is_newer_than(&e(2, 1)));
        assert!(e(2, 2).at_least(&e(2, 2)));
    }
}
