//! Pool selection for new copies and victim ranking for removals

use galleon_common::{FileReplicaInfo, PoolInfo, PoolName};
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Chooses the pool that receives a new copy
pub trait PoolSelectionStrategy: Send + Sync {
    fn select_target(
        &self,
        file: &FileReplicaInfo,
        pools: &BTreeMap<PoolName, PoolInfo>,
        size: u64,
    ) -> Option<PoolName>;
}

/// Orders the locations of an over-replicated file, most removable first
pub trait ReductionStrategy: Send + Sync {
    fn rank_victims(&self, file: &FileReplicaInfo, pools: &BTreeMap<PoolName, PoolInfo>) -> Vec<PoolName>;
}

/// Values of the exclusivity tags already taken by the file's replicas
fn occupied_tags(file: &FileReplicaInfo, pools: &BTreeMap<PoolName, PoolInfo>) -> Vec<(String, String)> {
    let mut taken = Vec::new();
    for pool in file.locations.iter().chain(file.inaccessible.iter()) {
        let Some(info) = pools.get(pool) else { continue };
        for tag in &file.constraints.only_one_copy_per {
            if let Some(value) = info.tag(tag) {
                taken.push((tag.clone(), value.to_string()));
            }
        }
    }
    taken
}

/// Writable free members that do not collide on an exclusivity tag
pub fn eligible_targets<'a>(
    file: &FileReplicaInfo,
    pools: &'a BTreeMap<PoolName, PoolInfo>,
    size: u64,
) -> Vec<&'a PoolInfo> {
    let taken = occupied_tags(file, pools);
    file.free_members
        .iter()
        .filter_map(|p| pools.get(p))
        .filter(|info| info.mode.is_writable())
        .filter(|info| info.cost.total_space == 0 || info.cost.free_space >= size)
        .filter(|info| {
            !file.constraints.only_one_copy_per.iter().any(|tag| {
                info.tag(tag)
                    .is_some_and(|v| taken.iter().any(|(t, tv)| t == tag && tv == v))
            })
        })
        .collect()
}

/// Random choice weighted by free space and headroom. Pools that report
/// no cost figures are chosen uniformly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProportionalSelection;

impl ProportionalSelection {
    fn weight(info: &PoolInfo) -> f64 {
        let headroom = (1.0 - info.cost.load).clamp(0.01, 1.0);
        info.cost.free_space as f64 * headroom
    }
}

impl PoolSelectionStrategy for ProportionalSelection {
    fn select_target(
        &self,
        file: &FileReplicaInfo,
        pools: &BTreeMap<PoolName, PoolInfo>,
        size: u64,
    ) -> Option<PoolName> {
        let candidates = eligible_targets(file, pools, size);
        let mut rng = rand::thread_rng();
        candidates
            .choose_weighted(&mut rng, |info| Self::weight(info))
            .or_else(|_| candidates.choose(&mut rng).ok_or(()))
            .ok()
            .map(|info| info.name.clone())
    }
}

/// Removes replicas that violate tag exclusivity first, then the
/// lexicographically greatest pool names.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicReduction;

impl ReductionStrategy for DeterministicReduction {
    fn rank_victims(&self, file: &FileReplicaInfo, pools: &BTreeMap<PoolName, PoolInfo>) -> Vec<PoolName> {
        let duplicates = |pool: &PoolName| -> bool {
            let Some(info) = pools.get(pool) else { return false };
            file.constraints.only_one_copy_per.iter().any(|tag| {
                info.tag(tag).is_some_and(|value| {
                    file.locations
                        .iter()
                        .filter(|other| *other != pool)
                        .filter_map(|other| pools.get(other))
                        .any(|other| other.tag(tag) == Some(value))
                })
            })
        };
        let mut ranked = file.locations.clone();
        ranked.sort_by_key(|pool| (Reverse(duplicates(pool)), Reverse(pool.clone())));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galleon_common::{AccessLatency, FileId, PoolCost, PoolMode, ReplicaConstraints};

    fn pool(name: &str, host: &str, free: u64) -> PoolInfo {
        let mut info = PoolInfo::new(name);
        info.tags.insert("hostname".into(), host.into());
        info.cost = PoolCost {
            total_space: 1 << 40,
            free_space: free,
            load: 0.0,
        };
        info
    }

    fn file(locations: &[&str], free: &[&str]) -> FileReplicaInfo {
        FileReplicaInfo {
            file_id: FileId::from("0000A1"),
            group: "resilient".into(),
            access_latency: AccessLatency::Online,
            constraints: ReplicaConstraints::new(2, 2).unwrap().with_tags(["hostname"]),
            locations: locations.iter().map(|p| PoolName::from(*p)).collect(),
            inaccessible: vec![],
            corrupt: vec![],
            free_members: free.iter().map(|p| PoolName::from(*p)).collect(),
        }
    }

    fn pools(list: Vec<PoolInfo>) -> BTreeMap<PoolName, PoolInfo> {
        list.into_iter().map(|p| (p.name.clone(), p)).collect()
    }

    #[test]
    fn test_target_respects_tag_exclusivity() {
        let pools = pools(vec![
            pool("pool-a", "host-1", 100),
            pool("pool-b", "host-1", 1000),
            pool("pool-c", "host-2", 10),
        ]);
        let file = file(&["pool-a"], &["pool-b", "pool-c"]);
        for _ in 0..20 {
            assert_eq!(
                ProportionalSelection.select_target(&file, &pools, 1),
                Some(PoolName::from("pool-c"))
            );
        }
    }

    #[test]
    fn test_no_target_when_nothing_writable_or_large_enough() {
        let mut read_only = pool("pool-b", "host-2", 1000);
        read_only.mode = PoolMode::READ_ONLY;
        let pools = pools(vec![
            pool("pool-a", "host-1", 100),
            read_only,
            pool("pool-c", "host-3", 10),
        ]);
        let file = file(&["pool-a"], &["pool-b", "pool-c"]);
        assert_eq!(ProportionalSelection.select_target(&file, &pools, 512), None);
    }

    #[test]
    fn test_pools_without_cost_are_still_selectable() {
        let pools = pools(vec![PoolInfo::new("pool-a"), PoolInfo::new("pool-b")]);
        let mut file = file(&["pool-a"], &["pool-b"]);
        file.constraints.only_one_copy_per.clear();
        assert_eq!(
            ProportionalSelection.select_target(&file, &pools, 4096),
            Some(PoolName::from("pool-b"))
        );
    }

    #[test]
    fn test_reduction_ranks_greatest_name_first() {
        let pools = pools(vec![
            pool("pool-1", "host-1", 0),
            pool("pool-2", "host-2", 0),
            pool("pool-3", "host-3", 0),
        ]);
        let file = file(&["pool-2", "pool-3", "pool-1"], &[]);
        let ranked = DeterministicReduction.rank_victims(&file, &pools);
        assert_eq!(ranked[0], PoolName::from("pool-3"));
    }

    #[test]
    fn test_reduction_prefers_tag_duplicates() {
        let pools = pools(vec![
            pool("pool-1", "host-1", 0),
            pool("pool-2", "host-1", 0),
            pool("pool-3", "host-3", 0),
        ]);
        let file = file(&["pool-1", "pool-2", "pool-3"], &[]);
        let ranked = DeterministicReduction.rank_victims(&file, &pools);
        assert_eq!(ranked[0], PoolName::from("pool-2"));
        assert_eq!(ranked[1], PoolName::from("pool-1"));
    }
}
