//! Partitioning: vertex → partition → worker
//!
//! Both mappings are pure functions. A vertex always lands in the same
//! partition for a fixed partition count, and a partition always lands on the
//! same worker for a fixed live-worker set. Recovery depends on this: the
//! Master re-runs [`PartitionAssignment::compute`] against whatever workers are
//! live and every worker can find its partitions in the checkpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::error::{PregelError, PregelResult};

/// Partition identifier, in `[0, partition_count)`
pub type PartitionId = u32;

/// Worker identifier
///
/// Replacement workers launched during recovery get fresh ids, so an id is
/// never reused within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Hash a key to a u64 that is stable for a given build.
pub fn stable_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Maps vertex identifiers to partitions
pub trait Partitioner<I>: Send + Sync {
    /// Number of partitions, fixed for the job
    fn partition_count(&self) -> u32;

    /// Partition owning `vertex`. Must be deterministic.
    fn assign(&self, vertex: &I) -> PartitionId;
}

/// Stable hash modulo partition count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPartitioner {
    partition_count: u32,
}

impl HashPartitioner {
    /// Create a partitioner over `partition_count` partitions (must be >= 1)
    pub fn new(partition_count: u32) -> PregelResult<Self> {
        if partition_count == 0 {
            return Err(PregelError::config("partition_count must be >= 1"));
        }
        Ok(Self { partition_count })
    }
}

impl<I: Hash> Partitioner<I> for HashPartitioner {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn assign(&self, vertex: &I) -> PartitionId {
        (stable_hash(vertex) % u64::from(self.partition_count)) as PartitionId
    }
}

/// Jump consistent hash (Lamping & Veach)
///
/// Moves only `1/n` of the vertices when the partition count changes, which
/// keeps an explicit rebalance step cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpHashPartitioner {
    partition_count: u32,
}

impl JumpHashPartitioner {
    /// Create a partitioner over `partition_count` partitions (must be >= 1)
    pub fn new(partition_count: u32) -> PregelResult<Self> {
        if partition_count == 0 {
            return Err(PregelError::config("partition_count must be >= 1"));
        }
        Ok(Self { partition_count })
    }

    /// Jump hash of a pre-hashed key into `[0, buckets)`
    #[inline]
    pub fn jump(mut key: u64, buckets: u32) -> u32 {
        let buckets = i64::from(buckets);
        let mut b: i64 = -1;
        let mut j: i64 = 0;
        while j < buckets {
            b = j;
            key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
            j = ((b.wrapping_add(1) as f64) * ((1_i64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64)))
                as i64;
        }
        b as u32
    }
}

impl<I: Hash> Partitioner<I> for JumpHashPartitioner {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn assign(&self, vertex: &I) -> PartitionId {
        Self::jump(stable_hash(vertex), self.partition_count)
    }
}

/// Check that `partitioner` maps every id in `ids` to the same in-range
/// partition twice in a row.
pub fn verify_determinism<'a, I, P>(partitioner: &P, ids: impl IntoIterator<Item = &'a I>) -> PregelResult<()>
where
    I: fmt::Debug + 'a,
    P: Partitioner<I> + ?Sized,
{
    let count = partitioner.partition_count();
    for id in ids {
        let first = partitioner.assign(id);
        if first >= count {
            return Err(PregelError::PartitionOutOfRange {
                vertex: format!("{:?}", id),
                partition: first,
                partition_count: count,
            });
        }
        let second = partitioner.assign(id);
        if first != second {
            return Err(PregelError::NonDeterministicPartitioner {
                vertex: format!("{:?}", id),
                first,
                second,
            });
        }
    }
    Ok(())
}

/// Owner of `partition` among `workers`: round-robin over the sorted set.
///
/// Returns `None` only when `workers` is empty.
pub fn owner_worker(partition: PartitionId, workers: &[WorkerId]) -> Option<WorkerId> {
    if workers.is_empty() {
        return None;
    }
    let mut sorted = workers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    Some(sorted[partition as usize % sorted.len()])
}

/// Agreed partition → worker ownership for one epoch of the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    owners: BTreeMap<PartitionId, WorkerId>,
    workers: Vec<WorkerId>,
}

impl PartitionAssignment {
    /// Assign `partition_count` partitions to the live workers.
    ///
    /// Fewer partitions than workers is legal; the surplus workers own nothing.
    pub fn compute(partition_count: u32, live_workers: &[WorkerId]) -> PregelResult<Self> {
        if partition_count == 0 {
            return Err(PregelError::config("partition_count must be >= 1"));
        }
        let mut workers = live_workers.to_vec();
        workers.sort_unstable();
        workers.dedup();
        if workers.is_empty() {
            return Err(PregelError::NoLiveWorkers);
        }

        let owners = (0..partition_count)
            .map(|p| (p, workers[p as usize % workers.len()]))
            .collect();
        Ok(Self { owners, workers })
    }

    /// Number of partitions
    pub fn partition_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Workers covered by this assignment, sorted
    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    /// Owner of a partition
    pub fn owner(&self, partition: PartitionId) -> Option<WorkerId> {
        self.owners.get(&partition).copied()
    }

    /// Partitions owned by `worker`, ascending
    pub fn partitions_of(&self, worker: WorkerId) -> Vec<PartitionId> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == worker)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Owner of the partition holding `vertex`
    pub fn owner_of<I, P>(&self, partitioner: &P, vertex: &I) -> Option<WorkerId>
    where
        P: Partitioner<I> + ?Sized,
    {
        self.owner(partitioner.assign(vertex))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky(std::sync::atomic::AtomicU32);

    impl Partitioner<u64> for Flaky {
        fn partition_count(&self) -> u32 {
            4
        }

        fn assign(&self, _vertex: &u64) -> PartitionId {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) % 4
        }
    }

    #[test]
    fn test_hash_partitioner_is_deterministic() {
        let partitioner = HashPartitioner::new(7).unwrap();
        for id in 0u64..1000 {
            let p = partitioner.assign(&id);
            assert!(p < 7);
            assert_eq!(p, partitioner.assign(&id));
        }
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert!(matches!(HashPartitioner::new(0), Err(PregelError::Config(_))));
        assert!(matches!(JumpHashPartitioner::new(0), Err(PregelError::Config(_))));
        assert!(PartitionAssignment::compute(0, &[WorkerId(0)]).is_err());
    }

    #[test]
    fn test_jump_hash_distribution() {
        let partitioner = JumpHashPartitioner::new(4).unwrap();
        let mut counts = [0u32; 4];
        for id in 0u64..10_000 {
            counts[partitioner.assign(&id) as usize] += 1;
        }
        for (p, &count) in counts.iter().enumerate() {
            assert!(count > 2000 && count < 3000, "partition {} has {} vertices", p, count);
        }
    }

    #[test]
    fn test_verify_determinism_detects_flaky_partitioner() {
        let flaky = Flaky(std::sync::atomic::AtomicU32::new(0));
        let ids = [1u64, 2, 3];
        let err = verify_determinism(&flaky, ids.iter()).unwrap_err();
        assert!(matches!(err, PregelError::NonDeterministicPartitioner { .. }));
        assert!(err.is_fatal());

        let stable = HashPartitioner::new(3).unwrap();
        assert!(verify_determinism(&stable, ids.iter()).is_ok());
    }

    #[test]
    fn test_assignment_round_robin() {
        let workers = [WorkerId(2), WorkerId(0), WorkerId(1)];
        let assignment = PartitionAssignment::compute(7, &workers).unwrap();
        assert_eq!(assignment.workers(), &[WorkerId(0), WorkerId(1), WorkerId(2)]);
        assert_eq!(assignment.partitions_of(WorkerId(0)), vec![0, 3, 6]);
        assert_eq!(assignment.partitions_of(WorkerId(1)), vec![1, 4]);
        assert_eq!(assignment.partitions_of(WorkerId(2)), vec![2, 5]);
        for p in 0..7 {
            assert_eq!(assignment.owner(p), owner_worker(p, &workers));
        }
    }

    #[test]
    fn test_fewer_partitions_than_workers() {
        let workers = [WorkerId(0), WorkerId(1), WorkerId(2)];
        let assignment = PartitionAssignment::compute(1, &workers).unwrap();
        assert_eq!(assignment.partitions_of(WorkerId(0)), vec![0]);
        assert!(assignment.partitions_of(WorkerId(1)).is_empty());
        assert!(assignment.partitions_of(WorkerId(2)).is_empty());
    }

    #[test]
    fn test_assignment_independent_of_input_order() {
        let a = PartitionAssignment::compute(10, &[WorkerId(4), WorkerId(9)]).unwrap();
        let b = PartitionAssignment::compute(10, &[WorkerId(9), WorkerId(4), WorkerId(4)]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_workers() {
        assert!(matches!(
            PartitionAssignment::compute(4, &[]),
            Err(PregelError::NoLiveWorkers)
        ));
        assert_eq!(owner_worker(0, &[]), None);
    }
}
