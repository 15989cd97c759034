//! Checkpoint storage and the typed checkpoint manager
//!
//! A checkpoint for superstep `n` is a directory-like slot holding
//!
//! ```text
//! superstep-n/
//!   partition-{p}                  one per partition (vertex + edge state)
//!   messages-{sender}-to-{receiver} read buffers for superstep n
//!   aggregators                    master record, written last
//!   (commit marker)
//! ```
//!
//! Blobs may be written in any order by any worker; the slot only becomes
//! visible to recovery once the Master writes the commit marker.
//!
//! Storage belongs to one job at a time. [`CheckpointManager::prepare`]
//! refuses (or clears) slots left behind by an earlier job, and every master
//! record carries the job id so a foreign record is never restored.

mod file;
mod memory;

pub use file::FileCheckpointer;
pub use memory::MemoryCheckpointer;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::aggregator::{AggregateValue, AggregatorKind};
use super::error::{PregelError, PregelResult};
use super::partition::{PartitionId, WorkerId};
use super::store::Partition;

/// Name of the master record blob
pub const MASTER_RECORD_BLOB: &str = "aggregators";

const PARTITION_PREFIX: &str = "partition-";
const MESSAGES_PREFIX: &str = "messages-";

/// Durable blob storage for checkpoints
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Write (or overwrite) a blob of an uncommitted checkpoint
    async fn write_blob(&self, superstep: u64, name: &str, data: Vec<u8>) -> PregelResult<()>;

    async fn read_blob(&self, superstep: u64, name: &str) -> PregelResult<Option<Vec<u8>>>;

    /// Blob names of a checkpoint, sorted
    async fn list_blobs(&self, superstep: u64) -> PregelResult<Vec<String>>;

    /// Atomically mark a checkpoint complete
    async fn commit(&self, superstep: u64) -> PregelResult<()>;

    /// Committed supersteps, ascending
    async fn list_committed(&self) -> PregelResult<Vec<u64>>;

    /// Every superstep holding blobs or a commit marker, ascending
    async fn list_slots(&self) -> PregelResult<Vec<u64>>;

    /// Remove a checkpoint, committed or not
    async fn delete(&self, superstep: u64) -> PregelResult<()>;
}

/// Checkpoint storage selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointerConfig {
    Memory,
    File {
        path: PathBuf,
        #[serde(default = "default_compression_level")]
        compression_level: i32,
    },
}

fn default_compression_level() -> i32 {
    3
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Build the storage backend described by `config`
pub fn create_checkpointer(config: &CheckpointerConfig) -> PregelResult<Arc<dyn Checkpointer>> {
    match config {
        CheckpointerConfig::Memory => Ok(Arc::new(MemoryCheckpointer::new())),
        CheckpointerConfig::File {
            path,
            compression_level,
        } => Ok(Arc::new(FileCheckpointer::new(path.clone())?.with_compression(*compression_level))),
    }
}

/// Job-level state of a checkpoint, written by the Master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Job that wrote the checkpoint
    pub job_id: Uuid,
    pub superstep: u64,
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    /// Aggregator values visible during `superstep`
    pub aggregates: BTreeMap<String, AggregateValue>,
    /// Registered aggregators and their kinds at `superstep`
    #[serde(default)]
    pub aggregators: BTreeMap<String, AggregatorKind>,
    pub total_vertices: u64,
    pub total_edges: u64,
    pub partition_count: u32,
    /// Workers that held the partitions when the checkpoint was taken
    pub workers: Vec<WorkerId>,
}

/// Typed access to a [`Checkpointer`] on behalf of one job
#[derive(Clone)]
pub struct CheckpointManager {
    storage: Arc<dyn Checkpointer>,
    job_id: Uuid,
}

impl CheckpointManager {
    pub fn new(storage: Arc<dyn Checkpointer>, job_id: Uuid) -> Self {
        Self { storage, job_id }
    }

    pub fn storage(&self) -> &Arc<dyn Checkpointer> {
        &self.storage
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Claim the storage for this job.
    ///
    /// Slots left by an earlier job are a configuration error unless
    /// `overwrite` is set, in which case they are deleted.
    pub async fn prepare(&self, overwrite: bool) -> PregelResult<()> {
        let stale = self.storage.list_slots().await?;
        if stale.is_empty() {
            return Ok(());
        }
        if !overwrite {
            return Err(PregelError::config(format!(
                "checkpoint storage already holds supersteps {:?}; clear it or enable overwrite_existing",
                stale
            )));
        }
        tracing::warn!(job_id = %self.job_id, slots = ?stale, "discarding checkpoints of an earlier job");
        for superstep in stale {
            self.storage.delete(superstep).await?;
        }
        Ok(())
    }

    async fn write_json<T: Serialize + ?Sized>(&self, superstep: u64, name: &str, value: &T) -> PregelResult<()> {
        let data = serde_json::to_vec(value)?;
        self.storage.write_blob(superstep, name, data).await
    }

    async fn read_json<T: DeserializeOwned>(&self, superstep: u64, name: &str) -> PregelResult<Option<T>> {
        match self.storage.read_blob(superstep, name).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn write_partition<I, V, E>(&self, superstep: u64, partition: &Partition<I, V, E>) -> PregelResult<()>
    where
        I: Ord + Clone + Serialize,
        V: Serialize,
        E: Serialize,
    {
        let name = format!("{}{}", PARTITION_PREFIX, partition.id());
        self.write_json(superstep, &name, partition).await
    }

    pub async fn read_partition<I, V, E>(&self, superstep: u64, partition: PartitionId) -> PregelResult<Partition<I, V, E>>
    where
        I: Ord + Clone + DeserializeOwned,
        V: DeserializeOwned,
        E: DeserializeOwned,
    {
        let name = format!("{}{}", PARTITION_PREFIX, partition);
        self.read_json(superstep, &name)
            .await?
            .ok_or_else(|| PregelError::checkpoint(superstep, format!("missing blob {}", name)))
    }

    pub async fn write_messages<I, M>(
        &self,
        superstep: u64,
        sender: WorkerId,
        receiver: WorkerId,
        messages: &[(I, M)],
    ) -> PregelResult<()>
    where
        I: Serialize,
        M: Serialize,
    {
        let name = format!("{}{}-to-{}", MESSAGES_PREFIX, sender.0, receiver.0);
        self.write_json(superstep, &name, messages).await
    }

    /// Every message blob of a checkpoint, as `(sender, messages)` in sender order
    pub async fn read_messages<I, M>(&self, superstep: u64) -> PregelResult<Vec<(WorkerId, Vec<(I, M)>)>>
    where
        I: DeserializeOwned,
        M: DeserializeOwned,
    {
        let mut by_sender: BTreeMap<WorkerId, Vec<(I, M)>> = BTreeMap::new();
        for name in self.storage.list_blobs(superstep).await? {
            let Some(sender) = parse_message_sender(&name) else {
                continue;
            };
            let messages: Vec<(I, M)> = self
                .read_json(superstep, &name)
                .await?
                .ok_or_else(|| PregelError::checkpoint(superstep, format!("blob {} vanished", name)))?;
            by_sender.entry(sender).or_default().extend(messages);
        }
        Ok(by_sender.into_iter().collect())
    }

    /// Write the master record, then the commit marker, then drop checkpoints
    /// beyond `retain`
    pub async fn commit(&self, record: &CheckpointRecord, retain: usize) -> PregelResult<()> {
        self.write_json(record.superstep, MASTER_RECORD_BLOB, record).await?;
        self.storage.commit(record.superstep).await?;

        let committed = self.storage.list_committed().await?;
        let excess = committed.len().saturating_sub(retain.max(1));
        for superstep in committed.into_iter().take(excess) {
            tracing::debug!(superstep, "garbage-collecting checkpoint");
            self.storage.delete(superstep).await?;
        }
        Ok(())
    }

    /// Discard the blobs of an uncommitted checkpoint
    pub async fn abandon(&self, superstep: u64) -> PregelResult<()> {
        if self.storage.list_committed().await?.contains(&superstep) {
            return Ok(());
        }
        self.storage.delete(superstep).await
    }

    /// Master record of the newest committed checkpoint
    pub async fn latest(&self) -> PregelResult<Option<CheckpointRecord>> {
        let Some(superstep) = self.storage.list_committed().await?.last().copied() else {
            return Ok(None);
        };
        let record: CheckpointRecord = self
            .read_json(superstep, MASTER_RECORD_BLOB)
            .await?
            .ok_or_else(|| PregelError::checkpoint(superstep, "committed without a master record"))?;
        if record.job_id != self.job_id {
            return Err(PregelError::config(format!(
                "checkpoint at superstep {} belongs to job {}, not {}",
                superstep, record.job_id, self.job_id
            )));
        }
        Ok(Some(record))
    }

    pub async fn committed(&self) -> PregelResult<Vec<u64>> {
        self.storage.list_committed().await
    }
}

fn parse_message_sender(name: &str) -> Option<WorkerId> {
    let rest = name.strip_prefix(MESSAGES_PREFIX)?;
    let (sender, _) = rest.split_once("-to-")?;
    sender.parse().ok().map(WorkerId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pregel::vertex::{Edge, Vertex};

    const JOB: Uuid = Uuid::from_u128(7);

    fn manager(storage: Arc<dyn Checkpointer>) -> CheckpointManager {
        CheckpointManager::new(storage, JOB)
    }

    fn record(superstep: u64) -> CheckpointRecord {
        CheckpointRecord {
            job_id: JOB,
            superstep,
            epoch: 0,
            created_at: Utc::now(),
            aggregates: BTreeMap::from([("sum".to_string(), AggregateValue::Long(5))]),
            aggregators: BTreeMap::from([("sum".to_string(), AggregatorKind::Persistent)]),
            total_vertices: 5,
            total_edges: 5,
            partition_count: 2,
            workers: vec![WorkerId(0)],
        }
    }

    #[test]
    fn test_parse_message_sender() {
        assert_eq!(parse_message_sender("messages-3-to-1"), Some(WorkerId(3)));
        assert_eq!(parse_message_sender("partition-3"), None);
        assert_eq!(parse_message_sender("messages-x-to-1"), None);
    }

    #[tokio::test]
    async fn test_uncommitted_checkpoint_is_invisible() {
        let manager = manager(Arc::new(MemoryCheckpointer::new()));
        let mut partition: Partition<u64, f64, f32> = Partition::new(0);
        partition.insert(Vertex::with_edges(1, 0.5, vec![Edge::new(2, 1.0)]));
        manager.write_partition(4, &partition).await.unwrap();
        assert!(manager.latest().await.unwrap().is_none());

        manager.commit(&record(4), 2).await.unwrap();
        let latest = manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.superstep, 4);
        let restored: Partition<u64, f64, f32> = manager.read_partition(4, 0).await.unwrap();
        assert_eq!(restored, partition);
    }

    #[tokio::test]
    async fn test_messages_grouped_by_sender() {
        let manager = manager(Arc::new(MemoryCheckpointer::new()));
        manager
            .write_messages(2, WorkerId(1), WorkerId(0), &[(7u64, 1.5f64)])
            .await
            .unwrap();
        manager
            .write_messages(2, WorkerId(0), WorkerId(1), &[(8u64, 2.5f64), (9, 3.5)])
            .await
            .unwrap();
        let messages: Vec<(WorkerId, Vec<(u64, f64)>)> = manager.read_messages(2).await.unwrap();
        assert_eq!(
            messages,
            vec![
                (WorkerId(0), vec![(8, 2.5), (9, 3.5)]),
                (WorkerId(1), vec![(7, 1.5)]),
            ]
        );
    }

    #[tokio::test]
    async fn test_retention_and_abandon() {
        let manager = manager(Arc::new(MemoryCheckpointer::new()));
        for superstep in [0, 2, 4] {
            manager.commit(&record(superstep), 2).await.unwrap();
        }
        assert_eq!(manager.committed().await.unwrap(), vec![2, 4]);

        manager.write_messages(6, WorkerId(0), WorkerId(0), &[(1u64, 1u64)]).await.unwrap();
        manager.abandon(6).await.unwrap();
        assert!(manager.storage().list_blobs(6).await.unwrap().is_empty());

        // Abandoning a committed checkpoint is a no-op.
        manager.abandon(4).await.unwrap();
        assert_eq!(manager.latest().await.unwrap().unwrap().superstep, 4);
    }

    #[tokio::test]
    async fn test_missing_partition_blob() {
        let manager = manager(Arc::new(MemoryCheckpointer::new()));
        manager.commit(&record(0), 2).await.unwrap();
        let err = manager.read_partition::<u64, f64, f32>(0, 1).await.unwrap_err();
        assert!(matches!(err, PregelError::Checkpoint { superstep: 0, .. }));
    }

    #[tokio::test]
    async fn test_prepare_refuses_leftover_slots() {
        let storage = Arc::new(MemoryCheckpointer::new());
        let earlier = manager(storage.clone());
        earlier.commit(&record(3), 2).await.unwrap();
        earlier.write_messages(4, WorkerId(0), WorkerId(1), &[(1u64, 1u64)]).await.unwrap();

        let next = CheckpointManager::new(storage.clone(), Uuid::from_u128(8));
        let err = next.prepare(false).await.unwrap_err();
        assert!(matches!(err, PregelError::Config(_)));
        assert!(err.is_fatal());
        assert_eq!(storage.len(), 2);

        next.prepare(true).await.unwrap();
        assert!(storage.is_empty());
        assert!(next.latest().await.unwrap().is_none());
        next.prepare(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_rejects_record_of_another_job() {
        let storage = Arc::new(MemoryCheckpointer::new());
        manager(storage.clone()).commit(&record(6), 2).await.unwrap();

        let other = CheckpointManager::new(storage, Uuid::from_u128(9));
        let err = other.latest().await.unwrap_err();
        assert!(matches!(err, PregelError::Config(msg) if msg.contains("belongs to job")));
    }

    #[test]
    fn test_create_checkpointer() {
        assert!(create_checkpointer(&CheckpointerConfig::Memory).is_ok());
        let dir = tempfile::tempdir().unwrap();
        let config: CheckpointerConfig =
            serde_json::from_str(&format!(r#"{{"type":"file","path":{:?}}}"#, dir.path())).unwrap();
        assert!(matches!(config, CheckpointerConfig::File { compression_level: 3, .. }));
        assert!(create_checkpointer(&config).is_ok());
    }
}
