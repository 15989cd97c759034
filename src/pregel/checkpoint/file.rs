//! File-based checkpoint storage
//!
//! One directory per superstep under the root. Blobs are zstd-compressed and
//! written through a temp file plus rename, so a reader never sees a torn
//! blob. The empty `COMMIT` file marks a directory complete.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::Checkpointer;
use crate::pregel::error::{PregelError, PregelResult};

const COMMIT_MARKER: &str = "COMMIT";
const BLOB_EXTENSION: &str = "zst";
const DIR_PREFIX: &str = "superstep-";

/// Checkpoint storage on the local filesystem
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    root: PathBuf,
    compression_level: i32,
}

impl FileCheckpointer {
    /// Store checkpoints under `root`, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> PregelResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            compression_level: 3,
        })
    }

    pub fn with_compression(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_dir(&self, superstep: u64) -> PathBuf {
        self.root.join(format!("{}{:010}", DIR_PREFIX, superstep))
    }

    fn blob_path(&self, superstep: u64, name: &str) -> PathBuf {
        self.slot_dir(superstep).join(format!("{}.{}", name, BLOB_EXTENSION))
    }
}

/// Write `data` to a uniquely named temp file beside `path`, sync, then rename
async fn atomic_write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("blob"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn write_blob(&self, superstep: u64, name: &str, data: Vec<u8>) -> PregelResult<()> {
        let dir = self.slot_dir(superstep);
        tokio::fs::create_dir_all(&dir).await?;
        let compressed = zstd::encode_all(data.as_slice(), self.compression_level)
            .map_err(|e| PregelError::checkpoint(superstep, format!("compressing {}: {}", name, e)))?;
        atomic_write_file(&self.blob_path(superstep, name), &compressed).await?;
        Ok(())
    }

    async fn read_blob(&self, superstep: u64, name: &str) -> PregelResult<Option<Vec<u8>>> {
        let compressed = match tokio::fs::read(self.blob_path(superstep, name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = zstd::decode_all(compressed.as_slice())
            .map_err(|e| PregelError::checkpoint(superstep, format!("decompressing {}: {}", name, e)))?;
        Ok(Some(data))
    }

    async fn list_blobs(&self, superstep: u64) -> PregelResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.slot_dir(superstep)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(&format!(".{}", BLOB_EXTENSION)) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn commit(&self, superstep: u64) -> PregelResult<()> {
        let dir = self.slot_dir(superstep);
        tokio::fs::create_dir_all(&dir).await?;
        atomic_write_file(&dir.join(COMMIT_MARKER), b"").await?;
        Ok(())
    }

    async fn list_committed(&self) -> PregelResult<Vec<u64>> {
        let mut committed = Vec::new();
        for superstep in self.list_slots().await? {
            if tokio::fs::try_exists(self.slot_dir(superstep).join(COMMIT_MARKER)).await? {
                committed.push(superstep);
            }
        }
        Ok(committed)
    }

    async fn list_slots(&self) -> PregelResult<Vec<u64>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut slots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(superstep) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix(DIR_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            {
                slots.push(superstep);
            }
        }
        slots.sort_unstable();
        Ok(slots)
    }

    async fn delete(&self, superstep: u64) -> PregelResult<()> {
        match tokio::fs::remove_dir_all(self.slot_dir(superstep)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_compressed() {
        let dir = TempDir::new().unwrap();
        let storage = FileCheckpointer::new(dir.path()).unwrap().with_compression(5);
        let payload = vec![7u8; 4096];
        storage.write_blob(12, "partition-0", payload.clone()).await.unwrap();

        let on_disk = std::fs::metadata(storage.blob_path(12, "partition-0")).unwrap().len();
        assert!(on_disk < payload.len() as u64);
        assert_eq!(storage.read_blob(12, "partition-0").await.unwrap(), Some(payload));
        assert_eq!(storage.read_blob(12, "partition-1").await.unwrap(), None);
        assert_eq!(storage.read_blob(99, "partition-0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_marker_controls_visibility() {
        let dir = TempDir::new().unwrap();
        let storage = FileCheckpointer::new(dir.path()).unwrap();
        storage.write_blob(1, "aggregators", b"{}".to_vec()).await.unwrap();
        storage.write_blob(2, "aggregators", b"{}".to_vec()).await.unwrap();
        assert!(storage.list_committed().await.unwrap().is_empty());

        storage.commit(2).await.unwrap();
        assert_eq!(storage.list_committed().await.unwrap(), vec![2]);
        assert_eq!(storage.list_slots().await.unwrap(), vec![1, 2]);
        assert_eq!(storage.list_blobs(2).await.unwrap(), vec!["aggregators"]);

        storage.delete(2).await.unwrap();
        storage.delete(2).await.unwrap();
        assert!(storage.list_committed().await.unwrap().is_empty());
        assert!(storage.list_blobs(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_blob() {
        let dir = TempDir::new().unwrap();
        let storage = FileCheckpointer::new(dir.path().join("nested")).unwrap();
        storage.write_blob(0, "messages-0-to-1", vec![1]).await.unwrap();
        storage.write_blob(0, "messages-0-to-1", vec![2]).await.unwrap();
        assert_eq!(storage.read_blob(0, "messages-0-to-1").await.unwrap(), Some(vec![2]));
        assert_eq!(storage.list_blobs(0).await.unwrap().len(), 1);
    }
}
