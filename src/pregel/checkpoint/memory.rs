//! In-memory checkpoint storage
//!
//! Useful for tests and single-process jobs. Clones share the same storage,
//! so a test can keep a handle and inspect what the job wrote.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::Checkpointer;
use crate::pregel::error::PregelResult;

#[derive(Debug, Default)]
struct Slot {
    blobs: BTreeMap<String, Vec<u8>>,
    committed: bool,
}

/// Checkpoint storage held in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointer {
    slots: Arc<Mutex<BTreeMap<u64, Slot>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoint slots, committed or not
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes stored
    pub fn size_bytes(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .flat_map(|slot| slot.blobs.values())
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn write_blob(&self, superstep: u64, name: &str, data: Vec<u8>) -> PregelResult<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(superstep).or_default().blobs.insert(name.to_string(), data);
        Ok(())
    }

    async fn read_blob(&self, superstep: u64, name: &str) -> PregelResult<Option<Vec<u8>>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slots.get(&superstep).and_then(|slot| slot.blobs.get(name).cloned()))
    }

    async fn list_blobs(&self, superstep: u64) -> PregelResult<Vec<String>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slots
            .get(&superstep)
            .map(|slot| slot.blobs.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, superstep: u64) -> PregelResult<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(superstep).or_default().committed = true;
        Ok(())
    }

    async fn list_committed(&self) -> PregelResult<Vec<u64>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slots
            .iter()
            .filter(|(_, slot)| slot.committed)
            .map(|(superstep, _)| *superstep)
            .collect())
    }

    async fn list_slots(&self) -> PregelResult<Vec<u64>> {
        Ok(self.slots.lock().unwrap_or_else(|e| e.into_inner()).keys().copied().collect())
    }

    async fn delete(&self, superstep: u64) -> PregelResult<()> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).remove(&superstep);
        Ok(())
    }
}
