//! Worker-to-worker message transport
//!
//! A transport moves [`MessageBatch`](super::message::MessageBatch)es into the
//! target worker's [`Inbox`] and returns one acknowledgement per batch. An
//! error means the batch must be treated as not delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::{PregelError, PregelResult};
use super::fault::{Fault, FaultInjector};
use super::message::{AckStatus, BatchAck, BatchOf, Inbox};
use super::partition::WorkerId;
use super::vertex::Computation;

/// Delivers batches between workers
#[async_trait]
pub trait MessageTransport<C: Computation>: Send + Sync {
    /// Deliver one batch to `target` and wait for its acknowledgement
    async fn deliver(&self, target: WorkerId, batch: BatchOf<C>) -> PregelResult<BatchAck>;

    /// Start receiving for `worker`
    async fn register(&self, worker: WorkerId, inbox: Arc<Inbox<C>>);

    /// Stop receiving for `worker`; later deliveries to it fail
    async fn unregister(&self, worker: WorkerId);
}

/// In-process transport over shared inboxes
pub struct LocalTransport<C: Computation> {
    inboxes: RwLock<HashMap<WorkerId, Arc<Inbox<C>>>>,
    faults: Option<Arc<FaultInjector>>,
    delivered_batches: AtomicU64,
    delivered_messages: AtomicU64,
}

impl<C: Computation> LocalTransport<C> {
    pub fn new() -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
            faults: None,
            delivered_batches: AtomicU64::new(0),
            delivered_messages: AtomicU64::new(0),
        }
    }

    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Batches accepted by a receiver (duplicates and stale batches excluded)
    pub fn delivered_batches(&self) -> u64 {
        self.delivered_batches.load(Ordering::Relaxed)
    }

    /// Messages inside accepted batches
    pub fn delivered_messages(&self) -> u64 {
        self.delivered_messages.load(Ordering::Relaxed)
    }

    pub async fn registered_workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<_> = self.inboxes.read().await.keys().copied().collect();
        workers.sort_unstable();
        workers
    }
}

impl<C: Computation> Default for LocalTransport<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Computation> MessageTransport<C> for LocalTransport<C> {
    async fn deliver(&self, target: WorkerId, batch: BatchOf<C>) -> PregelResult<BatchAck> {
        if let Some(faults) = &self.faults {
            let fault = Fault::DropBatches {
                target,
                superstep: batch.superstep,
            };
            if faults.trigger(&fault) {
                return Err(PregelError::Transport {
                    target,
                    reason: "batch dropped".to_string(),
                });
            }
        }

        let inbox = {
            let inboxes = self.inboxes.read().await;
            inboxes.get(&target).cloned()
        };
        let inbox = inbox.ok_or_else(|| PregelError::Transport {
            target,
            reason: "no such worker".to_string(),
        })?;

        let messages = batch.messages.len() as u64;
        let ack = inbox.accept(batch);
        if ack.status == AckStatus::Accepted {
            self.delivered_batches.fetch_add(1, Ordering::Relaxed);
            self.delivered_messages.fetch_add(messages, Ordering::Relaxed);
        }
        Ok(ack)
    }

    async fn register(&self, worker: WorkerId, inbox: Arc<Inbox<C>>) {
        self.inboxes.write().await.insert(worker, inbox);
    }

    async fn unregister(&self, worker: WorkerId) {
        self.inboxes.write().await.remove(&worker);
    }
}
