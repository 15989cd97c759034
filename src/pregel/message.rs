//! Message buffers, combiners and the batch wire format
//!
//! Every worker has one [`MessageStore`] (write side, drained at the barrier)
//! and one [`Inbox`] (receive side, shared with the transport). A message
//! produced in superstep `n` travels in a [`MessageBatch`] tagged with `n` and
//! becomes readable only when the worker promotes the inbox for `n + 1`.

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::partition::WorkerId;
use super::store::Mutation;
use super::vertex::{Computation, MutationOf};

// =============================================================================
// Combiners
// =============================================================================

/// Folds two messages bound for the same vertex into one.
///
/// Must be commutative and associative.
pub trait MessageCombiner<I, M>: Send + Sync {
    fn combine(&self, target: &I, original: &mut M, other: M);
}

/// Sum messages
#[derive(Debug, Clone, Copy, Default)]
pub struct SumCombiner;

impl<I, M: AddAssign> MessageCombiner<I, M> for SumCombiner {
    fn combine(&self, _target: &I, original: &mut M, other: M) {
        *original += other;
    }
}

/// Keep the smallest message
#[derive(Debug, Clone, Copy, Default)]
pub struct MinCombiner;

impl<I, M: PartialOrd> MessageCombiner<I, M> for MinCombiner {
    fn combine(&self, _target: &I, original: &mut M, other: M) {
        if other < *original {
            *original = other;
        }
    }
}

/// Keep the largest message
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxCombiner;

impl<I, M: PartialOrd> MessageCombiner<I, M> for MaxCombiner {
    fn combine(&self, _target: &I, original: &mut M, other: M) {
        if other > *original {
            *original = other;
        }
    }
}

/// Combiner of a computation
pub type CombinerOf<C> = Arc<dyn MessageCombiner<<C as Computation>::Id, <C as Computation>::Message>>;

/// Group messages by destination, folding with `combiner` when present.
///
/// Destinations come out in id order; per destination, input order is kept.
pub fn group_by_target<I: Ord, M>(
    messages: impl IntoIterator<Item = (I, M)>,
    combiner: Option<&dyn MessageCombiner<I, M>>,
) -> BTreeMap<I, Vec<M>> {
    let mut grouped: BTreeMap<I, Vec<M>> = BTreeMap::new();
    for (target, message) in messages {
        if let Some(combiner) = combiner {
            if let Some(first) = grouped.get_mut(&target).and_then(|slot| slot.first_mut()) {
                combiner.combine(&target, first, message);
                continue;
            }
        }
        grouped.entry(target).or_default().push(message);
    }
    grouped
}

// =============================================================================
// Wire format
// =============================================================================

/// Messages and mutations from one sender to one receiver for one superstep.
///
/// `(superstep, sender, sequence)` identifies a batch; redelivery of the same
/// key is acknowledged but not applied twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch<I, V, E, M> {
    /// Superstep that produced the batch
    pub superstep: u64,
    pub epoch: u64,
    pub sender: WorkerId,
    pub sequence: u32,
    pub messages: Vec<(I, M)>,
    pub mutations: Vec<Mutation<I, V, E>>,
}

impl<I, V, E, M> MessageBatch<I, V, E, M> {
    /// Superstep in which the receiver may read the batch
    pub fn deliver_at(&self) -> u64 {
        self.superstep + 1
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.mutations.is_empty()
    }
}

/// Batch type of a computation
pub type BatchOf<C> = MessageBatch<
    <C as Computation>::Id,
    <C as Computation>::Value,
    <C as Computation>::Edge,
    <C as Computation>::Message,
>;

/// What the receiver did with a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    /// Already held; not applied again
    Duplicate,
    /// Sent under an older epoch; discarded
    Stale,
}

/// Per-batch acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub receiver: WorkerId,
    pub superstep: u64,
    pub sequence: u32,
    pub status: AckStatus,
}

// =============================================================================
// Inbox
// =============================================================================

type BatchKey = (WorkerId, u32);

struct InboxState<C: Computation> {
    epoch: u64,
    pending: BTreeMap<u64, BTreeMap<BatchKey, BatchOf<C>>>,
}

/// Receive side of a worker, written by the transport
pub struct Inbox<C: Computation> {
    owner: WorkerId,
    state: Mutex<InboxState<C>>,
}

impl<C: Computation> Inbox<C> {
    pub fn new(owner: WorkerId) -> Self {
        Self {
            owner,
            state: Mutex::new(InboxState {
                epoch: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    /// Store a batch for its delivery superstep
    pub fn accept(&self, batch: BatchOf<C>) -> BatchAck {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut ack = BatchAck {
            receiver: self.owner,
            superstep: batch.superstep,
            sequence: batch.sequence,
            status: AckStatus::Accepted,
        };

        if batch.epoch != state.epoch {
            tracing::debug!(
                worker = %self.owner,
                sender = %batch.sender,
                batch_epoch = batch.epoch,
                epoch = state.epoch,
                "discarding batch from another epoch"
            );
            ack.status = AckStatus::Stale;
            return ack;
        }

        let slot = state.pending.entry(batch.deliver_at()).or_default();
        let key = (batch.sender, batch.sequence);
        if slot.contains_key(&key) {
            ack.status = AckStatus::Duplicate;
        } else {
            slot.insert(key, batch);
        }
        ack
    }

    /// Remove the batches readable in `superstep`, in (sender, sequence) order.
    ///
    /// Anything pending for an earlier superstep is discarded.
    pub fn take(&self, superstep: u64) -> Vec<BatchOf<C>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let later = state.pending.split_off(&superstep);
        let earlier = std::mem::replace(&mut state.pending, later);
        if !earlier.is_empty() {
            tracing::warn!(worker = %self.owner, superstep, "discarding batches for past supersteps");
        }
        state
            .pending
            .remove(&superstep)
            .map(|batches| batches.into_values().collect())
            .unwrap_or_default()
    }

    /// Drop everything and accept only batches of `epoch` from now on
    pub fn reset(&self, epoch: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.epoch = epoch;
        state.pending.clear();
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).epoch
    }

    /// Number of batches held, across supersteps
    pub fn pending_batches(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.values().map(BTreeMap::len).sum()
    }
}

// =============================================================================
// Message store
// =============================================================================

/// Read buffer of a worker: the messages for the current superstep, by sender
pub type ReadBuffer<C> = BTreeMap<WorkerId, Vec<(<C as Computation>::Id, <C as Computation>::Message)>>;

/// Double-buffered message store of one worker
pub struct MessageStore<C: Computation> {
    outgoing: Mutex<Vec<(C::Id, C::Message)>>,
    sent: AtomicU64,
    current: ReadBuffer<C>,
    combiner: Option<CombinerOf<C>>,
}

impl<C: Computation> MessageStore<C> {
    pub fn new(combiner: Option<CombinerOf<C>>) -> Self {
        Self {
            outgoing: Mutex::new(Vec::new()),
            sent: AtomicU64::new(0),
            current: BTreeMap::new(),
            combiner,
        }
    }

    /// Queue one message for the next superstep. Safe from any task.
    pub fn send(&self, target: C::Id, message: C::Message) {
        let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        outgoing.push((target, message));
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue a task's messages, keeping their order
    pub fn send_all(&self, messages: Vec<(C::Id, C::Message)>) {
        let count = messages.len() as u64;
        let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        outgoing.extend(messages);
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Messages sent since the last drain
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Empty the write buffer for routing.
    ///
    /// With a combiner the result holds one message per destination. Returns
    /// the messages and how many sends produced them.
    pub fn drain_outgoing(&self) -> (Vec<(C::Id, C::Message)>, u64) {
        let messages = std::mem::take(&mut *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()));
        let sent = self.sent.swap(0, Ordering::Relaxed);
        let messages = match self.combiner.as_deref() {
            Some(combiner) => group_by_target(messages, Some(combiner))
                .into_iter()
                .flat_map(|(target, messages)| messages.into_iter().map(move |m| (target.clone(), m)))
                .collect(),
            None => messages,
        };
        (messages, sent)
    }

    /// Add received batches to the read buffer for the next compute pass.
    ///
    /// Returns the mutations carried by the batches, in batch order.
    pub fn promote(&mut self, batches: Vec<BatchOf<C>>) -> Vec<MutationOf<C>> {
        let mut mutations = Vec::new();
        for batch in batches {
            self.current.entry(batch.sender).or_default().extend(batch.messages);
            mutations.extend(batch.mutations);
        }
        mutations
    }

    /// Refill the read buffer from a checkpoint
    pub fn restore(&mut self, sender: WorkerId, messages: Vec<(C::Id, C::Message)>) {
        self.current.entry(sender).or_default().extend(messages);
    }

    pub fn current(&self) -> &ReadBuffer<C> {
        &self.current
    }

    pub fn current_len(&self) -> usize {
        self.current.values().map(Vec::len).sum()
    }

    /// Hand the read buffer to compute, grouped by destination
    pub fn take_current(&mut self) -> BTreeMap<C::Id, Vec<C::Message>> {
        let current = std::mem::take(&mut self.current);
        group_by_target(current.into_values().flatten(), self.combiner.as_deref())
    }

    /// Forget both buffers
    pub fn clear(&mut self) {
        self.current.clear();
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.sent.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pregel::error::PregelResult;
    use crate::pregel::vertex::{ComputeContext, Messages, Vertex};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Computation for Noop {
        type Id = u64;
        type Value = f64;
        type Edge = ();
        type Message = f64;

        async fn compute(
            &self,
            _vertex: &mut Vertex<u64, f64, ()>,
            _messages: Messages<f64>,
            _ctx: &mut ComputeContext<'_, Self>,
        ) -> PregelResult<()> {
            Ok(())
        }
    }

    fn batch(superstep: u64, epoch: u64, sender: u32, sequence: u32, messages: Vec<(u64, f64)>) -> BatchOf<Noop> {
        MessageBatch {
            superstep,
            epoch,
            sender: WorkerId(sender),
            sequence,
            messages,
            mutations: Vec::new(),
        }
    }

    #[test]
    fn test_group_by_target() {
        let messages = vec![(2u64, 1.0), (1, 5.0), (2, 3.0)];
        let plain = group_by_target(messages.clone(), None);
        assert_eq!(plain[&2], vec![1.0, 3.0]);
        assert_eq!(plain[&1], vec![5.0]);

        let summed = group_by_target(messages.clone(), Some(&SumCombiner));
        assert_eq!(summed[&2], vec![4.0]);

        let min = group_by_target(messages, Some(&MinCombiner));
        assert_eq!(min[&2], vec![1.0]);
        let max = group_by_target(vec![(1u64, 3), (1, 9), (1, 4)], Some(&MaxCombiner));
        assert_eq!(max[&1], vec![9]);
    }

    #[test]
    fn test_inbox_one_superstep_latency() {
        let inbox = Inbox::<Noop>::new(WorkerId(0));
        inbox.accept(batch(4, 0, 1, 0, vec![(1, 1.0)]));
        assert!(inbox.take(4).is_empty());
        assert_eq!(inbox.take(5).len(), 1);
        assert_eq!(inbox.pending_batches(), 0);
    }

    #[test]
    fn test_inbox_deduplicates() {
        let inbox = Inbox::<Noop>::new(WorkerId(0));
        assert_eq!(inbox.accept(batch(0, 0, 1, 0, vec![(1, 1.0)])).status, AckStatus::Accepted);
        assert_eq!(inbox.accept(batch(0, 0, 1, 0, vec![(1, 1.0)])).status, AckStatus::Duplicate);
        assert_eq!(inbox.accept(batch(0, 0, 1, 1, vec![(1, 2.0)])).status, AckStatus::Accepted);
        assert_eq!(inbox.accept(batch(0, 0, 2, 0, vec![(1, 3.0)])).status, AckStatus::Accepted);

        let batches = inbox.take(1);
        let order: Vec<_> = batches.iter().map(|b| (b.sender, b.sequence)).collect();
        assert_eq!(order, vec![(WorkerId(1), 0), (WorkerId(1), 1), (WorkerId(2), 0)]);
    }

    #[test]
    fn test_inbox_rejects_stale_epoch() {
        let inbox = Inbox::<Noop>::new(WorkerId(0));
        inbox.accept(batch(2, 0, 1, 0, vec![(1, 1.0)]));
        inbox.reset(1);
        assert_eq!(inbox.pending_batches(), 0);
        assert_eq!(inbox.accept(batch(2, 0, 1, 0, vec![(1, 1.0)])).status, AckStatus::Stale);
        assert_eq!(inbox.accept(batch(2, 1, 1, 0, vec![(1, 1.0)])).status, AckStatus::Accepted);
        assert_eq!(inbox.epoch(), 1);
    }

    #[test]
    fn test_inbox_discards_past_supersteps() {
        let inbox = Inbox::<Noop>::new(WorkerId(0));
        inbox.accept(batch(1, 0, 1, 0, vec![(1, 1.0)]));
        inbox.accept(batch(3, 0, 1, 0, vec![(1, 1.0)]));
        assert!(inbox.take(3).is_empty());
        assert_eq!(inbox.take(4).len(), 1);
    }

    #[test]
    fn test_store_send_and_drain() {
        let store = MessageStore::<Noop>::new(None);
        store.send(3, 1.0);
        store.send_all(vec![(3, 2.0), (1, 4.0)]);
        assert_eq!(store.sent_count(), 3);

        let (messages, sent) = store.drain_outgoing();
        assert_eq!(sent, 3);
        assert_eq!(messages, vec![(3, 1.0), (3, 2.0), (1, 4.0)]);
        assert_eq!(store.sent_count(), 0);
    }

    #[test]
    fn test_store_combines_on_drain_and_take() {
        let mut store = MessageStore::<Noop>::new(Some(Arc::new(SumCombiner)));
        store.send_all(vec![(3, 1.0), (3, 2.0), (1, 4.0)]);
        let (messages, sent) = store.drain_outgoing();
        assert_eq!(sent, 3);
        assert_eq!(messages, vec![(1, 4.0), (3, 3.0)]);

        store.promote(vec![
            batch(0, 0, 0, 0, vec![(3, 3.0)]),
            batch(0, 0, 1, 0, vec![(3, 0.5)]),
        ]);
        assert_eq!(store.current_len(), 2);
        let inbox = store.take_current();
        assert_eq!(inbox[&3], vec![3.5]);
        assert_eq!(store.current_len(), 0);
    }

    #[test]
    fn test_promote_returns_mutations() {
        let mut store = MessageStore::<Noop>::new(None);
        let mut with_mutation = batch(0, 0, 1, 0, vec![]);
        with_mutation.mutations.push(Mutation::RemoveVertex { id: 9 });
        let mutations = store.promote(vec![with_mutation]);
        assert_eq!(mutations, vec![Mutation::RemoveVertex { id: 9 }]);
        store.restore(WorkerId(5), vec![(1, 1.0)]);
        assert_eq!(store.current().len(), 1);
        store.clear();
        assert_eq!(store.current_len(), 0);
    }
}
