//! Worker: owns partitions and runs supersteps on command
//!
//! ```text
//! IDLE ──StartSuperstep──▶ APPLY_MUTATIONS ──▶ COMPUTING ──▶ BARRIER_WAIT ──▶ IDLE
//!   │                       (promote inbox,      (pool of      (flush batches,
//!   │                        checkpoint)          tasks)        report)
//!   └──Halt──▶ TERMINATED
//! ```
//!
//! Each superstep the owned partitions are moved into compute tasks, one
//! partition per task, and a semaphore bounds how many run at once. A failure
//! in any task fails the whole superstep: no partial result is reported.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use super::aggregator::AggregatorPartials;
use super::checkpoint::CheckpointManager;
use super::config::{ActivationPolicy, PregelConfig};
use super::error::{PregelError, PregelResult};
use super::fault::{Fault, FaultInjector};
use super::io::{VertexReader, VertexWriter};
use super::message::{AckStatus, BatchAck, BatchOf, CombinerOf, Inbox, MessageBatch, MessageStore};
use super::partition::{verify_determinism, PartitionAssignment, PartitionId, Partitioner, WorkerId};
use super::protocol::{SuperstepGlobals, SuperstepReport, WorkerCommand, WorkerEndpoint, WorkerEvent};
use super::store::{MutationStats, Partition, PartitionStore};
use super::transport::MessageTransport;
use super::vertex::{Computation, ComputeContext, Messages, MutationOf, Outbox};

/// Command channel depth per worker
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Worker lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    ApplyMutations,
    Computing,
    BarrierWait,
    Terminated,
}

/// Everything a worker shares with the rest of the job
pub struct WorkerEnv<C: Computation> {
    pub computation: Arc<C>,
    pub config: Arc<PregelConfig>,
    pub partitioner: Arc<dyn Partitioner<C::Id>>,
    pub combiner: Option<CombinerOf<C>>,
    pub transport: Arc<dyn MessageTransport<C>>,
    pub checkpoints: Option<CheckpointManager>,
    pub reader: Arc<dyn VertexReader<C::Id, C::Value, C::Edge>>,
    pub writer: Arc<dyn VertexWriter<C::Id, C::Value, C::Edge>>,
    pub faults: Option<Arc<FaultInjector>>,
    pub events: mpsc::Sender<WorkerEvent>,
}

impl<C: Computation> Clone for WorkerEnv<C> {
    fn clone(&self) -> Self {
        Self {
            computation: Arc::clone(&self.computation),
            config: Arc::clone(&self.config),
            partitioner: Arc::clone(&self.partitioner),
            combiner: self.combiner.clone(),
            transport: Arc::clone(&self.transport),
            checkpoints: self.checkpoints.clone(),
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
            faults: self.faults.clone(),
            events: self.events.clone(),
        }
    }
}

/// Output of one compute task
struct PartitionOutput<C: Computation> {
    partition: Partition<C::Id, C::Value, C::Edge>,
    outbox: Outbox<C>,
    partials: AggregatorPartials,
    mutations: Vec<MutationOf<C>>,
    computed: u64,
}

/// One worker of the job
pub struct Worker<C: Computation> {
    id: WorkerId,
    env: WorkerEnv<C>,
    phase: WorkerPhase,
    epoch: u64,
    assignment: Option<PartitionAssignment>,
    store: PartitionStore<C::Id, C::Value, C::Edge>,
    messages: MessageStore<C>,
    inbox: Arc<Inbox<C>>,
    /// Set when an aborted or failed superstep left state unusable until the
    /// next recovery
    dirty: bool,
}

impl<C: Computation> Worker<C> {
    pub fn new(id: WorkerId, env: WorkerEnv<C>) -> Self {
        let store = PartitionStore::new(id, Arc::clone(&env.partitioner));
        let messages = MessageStore::new(env.combiner.clone());
        Self {
            id,
            env,
            phase: WorkerPhase::Idle,
            epoch: 0,
            assignment: None,
            store,
            messages,
            inbox: Arc::new(Inbox::new(id)),
            dirty: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    /// Register with the transport and the Master, then serve commands until
    /// shutdown
    pub fn spawn(id: WorkerId, env: WorkerEnv<C>) -> JoinHandle<()> {
        let span = tracing::info_span!("worker", worker = %id);
        tokio::spawn(
            async move {
                let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
                let mut worker = Worker::new(id, env);
                worker
                    .env
                    .transport
                    .register(id, Arc::clone(&worker.inbox))
                    .await;

                let endpoint = WorkerEndpoint {
                    worker: id,
                    address: format!("local://{}", id),
                    commands: tx,
                };
                if worker.emit(WorkerEvent::Registered(endpoint)).await {
                    worker.run(rx).await;
                }

                worker.env.transport.unregister(id).await;
                tracing::debug!("worker stopped");
            }
            .instrument(span),
        )
    }

    async fn emit(&self, event: WorkerEvent) -> bool {
        if self.env.events.send(event).await.is_err() {
            tracing::warn!(worker = %self.id, "master is gone; stopping");
            return false;
        }
        true
    }

    async fn fail(&mut self, superstep: Option<u64>, error: PregelError) -> bool {
        tracing::warn!(worker = %self.id, epoch = self.epoch, ?superstep, %error, "reporting failure");
        self.dirty = true;
        self.emit(WorkerEvent::Failed {
            worker: self.id,
            epoch: self.epoch,
            superstep,
            error,
        })
        .await
    }

    fn fault(&self, fault: Fault) -> bool {
        self.env.faults.as_ref().is_some_and(|f| f.trigger(&fault))
    }

    async fn run(&mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        let mut pending = None;
        loop {
            let command = match pending.take() {
                Some(command) => command,
                None => match commands.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };

            let keep_running = match command {
                WorkerCommand::Shutdown => break,
                WorkerCommand::AssignPartitions { epoch, assignment } => {
                    self.epoch = epoch;
                    match self.load(assignment).await {
                        Ok((vertices, edges)) => {
                            self.emit(WorkerEvent::Loaded {
                                worker: self.id,
                                epoch,
                                vertices,
                                edges,
                            })
                            .await
                        }
                        Err(e) => self.fail(None, e).await,
                    }
                }
                WorkerCommand::RecoverFrom {
                    epoch,
                    superstep,
                    assignment,
                } => {
                    self.epoch = epoch;
                    match self.recover(superstep, assignment).await {
                        Ok((vertices, edges)) => {
                            self.emit(WorkerEvent::Recovered {
                                worker: self.id,
                                epoch,
                                vertices,
                                edges,
                            })
                            .await
                        }
                        Err(e) => self.fail(superstep, e).await,
                    }
                }
                WorkerCommand::StartSuperstep {
                    epoch,
                    checkpoint,
                    globals,
                } => {
                    let superstep = globals.superstep;
                    if epoch != self.epoch {
                        tracing::debug!(worker = %self.id, epoch, current = self.epoch, "ignoring stale superstep");
                        continue;
                    }
                    if self.dirty {
                        let error = PregelError::worker_failed(self.id, "state lost by an earlier failure");
                        if !self.fail(Some(superstep), error).await {
                            break;
                        }
                        continue;
                    }
                    if self.fault(Fault::CrashWorker {
                        worker: self.id,
                        superstep,
                    }) {
                        tracing::error!(worker = %self.id, superstep, "worker crashed");
                        self.phase = WorkerPhase::Terminated;
                        return;
                    }

                    // A new command while computing aborts the superstep.
                    let result = tokio::select! {
                        result = self.execute_superstep(checkpoint, globals) => Some(result),
                        next = commands.recv() => {
                            pending = next;
                            None
                        }
                    };
                    match result {
                        Some(Ok(report)) => self.emit(WorkerEvent::SuperstepComplete(report)).await,
                        Some(Err(e)) => self.fail(Some(superstep), e).await,
                        None => {
                            tracing::warn!(worker = %self.id, superstep, "superstep aborted");
                            self.dirty = true;
                            self.phase = WorkerPhase::Idle;
                            if pending.is_none() {
                                break;
                            }
                            true
                        }
                    }
                }
                WorkerCommand::Halt { epoch, superstep } => {
                    if epoch != self.epoch {
                        continue;
                    }
                    match self.finish().await {
                        Ok(vertices_written) => {
                            tracing::info!(worker = %self.id, superstep, vertices_written, "results written");
                            self.emit(WorkerEvent::Finished {
                                worker: self.id,
                                epoch,
                                vertices_written,
                            })
                            .await
                        }
                        Err(e) => self.fail(Some(superstep), e).await,
                    }
                }
            };

            if !keep_running {
                break;
            }
        }
        self.phase = WorkerPhase::Terminated;
    }

    // =========================================================================
    // Load and recovery
    // =========================================================================

    fn reset(&mut self, assignment: &PartitionAssignment) {
        let owned = assignment.partitions_of(self.id);
        self.inbox.reset(self.epoch);
        self.messages.clear();
        self.store.reset(&owned);
        self.dirty = false;
        self.phase = WorkerPhase::Idle;
    }

    /// Read the owned vertices from the input
    async fn load(&mut self, assignment: PartitionAssignment) -> PregelResult<(u64, u64)> {
        self.reset(&assignment);
        let owned: BTreeSet<PartitionId> = assignment.partitions_of(self.id).into_iter().collect();
        let partitioner = Arc::clone(&self.env.partitioner);
        let owns = move |id: &C::Id| owned.contains(&partitioner.assign(id));

        let vertices = self.env.reader.read(&owns).await?;
        verify_determinism(self.env.partitioner.as_ref(), vertices.iter().map(|v| v.id()))?;
        for vertex in vertices {
            self.store.insert(vertex)?;
        }
        self.assignment = Some(assignment);

        let counts = (self.store.vertex_count() as u64, self.store.edge_count() as u64);
        tracing::debug!(
            worker = %self.id,
            partitions = self.store.owned_partitions().len(),
            vertices = counts.0,
            edges = counts.1,
            "partitions loaded"
        );
        Ok(counts)
    }

    /// Reload state from checkpoint `superstep`, or from the input if `None`
    async fn recover(&mut self, superstep: Option<u64>, assignment: PartitionAssignment) -> PregelResult<(u64, u64)> {
        let Some(superstep) = superstep else {
            return self.load(assignment).await;
        };
        let checkpoints = self
            .env
            .checkpoints
            .clone()
            .ok_or_else(|| PregelError::checkpoint(superstep, "no checkpoint storage configured"))?;

        self.reset(&assignment);
        for partition in self.store.owned_partitions() {
            let restored = checkpoints.read_partition(superstep, partition).await?;
            self.store.install(restored)?;
        }

        let mut restored_messages = 0usize;
        for (sender, messages) in checkpoints.read_messages::<C::Id, C::Message>(superstep).await? {
            let mine: Vec<_> = messages
                .into_iter()
                .filter(|(target, _)| self.store.owns_vertex(target))
                .collect();
            restored_messages += mine.len();
            self.messages.restore(sender, mine);
        }
        self.assignment = Some(assignment);

        tracing::info!(
            worker = %self.id,
            epoch = self.epoch,
            superstep,
            vertices = self.store.vertex_count(),
            messages = restored_messages,
            "restored from checkpoint"
        );
        Ok((self.store.vertex_count() as u64, self.store.edge_count() as u64))
    }

    // =========================================================================
    // Superstep
    // =========================================================================

    async fn execute_superstep(&mut self, checkpoint: bool, globals: SuperstepGlobals) -> PregelResult<SuperstepReport> {
        let started = Instant::now();
        let superstep = globals.superstep;
        let config = Arc::clone(&self.env.config);

        // Exclusive phase: no compute task exists while the graph changes.
        self.phase = WorkerPhase::ApplyMutations;
        let batches = self.inbox.take(superstep);
        let mutations = self.messages.promote(batches);
        self.store.stage(mutations);
        let (touched, stats) = self.store.apply_mutations(config.create_missing_vertices);
        if stats != MutationStats::default() {
            tracing::debug!(worker = %self.id, superstep, ?stats, "mutations applied");
        }
        // The checkpoint must hold vertices already woken by mutations.
        if config.activation == ActivationPolicy::MessagesOrMutations {
            for id in &touched {
                if let Some(vertex) = self.store.get_mut(id) {
                    vertex.wake();
                }
            }
        }

        if checkpoint {
            let event = match self.write_checkpoint(superstep).await {
                Ok(()) => WorkerEvent::CheckpointAck {
                    worker: self.id,
                    epoch: self.epoch,
                    superstep,
                },
                Err(e) => {
                    tracing::warn!(worker = %self.id, superstep, error = %e, "checkpoint write failed");
                    WorkerEvent::CheckpointFailed {
                        worker: self.id,
                        epoch: self.epoch,
                        superstep,
                        reason: e.to_string(),
                    }
                }
            };
            if !self.emit(event).await {
                return Err(PregelError::MasterUnavailable("event channel closed".to_string()));
            }
        }

        // Route this superstep's messages to their partitions.
        let messages_delivered = self.messages.current_len() as u64;
        let mut inboxes: BTreeMap<PartitionId, BTreeMap<C::Id, Vec<C::Message>>> = BTreeMap::new();
        let mut dropped = 0usize;
        for (target, messages) in self.messages.take_current() {
            if !self.store.ensure_vertex(&target, config.create_missing_vertices) {
                dropped += messages.len();
                continue;
            }
            inboxes
                .entry(self.store.partition_of(&target))
                .or_default()
                .insert(target, messages);
        }
        if dropped > 0 {
            tracing::warn!(worker = %self.id, superstep, dropped, "dropped messages to missing vertices");
        }

        self.phase = WorkerPhase::Computing;
        let definitions = Arc::clone(&globals.definitions);
        let outputs = self.compute(superstep, globals, inboxes).await?;

        let mut partials = AggregatorPartials::new(definitions);
        let mut computed = 0;
        let mut mutations = Vec::new();
        for output in outputs {
            computed += output.computed;
            partials.merge(output.partials)?;
            self.messages.send_all(output.outbox);
            mutations.extend(output.mutations);
            self.store.return_partitions([output.partition]);
        }

        self.phase = WorkerPhase::BarrierWait;
        let mutations_sent = mutations.len() as u64;
        let messages_sent = self.flush(superstep, mutations).await?;

        let report = SuperstepReport {
            worker: Some(self.id),
            epoch: self.epoch,
            superstep,
            vertex_count: self.store.vertex_count() as u64,
            edge_count: self.store.edge_count() as u64,
            halted_count: self.store.halted_count() as u64,
            computed_count: computed,
            messages_sent,
            mutations_sent,
            messages_delivered,
            aggregates: partials.into_values(),
        };
        self.phase = WorkerPhase::Idle;

        tracing::debug!(
            worker = %self.id,
            superstep,
            computed,
            messages_sent,
            halted = report.halted_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "superstep complete"
        );
        Ok(report)
    }

    /// Run compute over every owned partition on the bounded task pool.
    ///
    /// Outputs come back in partition order.
    async fn compute(
        &mut self,
        superstep: u64,
        globals: SuperstepGlobals,
        mut inboxes: BTreeMap<PartitionId, BTreeMap<C::Id, Vec<C::Message>>>,
    ) -> PregelResult<Vec<PartitionOutput<C>>> {
        let semaphore = Arc::new(Semaphore::new(self.env.config.compute_threads.max(1)));
        let globals = Arc::new(globals);
        let mut fail_next = self.fault(Fault::FailCompute {
            worker: self.id,
            superstep,
        });

        let mut tasks = JoinSet::new();
        for partition in self.store.take_partitions() {
            let inbox = inboxes.remove(&partition.id()).unwrap_or_default();
            let computation = Arc::clone(&self.env.computation);
            let globals = Arc::clone(&globals);
            let semaphore = Arc::clone(&semaphore);
            let inject_failure = fail_next && !partition.is_empty();
            if inject_failure {
                fail_next = false;
            }
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| PregelError::ComputePanic {
                        message: "compute pool closed".to_string(),
                    })?;
                compute_partition(computation, partition, inbox, globals, inject_failure).await
            });
        }

        let mut outputs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let output = match joined {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    self.dirty = true;
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    self.dirty = true;
                    return Err(PregelError::ComputePanic { message: e.to_string() });
                }
            };
            outputs.push(output);
        }
        outputs.sort_by_key(|o| o.partition.id());
        Ok(outputs)
    }

    /// Send the write buffer and staged mutations to their owners.
    ///
    /// Returns how many messages compute sent.
    async fn flush(&mut self, superstep: u64, mutations: Vec<MutationOf<C>>) -> PregelResult<u64> {
        let assignment = self
            .assignment
            .clone()
            .ok_or_else(|| PregelError::worker_failed(self.id, "no partition assignment"))?;
        let (messages, sent) = self.messages.drain_outgoing();

        let mut routed: BTreeMap<WorkerId, (Vec<(C::Id, C::Message)>, Vec<MutationOf<C>>)> = BTreeMap::new();
        for (target, message) in messages {
            let owner = self.owner_of(&assignment, &target)?;
            routed.entry(owner).or_default().0.push((target, message));
        }
        for mutation in mutations {
            let owner = self.owner_of(&assignment, mutation.vertex())?;
            routed.entry(owner).or_default().1.push(mutation);
        }

        let max_batch = self.env.config.max_batch_messages.max(1);
        let mut batches = Vec::new();
        for (target, (messages, mutations)) in routed {
            let mut chunks: Vec<Vec<(C::Id, C::Message)>> = Vec::new();
            let mut messages = messages.into_iter().peekable();
            while messages.peek().is_some() {
                chunks.push(messages.by_ref().take(max_batch).collect());
            }
            if chunks.is_empty() {
                chunks.push(Vec::new());
            }
            let mut mutations = Some(mutations);
            for (sequence, chunk) in chunks.into_iter().enumerate() {
                let batch: BatchOf<C> = MessageBatch {
                    superstep,
                    epoch: self.epoch,
                    sender: self.id,
                    sequence: sequence as u32,
                    messages: chunk,
                    mutations: mutations.take().unwrap_or_default(),
                };
                batches.push((target, batch));
            }
        }

        let batch_count = batches.len();
        try_join_all(
            batches
                .into_iter()
                .map(|(target, batch)| self.deliver_with_retry(target, batch)),
        )
        .await?;
        tracing::debug!(worker = %self.id, superstep, batches = batch_count, sent, "flushed");
        Ok(sent)
    }

    fn owner_of(&self, assignment: &PartitionAssignment, vertex: &C::Id) -> PregelResult<WorkerId> {
        let partition = self.env.partitioner.assign(vertex);
        assignment.owner(partition).ok_or_else(|| PregelError::PartitionOutOfRange {
            vertex: format!("{:?}", vertex),
            partition,
            partition_count: assignment.partition_count(),
        })
    }

    async fn deliver_with_retry(&self, target: WorkerId, batch: BatchOf<C>) -> PregelResult<BatchAck> {
        let policy = &self.env.config.transport_retry;
        let mut attempt = 0;
        loop {
            let result = self.env.transport.deliver(target, batch.clone()).await;
            let error = match result {
                Ok(ack) if ack.status != AckStatus::Stale => return Ok(ack),
                Ok(_) => PregelError::Transport {
                    target,
                    reason: "receiver is in another epoch".to_string(),
                },
                Err(e) => e,
            };
            if attempt >= policy.max_retries {
                return Err(error);
            }
            attempt += 1;
            tracing::warn!(
                worker = %self.id,
                target = %target,
                superstep = batch.superstep,
                sequence = batch.sequence,
                attempt,
                error = %error,
                "retrying batch delivery"
            );
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }
    }

    async fn write_checkpoint(&self, superstep: u64) -> PregelResult<()> {
        let checkpoints = self
            .env
            .checkpoints
            .as_ref()
            .ok_or_else(|| PregelError::checkpoint(superstep, "no checkpoint storage configured"))?;
        if self.fault(Fault::FailCheckpointWrite {
            worker: self.id,
            superstep,
        }) {
            return Err(PregelError::checkpoint(superstep, "injected write failure"));
        }

        for partition in self.store.owned_partitions() {
            if let Some(partition) = self.store.partition(partition) {
                checkpoints.write_partition(superstep, partition).await?;
            }
        }
        for (sender, messages) in self.messages.current() {
            checkpoints.write_messages(superstep, *sender, self.id, messages).await?;
        }
        tracing::debug!(worker = %self.id, superstep, "checkpoint written");
        Ok(())
    }

    /// Hand the final vertices to the writer
    async fn finish(&mut self) -> PregelResult<u64> {
        let vertices = self.store.drain_vertices();
        let count = vertices.len() as u64;
        self.env.writer.write(self.id, vertices).await?;
        self.phase = WorkerPhase::Terminated;
        Ok(count)
    }
}

/// Compute every scheduled vertex of one partition.
///
/// A vertex runs if it is active or has messages; messages wake it.
async fn compute_partition<C: Computation>(
    computation: Arc<C>,
    mut partition: Partition<C::Id, C::Value, C::Edge>,
    mut inbox: BTreeMap<C::Id, Vec<C::Message>>,
    globals: Arc<SuperstepGlobals>,
    inject_failure: bool,
) -> PregelResult<PartitionOutput<C>> {
    let mut outbox: Outbox<C> = Vec::new();
    let mut partials = AggregatorPartials::new(Arc::clone(&globals.definitions));
    let mut mutations = Vec::new();
    let mut computed = 0;

    for vertex in partition.vertices_mut() {
        let incoming = inbox.remove(vertex.id());
        if incoming.is_none() && vertex.is_halted() {
            continue;
        }
        if inject_failure {
            return Err(PregelError::vertex_error(vertex.id(), "injected compute failure"));
        }
        vertex.wake();

        let mut ctx = ComputeContext::<C>::new(&globals, &mut outbox, &mut partials, &mut mutations);
        computation
            .compute(vertex, Messages::new(incoming.unwrap_or_default()), &mut ctx)
            .await?;
        if ctx.take_halt_vote() {
            vertex.halt();
        }
        computed += 1;
    }

    Ok(PartitionOutput {
        partition,
        outbox,
        partials,
        mutations,
        computed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pregel::aggregator::{AggregateValue, AggregatorDef, AggregatorRegistry};
    use crate::pregel::vertex::{Edge, Vertex};
    use async_trait::async_trait;

    /// Adds incoming messages to its value, forwards the new value and halts
    struct Accumulate;

    #[async_trait]
    impl Computation for Accumulate {
        type Id = u64;
        type Value = u64;
        type Edge = ();
        type Message = u64;

        async fn compute(
            &self,
            vertex: &mut Vertex<u64, u64, ()>,
            messages: Messages<u64>,
            ctx: &mut ComputeContext<'_, Self>,
        ) -> PregelResult<()> {
            *vertex.value_mut() += messages.sum::<u64>();
            ctx.aggregate("computed", 1i64)?;
            ctx.send_message_to_all_edges(vertex, *vertex.value());
            ctx.vote_to_halt();
            Ok(())
        }
    }

    fn globals(superstep: u64) -> Arc<SuperstepGlobals> {
        let mut registry = AggregatorRegistry::new();
        registry.register("computed", AggregatorDef::long_sum()).unwrap();
        Arc::new(SuperstepGlobals {
            superstep,
            total_vertices: 3,
            total_edges: 2,
            aggregates: registry.snapshot(),
            definitions: registry.definitions(),
        })
    }

    fn partition() -> Partition<u64, u64, ()> {
        let mut partition = Partition::new(0);
        partition.insert(Vertex::with_edges(1, 10, vec![Edge::new(2, ())]));
        partition.insert(Vertex::with_edges(2, 20, vec![Edge::new(3, ())]));
        partition.insert(Vertex::new(3, 30));
        partition
    }

    #[tokio::test]
    async fn test_compute_partition_runs_active_and_messaged_vertices() {
        let output = compute_partition(Arc::new(Accumulate), partition(), BTreeMap::new(), globals(0), false)
            .await
            .unwrap();
        assert_eq!(output.computed, 3);
        assert_eq!(output.partition.halted_count(), 3);
        assert_eq!(output.outbox, vec![(2, 10), (3, 20)]);
        assert_eq!(output.partials.into_values()["computed"], AggregateValue::Long(3));

        // Only the vertex with mail wakes up.
        let inbox: BTreeMap<u64, Vec<u64>> = [(3, vec![1, 2])].into_iter().collect();
        let output = compute_partition(Arc::new(Accumulate), output.partition, inbox, globals(1), false)
            .await
            .unwrap();
        assert_eq!(output.computed, 1);
        assert_eq!(output.partition.get(&3).map(|v| *v.value()), Some(33));
        assert!(output.outbox.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_fails_partition() {
        let err = compute_partition(Arc::new(Accumulate), partition(), BTreeMap::new(), globals(0), true)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PregelError::VertexError { .. }));
        assert!(!err.is_fatal());
    }
}
