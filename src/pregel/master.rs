//! Master: superstep counter, barrier, halting, checkpoints and recovery
//!
//! The Master is the single logical coordinator of a job. It never touches
//! vertex data; it sees workers only through the control protocol. Any
//! non-fatal failure rolls the job back to the newest committed checkpoint
//! (or to the input when none exists) under a new epoch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::aggregator::{AggregateValue, AggregatorDef, AggregatorRegistry, AggregatorSnapshot};
use super::checkpoint::{CheckpointManager, CheckpointRecord};
use super::config::PregelConfig;
use super::error::{PregelError, PregelResult};
use super::partition::{PartitionAssignment, WorkerId};
use super::protocol::{SuperstepGlobals, SuperstepReport, WorkerCommand, WorkerEndpoint, WorkerEvent};

// =============================================================================
// Master compute
// =============================================================================

/// Job-wide logic run by the Master before every superstep
#[async_trait]
pub trait MasterCompute: Send + Sync + 'static {
    /// Called once before superstep 0; register aggregators here
    async fn initialize(&mut self, _ctx: &mut MasterContext<'_>) -> PregelResult<()> {
        Ok(())
    }

    /// Called before each superstep with the values of the previous one
    async fn compute(&mut self, ctx: &mut MasterContext<'_>) -> PregelResult<()>;
}

/// What master compute may read and change
pub struct MasterContext<'a> {
    superstep: u64,
    total_vertices: u64,
    total_edges: u64,
    registry: &'a mut AggregatorRegistry,
    halt: bool,
}

impl<'a> MasterContext<'a> {
    pub fn new(superstep: u64, total_vertices: u64, total_edges: u64, registry: &'a mut AggregatorRegistry) -> Self {
        Self {
            superstep,
            total_vertices,
            total_edges,
            registry,
            halt: false,
        }
    }

    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    pub fn total_num_vertices(&self) -> u64 {
        self.total_vertices
    }

    pub fn total_num_edges(&self) -> u64 {
        self.total_edges
    }

    /// Merged value from the previous superstep
    pub fn get_aggregated_value(&self, name: &str) -> Option<&AggregateValue> {
        self.registry.global_value(name)
    }

    /// Override the value workers will see in the coming superstep
    pub fn set_aggregated_value(&mut self, name: &str, value: impl Into<AggregateValue>) -> PregelResult<()> {
        self.registry.set_value(name, value.into())
    }

    pub fn register_aggregator(&mut self, name: impl Into<String>, def: AggregatorDef) -> PregelResult<()> {
        self.registry.register(name, def)
    }

    pub fn remove_aggregator(&mut self, name: &str) -> bool {
        self.registry.remove(name)
    }

    /// End the job before the coming superstep runs
    pub fn halt_computation(&mut self) {
        self.halt = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halt
    }
}

// =============================================================================
// Launching workers
// =============================================================================

/// Starts workers that register with the Master's event channel
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, worker: WorkerId) -> PregelResult<()>;
}

// =============================================================================
// Outcome
// =============================================================================

/// Why the job stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Every vertex voted to halt and nothing was sent
    AllVerticesHalted,
    /// Master compute called `halt_computation`
    MasterHalted,
    /// The superstep cap was reached
    MaxSupersteps,
}

/// Global statistics of one completed superstep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperstepStats {
    pub superstep: u64,
    pub epoch: u64,
    pub vertices: u64,
    pub edges: u64,
    pub halted: u64,
    pub computed: u64,
    pub messages_sent: u64,
    pub mutations_sent: u64,
    pub messages_delivered: u64,
    pub duration_ms: u64,
}

/// Final state of a job as seen by the Master
#[derive(Debug, Clone)]
pub struct MasterOutcome {
    /// Supersteps executed, counting superstep 0
    pub supersteps: u64,
    pub halt_reason: HaltReason,
    pub aggregates: AggregatorSnapshot,
    pub total_vertices: u64,
    pub total_edges: u64,
    pub recoveries: u32,
    pub checkpoints: Vec<u64>,
    pub history: Vec<SuperstepStats>,
    pub workers: Vec<WorkerId>,
}

enum Step {
    Continue,
    Halt(HaltReason),
}

// =============================================================================
// Master
// =============================================================================

pub struct Master {
    config: Arc<PregelConfig>,
    partition_count: u32,
    registry: AggregatorRegistry,
    /// Registry as it stood after master initialization
    initial_registry: AggregatorRegistry,
    /// Registry of each retained committed checkpoint
    saved_registries: BTreeMap<u64, AggregatorRegistry>,
    master_compute: Option<Box<dyn MasterCompute>>,
    checkpoints: Option<CheckpointManager>,
    launcher: Arc<dyn WorkerLauncher>,
    events: mpsc::Receiver<WorkerEvent>,

    workers: BTreeMap<WorkerId, WorkerEndpoint>,
    failed: BTreeSet<WorkerId>,
    next_worker_id: u32,
    epoch: u64,
    superstep: u64,
    total_vertices: u64,
    total_edges: u64,
    /// Superstep restored from a checkpoint; it skips master compute and is
    /// not checkpointed again
    resumed_at: Option<u64>,
    recovery_attempts: u32,
    consecutive_checkpoint_failures: u32,
    committed: Vec<u64>,
    history: Vec<SuperstepStats>,
}

impl Master {
    pub fn new(
        config: Arc<PregelConfig>,
        partition_count: u32,
        registry: AggregatorRegistry,
        master_compute: Option<Box<dyn MasterCompute>>,
        checkpoints: Option<CheckpointManager>,
        launcher: Arc<dyn WorkerLauncher>,
        events: mpsc::Receiver<WorkerEvent>,
    ) -> Self {
        Self {
            config,
            partition_count,
            initial_registry: registry.clone(),
            registry,
            saved_registries: BTreeMap::new(),
            master_compute,
            checkpoints,
            launcher,
            events,
            workers: BTreeMap::new(),
            failed: BTreeSet::new(),
            next_worker_id: 0,
            epoch: 0,
            superstep: 0,
            total_vertices: 0,
            total_edges: 0,
            resumed_at: None,
            recovery_attempts: 0,
            consecutive_checkpoint_failures: 0,
            committed: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Drive the job to completion
    pub async fn run(mut self) -> PregelResult<MasterOutcome> {
        let result = self.drive().await;
        self.shutdown_all().await;
        match &result {
            Ok(outcome) => tracing::info!(
                supersteps = outcome.supersteps,
                reason = ?outcome.halt_reason,
                recoveries = outcome.recoveries,
                "job finished"
            ),
            Err(e) => tracing::error!(error = %e, superstep = self.superstep, "job aborted"),
        }
        result
    }

    async fn drive(&mut self) -> PregelResult<MasterOutcome> {
        if let Some(master_compute) = self.master_compute.as_mut() {
            let mut ctx = MasterContext::new(0, 0, 0, &mut self.registry);
            master_compute
                .initialize(&mut ctx)
                .await
                .map_err(|e| PregelError::MasterCompute(e.to_string()))?;
        }
        self.initial_registry = self.registry.clone();

        let initial = self.config.num_workers;
        self.launch_workers(initial).await?;
        if let Err(e) = self.load().await {
            if e.is_fatal() {
                return Err(e);
            }
            self.recover(e).await?;
        }

        let reason = loop {
            if let Some(max) = self.config.max_supersteps {
                if self.superstep >= max {
                    break HaltReason::MaxSupersteps;
                }
            }
            match self.run_superstep().await {
                Ok(Step::Continue) => self.superstep += 1,
                Ok(Step::Halt(reason)) => {
                    if reason != HaltReason::MasterHalted {
                        self.superstep += 1;
                    }
                    break reason;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.recover(e).await?,
            }
        };

        self.write_results().await?;

        Ok(MasterOutcome {
            supersteps: self.superstep,
            halt_reason: reason,
            aggregates: self.registry.snapshot(),
            total_vertices: self.total_vertices,
            total_edges: self.total_edges,
            recoveries: self.recovery_attempts,
            checkpoints: self.committed.clone(),
            history: std::mem::take(&mut self.history),
            workers: self.workers.keys().copied().collect(),
        })
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Next event before `deadline`; `None` on timeout
    async fn next_event(&mut self, deadline: tokio::time::Instant) -> PregelResult<Option<WorkerEvent>> {
        match tokio::time::timeout_at(deadline, self.events.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(PregelError::MasterUnavailable("worker event channel closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    /// Handle a failure report for the current epoch
    fn on_failure(&mut self, worker: WorkerId, error: PregelError) -> PregelError {
        if error.is_fatal() {
            return error;
        }
        match error.unreachable_worker() {
            Some(target) => {
                self.failed.insert(target);
                PregelError::worker_failed(target, error.to_string())
            }
            None => {
                self.failed.insert(worker);
                PregelError::worker_failed(worker, error.to_string())
            }
        }
    }

    fn is_current(&self, event: &WorkerEvent) -> bool {
        match event.epoch() {
            Some(epoch) if epoch != self.epoch => {
                tracing::debug!(event_epoch = epoch, epoch = self.epoch, worker = ?event.worker(), "ignoring stale event");
                false
            }
            _ => true,
        }
    }

    async fn launch_workers(&mut self, count: usize) -> PregelResult<()> {
        let mut expected = BTreeSet::new();
        for _ in 0..count {
            let id = WorkerId(self.next_worker_id);
            self.next_worker_id += 1;
            self.launcher.launch(id)?;
            expected.insert(id);
        }

        let deadline = tokio::time::Instant::now() + self.config.registration_timeout;
        while !expected.is_empty() {
            let Some(event) = self.next_event(deadline).await? else {
                // Unregistered ids count as failed so the next recovery replaces them.
                self.failed.extend(expected.iter().copied());
                return Err(PregelError::WorkerFailed {
                    worker: expected.iter().next().copied().unwrap_or(WorkerId(0)),
                    reason: format!("{} worker(s) did not register in time", expected.len()),
                });
            };
            if let WorkerEvent::Registered(endpoint) = event {
                tracing::info!(worker = %endpoint.worker, address = %endpoint.address, "worker registered");
                expected.remove(&endpoint.worker);
                self.workers.insert(endpoint.worker, endpoint);
            }
        }
        Ok(())
    }

    async fn send(&mut self, worker: WorkerId, command: WorkerCommand) -> PregelResult<()> {
        let Some(endpoint) = self.workers.get(&worker) else {
            return Err(PregelError::worker_failed(worker, "not registered"));
        };
        if endpoint.commands.send(command).await.is_err() {
            self.failed.insert(worker);
            return Err(PregelError::worker_failed(worker, "command channel closed"));
        }
        Ok(())
    }

    fn live_workers(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    // =========================================================================
    // Load
    // =========================================================================

    fn assign(&self) -> PregelResult<PartitionAssignment> {
        let assignment = PartitionAssignment::compute(self.partition_count, &self.live_workers())?;
        for worker in assignment.workers() {
            tracing::debug!(
                worker = %worker,
                partitions = ?assignment.partitions_of(*worker),
                epoch = self.epoch,
                "partitions assigned"
            );
        }
        Ok(assignment)
    }

    async fn load(&mut self) -> PregelResult<()> {
        let assignment = self.assign()?;
        for worker in self.live_workers() {
            self.send(
                worker,
                WorkerCommand::AssignPartitions {
                    epoch: self.epoch,
                    assignment: assignment.clone(),
                },
            )
            .await?;
        }
        let (vertices, edges) = self.await_loaded(false).await?;
        self.total_vertices = vertices;
        self.total_edges = edges;
        self.superstep = 0;
        tracing::info!(vertices, edges, partitions = self.partition_count, "graph loaded");
        Ok(())
    }

    /// Wait for every live worker to report `Loaded` (or `Recovered`)
    async fn await_loaded(&mut self, recovering: bool) -> PregelResult<(u64, u64)> {
        let mut pending: BTreeSet<WorkerId> = self.live_workers().into_iter().collect();
        let (mut vertices, mut edges) = (0, 0);
        let deadline = tokio::time::Instant::now() + self.config.registration_timeout;

        while !pending.is_empty() {
            let Some(event) = self.next_event(deadline).await? else {
                self.failed.extend(pending.iter().copied());
                return Err(PregelError::BarrierTimeout {
                    superstep: self.superstep,
                    missing: pending.into_iter().collect(),
                    elapsed: self.config.registration_timeout,
                });
            };
            if !self.is_current(&event) {
                continue;
            }
            match event {
                WorkerEvent::Loaded {
                    worker,
                    vertices: v,
                    edges: e,
                    ..
                } if !recovering => {
                    pending.remove(&worker);
                    vertices += v;
                    edges += e;
                }
                WorkerEvent::Recovered {
                    worker,
                    vertices: v,
                    edges: e,
                    ..
                } if recovering => {
                    pending.remove(&worker);
                    vertices += v;
                    edges += e;
                }
                WorkerEvent::Failed { worker, error, .. } => return Err(self.on_failure(worker, error)),
                other => tracing::debug!(event = ?other, "unexpected event while loading"),
            }
        }
        Ok((vertices, edges))
    }

    // =========================================================================
    // Superstep
    // =========================================================================

    async fn run_superstep(&mut self) -> PregelResult<Step> {
        let started = Instant::now();
        let superstep = self.superstep;
        let resumed = self.resumed_at.take() == Some(superstep);

        if !resumed {
            if let Some(master_compute) = self.master_compute.as_mut() {
                let mut ctx = MasterContext::new(superstep, self.total_vertices, self.total_edges, &mut self.registry);
                master_compute
                    .compute(&mut ctx)
                    .await
                    .map_err(|e| PregelError::MasterCompute(e.to_string()))?;
                if ctx.is_halted() {
                    tracing::info!(superstep, "master compute halted the job");
                    return Ok(Step::Halt(HaltReason::MasterHalted));
                }
            }
        }

        let checkpoint = !resumed && self.checkpoints.is_some() && self.config.checkpoint.is_due(superstep);
        let globals = SuperstepGlobals {
            superstep,
            total_vertices: self.total_vertices,
            total_edges: self.total_edges,
            aggregates: self.registry.snapshot(),
            definitions: self.registry.definitions(),
        };

        tracing::info!(superstep, epoch = self.epoch, checkpoint, "superstep started");
        for worker in self.live_workers() {
            self.send(
                worker,
                WorkerCommand::StartSuperstep {
                    epoch: self.epoch,
                    checkpoint,
                    globals: globals.clone(),
                },
            )
            .await?;
        }

        let reports = self.barrier(superstep, checkpoint, &globals).await?;

        let partials: Vec<_> = reports.values().map(|r| &r.aggregates).collect();
        self.registry.merge_partials(partials)?;

        let mut stats = SuperstepStats {
            superstep,
            epoch: self.epoch,
            vertices: 0,
            edges: 0,
            halted: 0,
            computed: 0,
            messages_sent: 0,
            mutations_sent: 0,
            messages_delivered: 0,
            duration_ms: 0,
        };
        for report in reports.values() {
            stats.vertices += report.vertex_count;
            stats.edges += report.edge_count;
            stats.halted += report.halted_count;
            stats.computed += report.computed_count;
            stats.messages_sent += report.messages_sent;
            stats.mutations_sent += report.mutations_sent;
            stats.messages_delivered += report.messages_delivered;
        }
        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.total_vertices = stats.vertices;
        self.total_edges = stats.edges;

        let all_halted = stats.halted == stats.vertices;
        let quiet = stats.messages_sent == 0 && stats.mutations_sent == 0;
        tracing::info!(
            superstep,
            vertices = stats.vertices,
            halted = stats.halted,
            messages = stats.messages_sent,
            elapsed_ms = stats.duration_ms,
            "superstep complete"
        );
        self.history.push(stats);

        if all_halted && quiet {
            return Ok(Step::Halt(HaltReason::AllVerticesHalted));
        }
        Ok(Step::Continue)
    }

    /// Wait for every live worker's report and, when a checkpoint was
    /// requested, every acknowledgement.
    async fn barrier(
        &mut self,
        superstep: u64,
        checkpoint: bool,
        globals: &SuperstepGlobals,
    ) -> PregelResult<BTreeMap<WorkerId, SuperstepReport>> {
        let expected: BTreeSet<WorkerId> = self.live_workers().into_iter().collect();
        let mut reports = BTreeMap::new();
        let mut acked = BTreeSet::new();
        let mut checkpoint_failed = false;
        let mut checkpoint_done = !checkpoint;
        let started = tokio::time::Instant::now();
        let deadline = started + self.config.barrier_timeout;

        let result = loop {
            if reports.len() == expected.len() && checkpoint_done {
                break Ok(());
            }
            let event = match self.next_event(deadline).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    let missing: Vec<WorkerId> = expected
                        .iter()
                        .filter(|w| !reports.contains_key(*w) || (!checkpoint_done && !acked.contains(*w)))
                        .copied()
                        .collect();
                    self.failed.extend(missing.iter().copied());
                    break Err(PregelError::BarrierTimeout {
                        superstep,
                        missing,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) => break Err(e),
            };
            if !self.is_current(&event) {
                continue;
            }

            match event {
                WorkerEvent::SuperstepComplete(report) if report.superstep == superstep => {
                    if let Some(worker) = report.worker {
                        reports.insert(worker, report);
                    }
                }
                WorkerEvent::CheckpointAck { worker, superstep: s, .. } if s == superstep => {
                    acked.insert(worker);
                    if !checkpoint_failed && acked.len() == expected.len() {
                        checkpoint_done = true;
                        if let Err(e) = self.commit_checkpoint(globals).await {
                            tracing::warn!(superstep, error = %e, "checkpoint commit failed");
                            checkpoint_failed = true;
                        }
                    }
                }
                WorkerEvent::CheckpointFailed { worker, reason, .. } => {
                    tracing::warn!(worker = %worker, superstep, %reason, "checkpoint write failed");
                    checkpoint_failed = true;
                    checkpoint_done = true;
                }
                WorkerEvent::Failed { worker, error, .. } => break Err(self.on_failure(worker, error)),
                other => tracing::debug!(event = ?other, "unexpected event during barrier"),
            }
        };

        if checkpoint {
            self.settle_checkpoint(superstep, checkpoint_failed).await?;
        }
        result.map(|()| reports)
    }

    async fn commit_checkpoint(&mut self, globals: &SuperstepGlobals) -> PregelResult<()> {
        let Some(checkpoints) = &self.checkpoints else {
            return Ok(());
        };
        let aggregates = globals.aggregates.clone().into_values();
        let registry = AggregatorRegistry::from_parts((*globals.definitions).clone(), &aggregates);
        let record = CheckpointRecord {
            job_id: checkpoints.job_id(),
            superstep: globals.superstep,
            epoch: self.epoch,
            created_at: Utc::now(),
            aggregates,
            aggregators: registry.layout(),
            total_vertices: globals.total_vertices,
            total_edges: globals.total_edges,
            partition_count: self.partition_count,
            workers: self.live_workers(),
        };
        checkpoints.commit(&record, self.config.checkpoint.retain).await?;
        self.committed.push(globals.superstep);
        self.saved_registries.insert(globals.superstep, registry);
        while self.saved_registries.len() > self.config.checkpoint.retain.max(1) {
            self.saved_registries.pop_first();
        }
        tracing::info!(superstep = globals.superstep, "checkpoint committed");
        Ok(())
    }

    /// Abandon an uncommitted checkpoint; abort after too many failed writes
    /// in a row
    async fn settle_checkpoint(&mut self, superstep: u64, failed: bool) -> PregelResult<()> {
        if self.committed.last() == Some(&superstep) {
            self.consecutive_checkpoint_failures = 0;
            return Ok(());
        }
        if let Some(checkpoints) = &self.checkpoints {
            if let Err(e) = checkpoints.abandon(superstep).await {
                tracing::warn!(superstep, error = %e, "could not discard abandoned checkpoint");
            }
        }
        if !failed {
            return Ok(());
        }
        self.consecutive_checkpoint_failures += 1;
        tracing::warn!(
            superstep,
            failures = self.consecutive_checkpoint_failures,
            "checkpoint abandoned; watermark not advanced"
        );
        if self.consecutive_checkpoint_failures >= self.config.checkpoint.max_consecutive_failures {
            return Err(PregelError::CheckpointUnavailable {
                failures: self.consecutive_checkpoint_failures,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Roll back to the newest committed checkpoint under a new epoch
    async fn recover(&mut self, cause: PregelError) -> PregelResult<()> {
        let mut last_error = cause;
        loop {
            if self.recovery_attempts >= self.config.recovery.max_retries {
                return Err(PregelError::RecoveryExhausted {
                    attempts: self.recovery_attempts,
                    last_error: last_error.to_string(),
                });
            }
            self.recovery_attempts += 1;
            tokio::time::sleep(self.config.recovery.backoff_for(self.recovery_attempts)).await;

            match self.try_recover(&last_error).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => last_error = e,
            }
        }
    }

    async fn try_recover(&mut self, cause: &PregelError) -> PregelResult<()> {
        self.epoch += 1;
        let failed: Vec<WorkerId> = std::mem::take(&mut self.failed).into_iter().collect();
        tracing::warn!(
            epoch = self.epoch,
            superstep = self.superstep,
            failed = ?failed,
            cause = %cause,
            "recovering"
        );

        for worker in &failed {
            if let Some(endpoint) = self.workers.remove(worker) {
                let _ = endpoint.commands.send(WorkerCommand::Shutdown).await;
            }
        }
        if self.config.respawn_failed_workers && !failed.is_empty() {
            let replacements = failed.len().min(self.config.num_workers.saturating_sub(self.workers.len()));
            self.launch_workers(replacements).await?;
        }
        if self.workers.is_empty() {
            return Err(PregelError::NoLiveWorkers);
        }

        let record = match &self.checkpoints {
            Some(checkpoints) => checkpoints.latest().await?,
            None => None,
        };
        let registry = match &record {
            Some(record) => {
                if record.partition_count != self.partition_count {
                    return Err(PregelError::config(format!(
                        "checkpoint at superstep {} has {} partitions, job has {}",
                        record.superstep, record.partition_count, self.partition_count
                    )));
                }
                self.saved_registry(record)?
            }
            None => self.initial_registry.clone(),
        };

        let assignment = self.assign()?;
        let superstep = record.as_ref().map(|r| r.superstep);
        for worker in self.live_workers() {
            self.send(
                worker,
                WorkerCommand::RecoverFrom {
                    epoch: self.epoch,
                    superstep,
                    assignment: assignment.clone(),
                },
            )
            .await?;
        }
        let (vertices, edges) = self.await_loaded(true).await?;

        self.registry = registry;
        match record {
            Some(record) => {
                self.superstep = record.superstep;
                self.total_vertices = record.total_vertices;
                self.total_edges = record.total_edges;
                self.resumed_at = Some(record.superstep);
            }
            None => {
                self.superstep = 0;
                self.total_vertices = vertices;
                self.total_edges = edges;
                self.resumed_at = None;
            }
        }
        self.history.retain(|s| s.superstep < self.superstep);

        tracing::info!(
            epoch = self.epoch,
            superstep = self.superstep,
            workers = self.workers.len(),
            "recovered"
        );
        Ok(())
    }

    /// Aggregator definitions and values as of a committed checkpoint
    fn saved_registry(&self, record: &CheckpointRecord) -> PregelResult<AggregatorRegistry> {
        let saved = self.saved_registries.get(&record.superstep).ok_or_else(|| {
            PregelError::config(format!(
                "no aggregator definitions held for checkpoint at superstep {}",
                record.superstep
            ))
        })?;
        if saved.layout() != record.aggregators {
            return Err(PregelError::config(format!(
                "aggregators of checkpoint at superstep {} do not match the registered ones",
                record.superstep
            )));
        }
        Ok(AggregatorRegistry::from_parts(
            (*saved.definitions()).clone(),
            &record.aggregates,
        ))
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn write_results(&mut self) -> PregelResult<()> {
        let superstep = self.superstep;
        for worker in self.live_workers() {
            self.send(
                worker,
                WorkerCommand::Halt {
                    epoch: self.epoch,
                    superstep,
                },
            )
            .await?;
        }

        let mut pending: BTreeSet<WorkerId> = self.live_workers().into_iter().collect();
        let deadline = tokio::time::Instant::now() + self.config.barrier_timeout;
        while !pending.is_empty() {
            let Some(event) = self.next_event(deadline).await? else {
                return Err(PregelError::Output(format!("workers {:?} did not finish writing", pending)));
            };
            if !self.is_current(&event) {
                continue;
            }
            match event {
                WorkerEvent::Finished { worker, .. } => {
                    pending.remove(&worker);
                }
                WorkerEvent::Failed { worker, error, .. } => {
                    return Err(PregelError::Output(format!("{} failed writing results: {}", worker, error)));
                }
                other => tracing::debug!(event = ?other, "unexpected event while writing results"),
            }
        }
        Ok(())
    }

    async fn shutdown_all(&mut self) {
        for (_, endpoint) in std::mem::take(&mut self.workers) {
            let _ = endpoint.commands.send(WorkerCommand::Shutdown).await;
        }
    }
}
