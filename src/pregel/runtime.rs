//! Job entry point
//!
//! [`PregelRuntime`] wires a [`Computation`] to a Master, a set of in-process
//! workers and a local transport, then drives the job to completion.
//!
//! ```rust,ignore
//! let result = PregelRuntime::new(SimplePageRank, PregelConfig::default().with_workers(2))
//!     .with_master_compute(PageRankMasterCompute)
//!     .run(Arc::new(graph), Arc::new(NullWriter))
//!     .await?;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::aggregator::{AggregateValue, AggregatorDef, AggregatorRegistry, AggregatorSnapshot};
use super::checkpoint::{CheckpointManager, Checkpointer, MemoryCheckpointer};
use super::config::PregelConfig;
use super::error::{PregelError, PregelResult};
use super::fault::FaultInjector;
use super::io::{CollectingWriter, InMemoryGraph, VertexReader, VertexWriter};
use super::master::{HaltReason, Master, MasterCompute, SuperstepStats, WorkerLauncher};
use super::message::{CombinerOf, MessageCombiner};
use super::partition::{HashPartitioner, Partitioner, WorkerId};
use super::transport::{LocalTransport, MessageTransport};
use super::vertex::{Computation, VertexOf};
use super::worker::{Worker, WorkerEnv};

/// Depth of the shared worker → Master event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Summary of a finished job
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: Uuid,
    /// Supersteps executed, counting superstep 0
    pub supersteps: u64,
    pub halt_reason: HaltReason,
    /// Aggregator values after the last superstep
    pub aggregates: AggregatorSnapshot,
    pub total_vertices: u64,
    pub total_edges: u64,
    /// Rollbacks performed
    pub recoveries: u32,
    /// Supersteps with a committed checkpoint, oldest first
    pub checkpoints: Vec<u64>,
    pub history: Vec<SuperstepStats>,
    /// Workers live at the end of the job
    pub workers: Vec<WorkerId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn aggregate(&self, name: &str) -> Option<&AggregateValue> {
        self.aggregates.get(name)
    }

    /// Messages sent over the whole job
    pub fn messages_sent(&self) -> u64 {
        self.history.iter().map(|s| s.messages_sent).sum()
    }
}

/// Starts workers as tokio tasks in this process
struct LocalLauncher<C: Computation> {
    env: WorkerEnv<C>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Computation> LocalLauncher<C> {
    fn new(env: WorkerEnv<C>) -> Self {
        Self {
            env,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every launched worker to stop
    async fn join(&self, timeout: std::time::Duration) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("worker did not stop in time; aborting");
                abort.abort();
            }
        }
    }
}

impl<C: Computation> WorkerLauncher for LocalLauncher<C> {
    fn launch(&self, worker: WorkerId) -> PregelResult<()> {
        let handle = Worker::spawn(worker, self.env.clone());
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
        Ok(())
    }
}

/// Builder and driver for one Pregel job
pub struct PregelRuntime<C: Computation> {
    computation: Arc<C>,
    config: PregelConfig,
    partitioner: Option<Arc<dyn Partitioner<C::Id>>>,
    combiner: Option<CombinerOf<C>>,
    registry: AggregatorRegistry,
    registration_error: Option<PregelError>,
    master_compute: Option<Box<dyn MasterCompute>>,
    checkpoint_storage: Option<Arc<dyn Checkpointer>>,
    faults: Option<Arc<FaultInjector>>,
}

impl<C: Computation> PregelRuntime<C> {
    pub fn new(computation: C, config: PregelConfig) -> Self {
        Self {
            computation: Arc::new(computation),
            config,
            partitioner: None,
            combiner: None,
            registry: AggregatorRegistry::new(),
            registration_error: None,
            master_compute: None,
            checkpoint_storage: None,
            faults: None,
        }
    }

    pub fn config(&self) -> &PregelConfig {
        &self.config
    }

    /// Replace the default hash partitioner
    pub fn with_partitioner<P>(mut self, partitioner: P) -> Self
    where
        P: Partitioner<C::Id> + 'static,
    {
        self.partitioner = Some(Arc::new(partitioner));
        self
    }

    pub fn with_combiner<M>(mut self, combiner: M) -> Self
    where
        M: MessageCombiner<C::Id, C::Message> + 'static,
    {
        self.combiner = Some(Arc::new(combiner));
        self
    }

    /// Register an aggregator before the job starts.
    ///
    /// A duplicate name is reported when the job runs.
    pub fn with_aggregator(mut self, name: impl Into<String>, def: AggregatorDef) -> Self {
        if let Err(e) = self.registry.register(name, def) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    pub fn with_master_compute<M: MasterCompute>(mut self, master_compute: M) -> Self {
        self.master_compute = Some(Box::new(master_compute));
        self
    }

    /// Checkpoint storage; in-memory storage is used when checkpoints are
    /// enabled and none is given
    pub fn with_checkpoint_storage(mut self, storage: Arc<dyn Checkpointer>) -> Self {
        self.checkpoint_storage = Some(storage);
        self
    }

    pub fn with_fault_injector(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    fn resolve_partitioner(&self) -> PregelResult<Arc<dyn Partitioner<C::Id>>> {
        match &self.partitioner {
            Some(partitioner) => {
                let count = partitioner.partition_count();
                if count == 0 {
                    return Err(PregelError::config("partitioner reports zero partitions"));
                }
                if let Some(configured) = self.config.partition_count {
                    if configured != count {
                        return Err(PregelError::config(format!(
                            "partition_count is {} but the partitioner has {}",
                            configured, count
                        )));
                    }
                }
                Ok(Arc::clone(partitioner))
            }
            None => Ok(Arc::new(HashPartitioner::new(self.config.effective_partition_count())?)),
        }
    }

    /// Run the job, reading the graph from `reader` and writing final vertex
    /// state to `writer`
    pub async fn run(
        mut self,
        reader: Arc<dyn VertexReader<C::Id, C::Value, C::Edge>>,
        writer: Arc<dyn VertexWriter<C::Id, C::Value, C::Edge>>,
    ) -> PregelResult<JobResult> {
        self.config.validate()?;
        if let Some(e) = self.registration_error.take() {
            return Err(e);
        }
        let partitioner = self.resolve_partitioner()?;
        let partition_count = partitioner.partition_count();

        let storage = match (self.checkpoint_storage.take(), self.config.checkpoint.interval) {
            (Some(storage), _) => Some(storage),
            (None, Some(_)) => Some(Arc::new(MemoryCheckpointer::new()) as Arc<dyn Checkpointer>),
            (None, None) => None,
        };
        let job_id = Uuid::new_v4();
        let checkpoints = storage.map(|storage| CheckpointManager::new(storage, job_id));
        if let Some(checkpoints) = &checkpoints {
            checkpoints.prepare(self.config.checkpoint.overwrite_existing).await?;
        }

        let started_at = Utc::now();
        let config = Arc::new(self.config);
        let span = tracing::info_span!("pregel_job", job_id = %job_id);

        tracing::info!(
            parent: &span,
            workers = config.num_workers,
            compute_threads = config.compute_threads,
            partitions = partition_count,
            checkpoint_interval = ?config.checkpoint.interval,
            "starting job"
        );

        let mut transport = LocalTransport::<C>::new();
        if let Some(faults) = &self.faults {
            transport = transport.with_faults(Arc::clone(faults));
        }
        let transport: Arc<dyn MessageTransport<C>> = Arc::new(transport);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let env = WorkerEnv {
            computation: self.computation,
            config: Arc::clone(&config),
            partitioner,
            combiner: self.combiner,
            transport,
            checkpoints: checkpoints.clone(),
            reader,
            writer,
            faults: self.faults,
            events: events_tx,
        };
        let launcher = Arc::new(LocalLauncher::new(env));

        let master = Master::new(
            Arc::clone(&config),
            partition_count,
            self.registry,
            self.master_compute,
            checkpoints,
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            events_rx,
        );
        let outcome = tokio::spawn(master.run().instrument(span.clone()))
            .await
            .map_err(|e| PregelError::MasterUnavailable(e.to_string()));

        launcher.join(config.barrier_timeout).await;
        let outcome = outcome??;

        let result = JobResult {
            job_id,
            supersteps: outcome.supersteps,
            halt_reason: outcome.halt_reason,
            aggregates: outcome.aggregates,
            total_vertices: outcome.total_vertices,
            total_edges: outcome.total_edges,
            recoveries: outcome.recoveries,
            checkpoints: outcome.checkpoints,
            history: outcome.history,
            workers: outcome.workers,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            parent: &span,
            supersteps = result.supersteps,
            reason = ?result.halt_reason,
            elapsed_ms = (result.finished_at - result.started_at).num_milliseconds(),
            "job complete"
        );
        Ok(result)
    }

    /// Run over an in-memory graph and collect the final vertices in id order
    pub async fn run_collect(
        self,
        vertices: impl IntoIterator<Item = VertexOf<C>>,
    ) -> PregelResult<(JobResult, Vec<VertexOf<C>>)> {
        let graph: InMemoryGraph<C::Id, C::Value, C::Edge> = vertices.into_iter().collect();
        let writer = Arc::new(CollectingWriter::new());
        let result = self
            .run(Arc::new(graph), Arc::clone(&writer) as Arc<dyn VertexWriter<_, _, _>>)
            .await?;
        Ok((result, writer.vertices()))
    }

    /// Like [`run_collect`](Self::run_collect), returning only final values
    pub async fn run_values(
        self,
        vertices: impl IntoIterator<Item = VertexOf<C>>,
    ) -> PregelResult<(JobResult, BTreeMap<C::Id, C::Value>)> {
        let (result, vertices) = self.run_collect(vertices).await?;
        let values = vertices.into_iter().map(|v| (v.id().clone(), v.value().clone())).collect();
        Ok((result, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pregel::vertex::{ComputeContext, Messages, Vertex};
    use async_trait::async_trait;

    /// Each vertex counts down its value and halts at zero
    struct Countdown;

    #[async_trait]
    impl Computation for Countdown {
        type Id = u32;
        type Value = u32;
        type Edge = ();
        type Message = ();

        async fn compute(
            &self,
            vertex: &mut Vertex<u32, u32, ()>,
            _messages: Messages<()>,
            ctx: &mut ComputeContext<'_, Self>,
        ) -> PregelResult<()> {
            if *vertex.value() == 0 {
                ctx.vote_to_halt();
            } else {
                *vertex.value_mut() -= 1;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_countdown_runs_to_completion() {
        let config = PregelConfig::for_testing().with_workers(2);
        let vertices = (0..6u32).map(|id| Vertex::new(id, id));
        let (result, values) = tokio_test::assert_ok!(PregelRuntime::new(Countdown, config).run_values(vertices).await);

        assert_eq!(result.halt_reason, HaltReason::AllVerticesHalted);
        assert_eq!(result.supersteps, 6);
        assert_eq!(result.total_vertices, 6);
        assert!(values.values().all(|v| *v == 0));
        assert_eq!(result.history.len(), 6);
        assert_eq!(result.messages_sent(), 0);
    }

    #[tokio::test]
    async fn test_max_supersteps_caps_job() {
        let config = PregelConfig::for_testing().with_max_supersteps(2);
        let vertices = vec![Vertex::new(0u32, 10u32)];
        let (result, values) = PregelRuntime::new(Countdown, config).run_values(vertices).await.unwrap();
        assert_eq!(result.halt_reason, HaltReason::MaxSupersteps);
        assert_eq!(result.supersteps, 2);
        assert_eq!(values[&0], 8);
    }

    #[tokio::test]
    async fn test_duplicate_aggregator_rejected_at_run() {
        let runtime = PregelRuntime::new(Countdown, PregelConfig::for_testing())
            .with_aggregator("sum", AggregatorDef::long_sum())
            .with_aggregator("sum", AggregatorDef::long_sum());
        let err = runtime.run_values(vec![Vertex::new(0u32, 0u32)]).await.unwrap_err();
        assert!(matches!(err, PregelError::DuplicateAggregator { .. }));
    }

    #[tokio::test]
    async fn test_partitioner_count_mismatch_rejected() {
        let runtime = PregelRuntime::new(Countdown, PregelConfig::for_testing().with_partition_count(4))
            .with_partitioner(HashPartitioner::new(3).unwrap());
        let err = runtime.run_values(vec![Vertex::new(0u32, 0u32)]).await.unwrap_err();
        assert!(matches!(err, PregelError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let runtime = PregelRuntime::new(Countdown, PregelConfig::for_testing().with_workers(0));
        let err = tokio_test::assert_err!(runtime.run_values(Vec::new()).await);
        assert!(err.is_fatal());
    }
}
