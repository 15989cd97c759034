//! Master ↔ Worker control protocol
//!
//! Commands flow Master → Worker over each worker's own channel, events flow
//! Worker → Master over one shared channel. Every command and event carries
//! the job epoch; the epoch advances on each recovery so the Master can
//! ignore reports from a superstep it already abandoned.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::aggregator::{AggregateValue, AggregatorDefinitions, AggregatorSnapshot};
use super::error::PregelError;
use super::partition::{PartitionAssignment, WorkerId};

/// How the Master reaches a registered worker
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub worker: WorkerId,
    /// Transport address; `local://worker-N` for in-process workers
    pub address: String,
    pub commands: mpsc::Sender<WorkerCommand>,
}

/// Job-wide values every vertex may read during one superstep
#[derive(Debug, Clone)]
pub struct SuperstepGlobals {
    pub superstep: u64,
    pub total_vertices: u64,
    pub total_edges: u64,
    /// Aggregator values produced by the previous superstep
    pub aggregates: AggregatorSnapshot,
    pub definitions: Arc<AggregatorDefinitions>,
}

/// Master → Worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Take ownership of partitions and load them from the input
    AssignPartitions {
        epoch: u64,
        assignment: PartitionAssignment,
    },
    /// Run one superstep, checkpointing first when `checkpoint` is set
    StartSuperstep {
        epoch: u64,
        checkpoint: bool,
        globals: SuperstepGlobals,
    },
    /// Drop in-memory state and reload from a committed checkpoint, or from
    /// the input when `superstep` is `None`
    RecoverFrom {
        epoch: u64,
        superstep: Option<u64>,
        assignment: PartitionAssignment,
    },
    /// The job halted; write results
    Halt { epoch: u64, superstep: u64 },
    Shutdown,
}

/// Per-worker result of one superstep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuperstepReport {
    pub worker: Option<WorkerId>,
    pub epoch: u64,
    pub superstep: u64,
    /// Vertices owned after compute
    pub vertex_count: u64,
    pub edge_count: u64,
    /// Vertices that ended the superstep halted
    pub halted_count: u64,
    /// Vertices whose compute ran
    pub computed_count: u64,
    /// Messages sent by compute during this superstep
    pub messages_sent: u64,
    /// Graph mutations requested during this superstep
    pub mutations_sent: u64,
    /// Messages handed to compute at the start of this superstep
    pub messages_delivered: u64,
    /// Local aggregator partials
    pub aggregates: BTreeMap<String, AggregateValue>,
}

impl SuperstepReport {
    pub fn all_halted(&self) -> bool {
        self.halted_count == self.vertex_count
    }
}

/// Worker → Master
#[derive(Debug)]
pub enum WorkerEvent {
    Registered(WorkerEndpoint),
    Loaded {
        worker: WorkerId,
        epoch: u64,
        vertices: u64,
        edges: u64,
    },
    CheckpointAck {
        worker: WorkerId,
        epoch: u64,
        superstep: u64,
    },
    CheckpointFailed {
        worker: WorkerId,
        epoch: u64,
        superstep: u64,
        reason: String,
    },
    SuperstepComplete(SuperstepReport),
    Recovered {
        worker: WorkerId,
        epoch: u64,
        vertices: u64,
        edges: u64,
    },
    Failed {
        worker: WorkerId,
        epoch: u64,
        superstep: Option<u64>,
        error: PregelError,
    },
    Finished {
        worker: WorkerId,
        epoch: u64,
        vertices_written: u64,
    },
}

impl WorkerEvent {
    /// Sending worker
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            Self::Registered(endpoint) => Some(endpoint.worker),
            Self::SuperstepComplete(report) => report.worker,
            Self::Loaded { worker, .. }
            | Self::CheckpointAck { worker, .. }
            | Self::CheckpointFailed { worker, .. }
            | Self::Recovered { worker, .. }
            | Self::Failed { worker, .. }
            | Self::Finished { worker, .. } => Some(*worker),
        }
    }

    /// Epoch the event belongs to; registration is epoch-free
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::Registered(_) => None,
            Self::SuperstepComplete(report) => Some(report.epoch),
            Self::Loaded { epoch, .. }
            | Self::CheckpointAck { epoch, .. }
            | Self::CheckpointFailed { epoch, .. }
            | Self::Recovered { epoch, .. }
            | Self::Failed { epoch, .. }
            | Self::Finished { epoch, .. } => Some(*epoch),
        }
    }
}
