//! Error types for the Pregel engine
//!
//! One error enum covers every failure the engine can surface. The Master uses
//! [`PregelError::is_fatal`] to decide between aborting the job and rolling
//! back to the last committed checkpoint.

use std::time::Duration;

use thiserror::Error;

use super::partition::{PartitionId, WorkerId};

/// Result alias used throughout the engine
pub type PregelResult<T> = std::result::Result<T, PregelError>;

/// Errors raised by the BSP engine
#[derive(Debug, Error)]
pub enum PregelError {
    // =========================================================================
    // Configuration (fatal, reported before supersteps begin)
    // =========================================================================
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("aggregator not registered: {name}")]
    UnknownAggregator { name: String },

    #[error("aggregator already registered: {name}")]
    DuplicateAggregator { name: String },

    #[error("partitioner is not deterministic: vertex {vertex} mapped to partition {first} then {second}")]
    NonDeterministicPartitioner {
        vertex: String,
        first: PartitionId,
        second: PartitionId,
    },

    #[error("partitioner returned partition {partition} for vertex {vertex}, but only {partition_count} partitions exist")]
    PartitionOutOfRange {
        vertex: String,
        partition: PartitionId,
        partition_count: u32,
    },

    #[error("vertex {vertex} in partition {partition} reached worker {worker}, which does not own it")]
    MisroutedVertex {
        vertex: String,
        partition: PartitionId,
        worker: WorkerId,
    },

    // =========================================================================
    // Compute
    // =========================================================================
    #[error("vertex {vertex_id} failed: {message}")]
    VertexError {
        vertex_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("compute task panicked: {message}")]
    ComputePanic { message: String },

    #[error("master compute failed: {0}")]
    MasterCompute(String),

    // =========================================================================
    // Cluster
    // =========================================================================
    #[error("worker {worker} failed: {reason}")]
    WorkerFailed { worker: WorkerId, reason: String },

    #[error("delivery to worker {target} failed: {reason}")]
    Transport { target: WorkerId, reason: String },

    #[error("barrier for superstep {superstep} timed out after {elapsed:?}, missing {missing:?}")]
    BarrierTimeout {
        superstep: u64,
        missing: Vec<WorkerId>,
        elapsed: Duration,
    },

    #[error("no live workers remain")]
    NoLiveWorkers,

    #[error("recovery abandoned after {attempts} attempts: {last_error}")]
    RecoveryExhausted { attempts: u32, last_error: String },

    #[error("master unavailable: {0}")]
    MasterUnavailable(String),

    // =========================================================================
    // Checkpoint
    // =========================================================================
    #[error("checkpoint for superstep {superstep} failed: {message}")]
    Checkpoint { superstep: u64, message: String },

    #[error("checkpoint storage unavailable after {failures} consecutive failures")]
    CheckpointUnavailable { failures: u32 },

    // =========================================================================
    // Adapters
    // =========================================================================
    #[error("input failed: {0}")]
    Input(String),

    #[error("output failed: {0}")]
    Output(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl PregelError {
    /// Create a vertex compute error without a source
    pub fn vertex_error(vertex_id: impl std::fmt::Debug, message: impl Into<String>) -> Self {
        Self::VertexError {
            vertex_id: format!("{:?}", vertex_id),
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a checkpoint error for a superstep
    pub fn checkpoint(superstep: u64, message: impl std::fmt::Display) -> Self {
        Self::Checkpoint {
            superstep,
            message: message.to_string(),
        }
    }

    /// Create a worker failure
    pub fn worker_failed(worker: WorkerId, reason: impl Into<String>) -> Self {
        Self::WorkerFailed {
            worker,
            reason: reason.into(),
        }
    }

    /// Whether this error must abort the job instead of triggering recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnknownAggregator { .. }
                | Self::DuplicateAggregator { .. }
                | Self::NonDeterministicPartitioner { .. }
                | Self::PartitionOutOfRange { .. }
                | Self::MisroutedVertex { .. }
                | Self::MasterCompute(_)
                | Self::NoLiveWorkers
                | Self::RecoveryExhausted { .. }
                | Self::MasterUnavailable(_)
                | Self::CheckpointUnavailable { .. }
        )
    }

    /// The worker a transport failure points at, if any.
    pub fn unreachable_worker(&self) -> Option<WorkerId> {
        match self {
            Self::Transport { target, .. } => Some(*target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(PregelError: Send, Sync);

    #[test]
    fn test_vertex_error_formats_id() {
        let err = PregelError::vertex_error(42u64, "boom");
        assert_eq!(err.to_string(), "vertex 42 failed: boom");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PregelError::config("partition_count must be >= 1").is_fatal());
        assert!(PregelError::UnknownAggregator {
            name: "sum".into()
        }
        .is_fatal());
        assert!(!PregelError::worker_failed(WorkerId(1), "timeout").is_fatal());
        assert!(!PregelError::checkpoint(4, "disk full").is_fatal());
        assert!(PregelError::CheckpointUnavailable { failures: 3 }.is_fatal());
    }

    #[test]
    fn test_unreachable_worker() {
        let err = PregelError::Transport {
            target: WorkerId(3),
            reason: "closed".into(),
        };
        assert_eq!(err.unreachable_worker(), Some(WorkerId(3)));
        assert_eq!(PregelError::NoLiveWorkers.unreachable_worker(), None);
    }
}
