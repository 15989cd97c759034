//! Pregel Runtime for Bulk-Synchronous Graph Computation
//!
//! This module implements a vertex-centric BSP engine in the style of Pregel.
//! Key concepts:
//!
//! - **Vertex**: Identifier, mutable value, outgoing edges and an active/halted flag
//! - **Superstep**: One round in which every active vertex computes once
//! - **Message**: Sent in superstep `n`, delivered at the start of `n + 1`
//! - **Aggregator**: Named value folded across all vertices, visible one superstep later
//! - **Checkpoint**: Consistent snapshot the job rolls back to after a failure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Master                               │
//! │   master compute → StartSuperstep → barrier → merge → halt?  │
//! └───────┬──────────────────────▲───────────────────────────────┘
//!         │ WorkerCommand        │ WorkerEvent
//!         ▼                      │
//! ┌───────────────┐      ┌───────────────┐      ┌───────────────┐
//! │   Worker 0    │      │   Worker 1    │      │   Worker N    │
//! │ partitions    │◀────▶│ partitions    │◀────▶│ partitions    │
//! │ compute pool  │batch │ compute pool  │batch │ compute pool  │
//! └───────┬───────┘      └───────┬───────┘      └───────┬───────┘
//!         └──────────────────────┼──────────────────────┘
//!                                ▼
//!                        ┌───────────────┐
//!                        │ Checkpointer  │
//!                        └───────────────┘
//! ```

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fault;
pub mod io;
pub mod master;
pub mod message;
pub mod partition;
pub mod protocol;
pub mod runtime;
pub mod store;
pub mod transport;
pub mod vertex;
pub mod worker;

// Re-exports
pub use aggregator::{AggregateValue, AggregatorDef, AggregatorKind, AggregatorRegistry, AggregatorSnapshot};
pub use checkpoint::{
    create_checkpointer, CheckpointManager, CheckpointRecord, Checkpointer, CheckpointerConfig, FileCheckpointer,
    MemoryCheckpointer,
};
pub use config::{ActivationPolicy, CheckpointPolicy, PregelConfig, RetryPolicy};
pub use error::{PregelError, PregelResult};
pub use fault::{Fault, FaultInjector};
pub use io::{CollectingWriter, InMemoryGraph, NullWriter, VertexReader, VertexWriter};
pub use master::{HaltReason, MasterCompute, MasterContext, SuperstepStats};
pub use message::{MaxCombiner, MessageCombiner, MinCombiner, SumCombiner};
pub use partition::{HashPartitioner, JumpHashPartitioner, PartitionAssignment, PartitionId, Partitioner, WorkerId};
pub use runtime::{JobResult, PregelRuntime};
pub use store::Mutation;
pub use transport::{LocalTransport, MessageTransport};
pub use vertex::{Computation, ComputeContext, Edge, Messages, Vertex, VertexState};
