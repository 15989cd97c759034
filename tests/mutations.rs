//! Graph mutations and the activation policy

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pregel_bsp::pregel::{
    ActivationPolicy, CheckpointPolicy, Computation, ComputeContext, Edge, Fault, FaultInjector, Messages,
    PregelConfig, PregelResult, PregelRuntime, Vertex, WorkerId,
};

/// Counts its own computations; vertex 0 rewires the graph in superstep 0
struct Rewire;

#[async_trait]
impl Computation for Rewire {
    type Id = u64;
    type Value = u64;
    type Edge = u32;
    type Message = u64;

    async fn compute(
        &self,
        vertex: &mut Vertex<u64, u64, u32>,
        _messages: Messages<u64>,
        ctx: &mut ComputeContext<'_, Self>,
    ) -> PregelResult<()> {
        *vertex.value_mut() += 1;
        if ctx.superstep() == 0 && *vertex.id() == 0 {
            ctx.add_vertex_request(10, 100);
            ctx.add_edge_request(0, Edge::new(10, 7));
            ctx.remove_edges_request(1, 2);
            ctx.remove_vertex_request(3);
        }
        ctx.vote_to_halt();
        Ok(())
    }
}

fn graph() -> Vec<Vertex<u64, u64, u32>> {
    vec![
        Vertex::with_edges(0, 0, vec![Edge::new(1, 1)]),
        Vertex::with_edges(1, 0, vec![Edge::new(2, 1)]),
        Vertex::with_edges(2, 0, vec![Edge::new(0, 1)]),
        Vertex::with_edges(3, 0, vec![Edge::new(0, 1)]),
    ]
}

fn config(policy: ActivationPolicy) -> PregelConfig {
    PregelConfig::for_testing()
        .with_workers(2)
        .with_partition_count(4)
        .with_activation(policy)
}

#[tokio::test]
async fn test_mutations_apply_before_next_superstep() {
    let (result, vertices) = PregelRuntime::new(Rewire, config(ActivationPolicy::MessagesOnly))
        .run_collect(graph())
        .await
        .unwrap();

    let ids: Vec<u64> = vertices.iter().map(|v| *v.id()).collect();
    assert_eq!(ids, vec![0, 1, 2, 10]);
    assert_eq!(result.total_vertices, 4);
    assert_eq!(result.total_edges, 3);

    let zero = &vertices[0];
    let targets: Vec<u64> = zero.edges().iter().map(|e| e.target).collect();
    assert_eq!(targets, vec![1, 10]);
    assert!(vertices[1].edges().is_empty());

    // The new vertex is active and computes once.
    assert_eq!(*vertices[3].value(), 101);
    assert_eq!(result.history[0].mutations_sent, 4);
    assert_eq!(result.supersteps, 2);
}

#[tokio::test]
async fn test_messages_only_policy_leaves_mutated_vertices_halted() {
    let (result, vertices) = PregelRuntime::new(Rewire, config(ActivationPolicy::MessagesOnly))
        .run_collect(graph())
        .await
        .unwrap();
    assert_eq!(result.history[1].computed, 1);
    assert_eq!(*vertices[0].value(), 1);
    assert_eq!(*vertices[1].value(), 1);
}

#[tokio::test]
async fn test_mutations_policy_wakes_mutated_vertices() {
    let (result, vertices) = PregelRuntime::new(Rewire, config(ActivationPolicy::MessagesOrMutations))
        .run_collect(graph())
        .await
        .unwrap();
    // 0 gained an edge, 1 lost one, 10 is new; 2 is untouched.
    assert_eq!(result.history[1].computed, 3);
    assert_eq!(*vertices[0].value(), 2);
    assert_eq!(*vertices[1].value(), 2);
    assert_eq!(*vertices[2].value(), 1);
    assert_eq!(*vertices[3].value(), 101);
}

/// Sends to a vertex nobody loaded
struct MessageStranger;

#[async_trait]
impl Computation for MessageStranger {
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
        if ctx.superstep() == 0 {
            ctx.send_message(99, 5);
        }
        ctx.vote_to_halt();
        Ok(())
    }
}

#[tokio::test]
async fn test_message_to_missing_vertex_creates_it() {
    let (result, values) = PregelRuntime::new(MessageStranger, PregelConfig::for_testing().with_workers(2))
        .run_values(vec![Vertex::new(1, 0), Vertex::new(2, 0)])
        .await
        .unwrap();
    assert_eq!(values[&99], 10);
    assert_eq!(result.total_vertices, 3);
}

#[tokio::test]
async fn test_message_to_missing_vertex_dropped_when_disabled() {
    let config = PregelConfig::for_testing().with_workers(2).with_create_missing_vertices(false);
    let (result, values) = PregelRuntime::new(MessageStranger, config)
        .run_values(vec![Vertex::new(1, 0), Vertex::new(2, 0)])
        .await
        .unwrap();
    assert!(!values.contains_key(&99));
    assert_eq!(result.total_vertices, 2);
}

/// Vertex 0 gives vertex 1 an edge; once woken by it, vertex 1 messages vertex 2
struct Nudge;

#[async_trait]
impl Computation for Nudge {
    type Id = u64;
    type Value = u64;
    type Edge = u32;
    type Message = u64;

    async fn compute(
        &self,
        vertex: &mut Vertex<u64, u64, u32>,
        _messages: Messages<u64>,
        ctx: &mut ComputeContext<'_, Self>,
    ) -> PregelResult<()> {
        *vertex.value_mut() += 1;
        match (ctx.superstep(), *vertex.id()) {
            (0, 0) => ctx.add_edge_request(1, Edge::new(3, 1)),
            (1, 1) => ctx.send_message(2, 1),
            _ => {}
        }
        ctx.vote_to_halt();
        Ok(())
    }
}

#[tokio::test]
async fn test_mutation_wakeup_survives_checkpoint_rollback() {
    let config = config(ActivationPolicy::MessagesOrMutations)
        .with_checkpoint(CheckpointPolicy::every(1))
        .with_barrier_timeout(Duration::from_secs(2));
    let vertices = || (0..4u64).map(|id| Vertex::new(id, 0));

    let (expected, expected_values) = PregelRuntime::new(Nudge, config.clone())
        .run_values(vertices())
        .await
        .unwrap();
    assert_eq!(expected.supersteps, 3);
    assert_eq!(expected_values.values().copied().collect::<Vec<_>>(), vec![1, 2, 2, 1]);

    // Both workers die after checkpoint 1 recorded the woken vertex 1.
    let faults = Arc::new(FaultInjector::new());
    for worker in 0..2 {
        faults.inject(Fault::CrashWorker {
            worker: WorkerId(worker),
            superstep: 2,
        });
    }
    let (result, values) = PregelRuntime::new(Nudge, config)
        .with_fault_injector(faults)
        .run_values(vertices())
        .await
        .unwrap();
    assert_eq!(result.recoveries, 1);
    assert!(result.checkpoints.contains(&1));
    assert_eq!(result.supersteps, expected.supersteps);
    assert_eq!(values, expected_values);
}
