//! Vertex abstraction and the vertex-compute API
//!
//! User algorithms implement [`Computation`]: one `compute` call per active
//! vertex per superstep, receiving the vertex, the messages sent to it in the
//! previous superstep, and a [`ComputeContext`] for sending messages,
//! aggregating, mutating the graph and voting to halt.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::aggregator::{AggregateValue, AggregatorPartials};
use super::error::PregelResult;
use super::protocol::SuperstepGlobals;
use super::store::Mutation;

/// Bounds every vertex identifier satisfies
pub trait VertexKey:
    Clone + Eq + Hash + Ord + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> VertexKey for T where
    T: Clone + Eq + Hash + Ord + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Bounds every vertex value, edge value and message satisfies
pub trait Payload: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Outgoing edge: target vertex plus edge value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge<I, E> {
    pub target: I,
    pub value: E,
}

impl<I, E> Edge<I, E> {
    pub fn new(target: I, value: E) -> Self {
        Self { target, value }
    }
}

/// Scheduling state of a vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexState {
    /// Computed in the next superstep
    #[default]
    Active,
    /// Skipped until a message (or, by policy, an edge mutation) arrives
    Halted,
}

/// A vertex with its value and outgoing edges
///
/// Edges are read-only during a superstep. They change only through staged
/// mutations applied at the barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex<I, V, E> {
    id: I,
    value: V,
    edges: Vec<Edge<I, E>>,
    state: VertexState,
}

impl<I, V, E> Vertex<I, V, E> {
    /// Create an active vertex without edges
    pub fn new(id: I, value: V) -> Self {
        Self {
            id,
            value,
            edges: Vec::new(),
            state: VertexState::Active,
        }
    }

    /// Create an active vertex with edges
    pub fn with_edges(id: I, value: V, edges: Vec<Edge<I, E>>) -> Self {
        Self {
            id,
            value,
            edges,
            state: VertexState::Active,
        }
    }

    pub fn id(&self) -> &I {
        &self.id
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn set_value(&mut self, value: V) {
        self.value = value;
    }

    pub fn edges(&self) -> &[Edge<I, E>] {
        &self.edges
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn state(&self) -> VertexState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == VertexState::Halted
    }

    pub(crate) fn halt(&mut self) {
        self.state = VertexState::Halted;
    }

    pub(crate) fn wake(&mut self) {
        self.state = VertexState::Active;
    }

    pub(crate) fn push_edge(&mut self, edge: Edge<I, E>) {
        self.edges.push(edge);
    }

    /// Remove every edge pointing at `target`, returning how many were removed
    pub(crate) fn remove_edges_to(&mut self, target: &I) -> usize
    where
        I: PartialEq,
    {
        let before = self.edges.len();
        self.edges.retain(|edge| &edge.target != target);
        before - self.edges.len()
    }
}

/// Messages delivered to one vertex for one superstep.
///
/// Finite and consumed once; there is no way to restart iteration.
#[derive(Debug)]
pub struct Messages<M> {
    inner: std::vec::IntoIter<M>,
}

impl<M> Messages<M> {
    pub fn new(messages: Vec<M>) -> Self {
        Self {
            inner: messages.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Whether no messages remain
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl<M> Iterator for Messages<M> {
    type Item = M;

    fn next(&mut self) -> Option<M> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<M> ExactSizeIterator for Messages<M> {}

/// Per-vertex user logic, fixed for a job
#[async_trait]
pub trait Computation: Send + Sync + 'static {
    type Id: VertexKey;
    type Value: Payload + Default;
    type Edge: Payload;
    type Message: Payload;

    /// Compute one vertex for the current superstep.
    ///
    /// An error fails the whole worker for this superstep and the job rolls
    /// back to the last checkpoint.
    async fn compute(
        &self,
        vertex: &mut Vertex<Self::Id, Self::Value, Self::Edge>,
        messages: Messages<Self::Message>,
        ctx: &mut ComputeContext<'_, Self>,
    ) -> PregelResult<()>;
}

/// Vertex type of a computation
pub type VertexOf<C> = Vertex<<C as Computation>::Id, <C as Computation>::Value, <C as Computation>::Edge>;

/// Edge type of a computation
pub type EdgeOf<C> = Edge<<C as Computation>::Id, <C as Computation>::Edge>;

/// Mutation type of a computation
pub type MutationOf<C> = Mutation<<C as Computation>::Id, <C as Computation>::Value, <C as Computation>::Edge>;

/// Messages produced by one compute task, in send order
pub type Outbox<C> = Vec<(<C as Computation>::Id, <C as Computation>::Message)>;

/// Context handed to [`Computation::compute`]
pub struct ComputeContext<'a, C: Computation + ?Sized> {
    globals: &'a SuperstepGlobals,
    outbox: &'a mut Outbox<C>,
    partials: &'a mut AggregatorPartials,
    mutations: &'a mut Vec<MutationOf<C>>,
    halt_requested: bool,
}

impl<'a, C: Computation + ?Sized> ComputeContext<'a, C> {
    pub fn new(
        globals: &'a SuperstepGlobals,
        outbox: &'a mut Outbox<C>,
        partials: &'a mut AggregatorPartials,
        mutations: &'a mut Vec<MutationOf<C>>,
    ) -> Self {
        Self {
            globals,
            outbox,
            partials,
            mutations,
            halt_requested: false,
        }
    }

    /// Current superstep number
    pub fn superstep(&self) -> u64 {
        self.globals.superstep
    }

    /// Vertices in the graph as of the previous superstep
    pub fn total_num_vertices(&self) -> u64 {
        self.globals.total_vertices
    }

    /// Edges in the graph as of the previous superstep
    pub fn total_num_edges(&self) -> u64 {
        self.globals.total_edges
    }

    /// Send a message, delivered to `target` in the next superstep
    pub fn send_message(&mut self, target: C::Id, message: C::Message) {
        self.outbox.push((target, message));
    }

    /// Send the same message along every outgoing edge of `vertex`
    pub fn send_message_to_all_edges(&mut self, vertex: &VertexOf<C>, message: C::Message) {
        for edge in vertex.edges() {
            self.outbox.push((edge.target.clone(), message.clone()));
        }
    }

    /// Fold a value into a registered aggregator
    pub fn aggregate(&mut self, name: &str, value: impl Into<AggregateValue>) -> PregelResult<()> {
        self.partials.aggregate(name, value.into())
    }

    /// Global value of an aggregator as of the end of the previous superstep
    pub fn get_aggregated_value(&self, name: &str) -> Option<&AggregateValue> {
        self.globals.aggregates.get(name)
    }

    /// Stop scheduling this vertex until it receives a message
    pub fn vote_to_halt(&mut self) {
        self.halt_requested = true;
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt_requested
    }

    /// Request a new vertex, created at the next barrier
    pub fn add_vertex_request(&mut self, id: C::Id, value: C::Value) {
        self.mutations.push(Mutation::AddVertex { id, value });
    }

    /// Request removal of a vertex at the next barrier
    pub fn remove_vertex_request(&mut self, id: C::Id) {
        self.mutations.push(Mutation::RemoveVertex { id });
    }

    /// Request a new edge on `source`, added at the next barrier
    pub fn add_edge_request(&mut self, source: C::Id, edge: EdgeOf<C>) {
        self.mutations.push(Mutation::AddEdge { source, edge });
    }

    /// Request removal of all `source -> target` edges at the next barrier
    pub fn remove_edges_request(&mut self, source: C::Id, target: C::Id) {
        self.mutations.push(Mutation::RemoveEdges { source, target });
    }

    /// Messages sent through this context's task so far
    pub fn messages_sent(&self) -> usize {
        self.outbox.len()
    }

    /// Reset the halt vote before the next vertex reuses this context's buffers
    pub(crate) fn take_halt_vote(&mut self) -> bool {
        std::mem::take(&mut self.halt_requested)
    }
}
