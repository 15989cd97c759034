//! Partition store
//!
//! Each worker keeps the partitions it owns in a [`PartitionStore`]. During
//! compute the partitions are moved out by value, one per task, so two tasks
//! can never hold the same vertex. Graph mutations are staged while compute
//! runs and applied in one exclusive pass before the next superstep.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{PregelError, PregelResult};
use super::partition::{PartitionId, Partitioner, WorkerId};
use super::vertex::{Edge, Vertex, VertexKey};

/// Staged change to the graph topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation<I, V, E> {
    AddVertex { id: I, value: V },
    RemoveVertex { id: I },
    AddEdge { source: I, edge: Edge<I, E> },
    RemoveEdges { source: I, target: I },
}

impl<I, V, E> Mutation<I, V, E> {
    /// Vertex whose owner applies this mutation
    pub fn vertex(&self) -> &I {
        match self {
            Self::AddVertex { id, .. } | Self::RemoveVertex { id } => id,
            Self::AddEdge { source, .. } | Self::RemoveEdges { source, .. } => source,
        }
    }

    fn phase(&self) -> u8 {
        match self {
            Self::RemoveEdges { .. } => 0,
            Self::RemoveVertex { .. } => 1,
            Self::AddVertex { .. } => 2,
            Self::AddEdge { .. } => 3,
        }
    }
}

/// A shard of the vertex set, ordered by vertex id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition<I: Ord, V, E> {
    id: PartitionId,
    vertices: BTreeMap<I, Vertex<I, V, E>>,
}

impl<I: Ord + Clone, V, E> Partition<I, V, E> {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            vertices: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn contains(&self, id: &I) -> bool {
        self.vertices.contains_key(id)
    }

    pub fn get(&self, id: &I) -> Option<&Vertex<I, V, E>> {
        self.vertices.get(id)
    }

    pub fn get_mut(&mut self, id: &I) -> Option<&mut Vertex<I, V, E>> {
        self.vertices.get_mut(id)
    }

    pub fn insert(&mut self, vertex: Vertex<I, V, E>) -> Option<Vertex<I, V, E>> {
        self.vertices.insert(vertex.id().clone(), vertex)
    }

    pub fn remove(&mut self, id: &I) -> Option<Vertex<I, V, E>> {
        self.vertices.remove(id)
    }

    /// Vertices in id order. Each call starts a fresh pass.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex<I, V, E>> {
        self.vertices.values()
    }

    pub fn vertices_mut(&mut self) -> impl Iterator<Item = &mut Vertex<I, V, E>> {
        self.vertices.values_mut()
    }

    pub fn edge_count(&self) -> usize {
        self.vertices.values().map(Vertex::num_edges).sum()
    }

    pub fn halted_count(&self) -> usize {
        self.vertices.values().filter(|v| v.is_halted()).count()
    }

    pub fn into_vertices(self) -> impl Iterator<Item = Vertex<I, V, E>> {
        self.vertices.into_values()
    }
}

/// Counters from one mutation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationStats {
    pub vertices_added: usize,
    pub vertices_removed: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
    pub dropped: usize,
}

/// Owned partitions of one worker plus staged mutations
pub struct PartitionStore<I: VertexKey, V, E> {
    worker: WorkerId,
    partitioner: Arc<dyn Partitioner<I>>,
    partitions: BTreeMap<PartitionId, Partition<I, V, E>>,
    staged: Vec<Mutation<I, V, E>>,
}

impl<I, V, E> PartitionStore<I, V, E>
where
    I: VertexKey,
    V: Default,
{
    pub fn new(worker: WorkerId, partitioner: Arc<dyn Partitioner<I>>) -> Self {
        Self {
            worker,
            partitioner,
            partitions: BTreeMap::new(),
            staged: Vec::new(),
        }
    }

    /// Drop all state and take ownership of `owned` (empty) partitions
    pub fn reset(&mut self, owned: &[PartitionId]) {
        self.partitions = owned.iter().map(|&p| (p, Partition::new(p))).collect();
        self.staged.clear();
    }

    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    pub fn owns(&self, partition: PartitionId) -> bool {
        self.partitions.contains_key(&partition)
    }

    pub fn partition(&self, partition: PartitionId) -> Option<&Partition<I, V, E>> {
        self.partitions.get(&partition)
    }

    /// Partition of `id` under the job's partitioner
    pub fn partition_of(&self, id: &I) -> PartitionId {
        self.partitioner.assign(id)
    }

    /// Whether `id` belongs to one of the owned partitions
    pub fn owns_vertex(&self, id: &I) -> bool {
        self.owns(self.partition_of(id))
    }

    /// Insert a vertex into its partition, rejecting vertices owned elsewhere
    pub fn insert(&mut self, vertex: Vertex<I, V, E>) -> PregelResult<()> {
        let partition = self.partition_of(vertex.id());
        match self.partitions.get_mut(&partition) {
            Some(p) => {
                p.insert(vertex);
                Ok(())
            }
            None => Err(PregelError::MisroutedVertex {
                vertex: format!("{:?}", vertex.id()),
                partition,
                worker: self.worker,
            }),
        }
    }

    /// Replace a whole partition (checkpoint restore)
    pub fn install(&mut self, partition: Partition<I, V, E>) -> PregelResult<()> {
        if !self.owns(partition.id()) {
            return Err(PregelError::MisroutedVertex {
                vertex: "<partition>".to_string(),
                partition: partition.id(),
                worker: self.worker,
            });
        }
        self.partitions.insert(partition.id(), partition);
        Ok(())
    }

    pub fn contains(&self, id: &I) -> bool {
        self.partitions
            .get(&self.partition_of(id))
            .is_some_and(|p| p.contains(id))
    }

    pub fn get_mut(&mut self, id: &I) -> Option<&mut Vertex<I, V, E>> {
        let partition = self.partition_of(id);
        self.partitions.get_mut(&partition).and_then(|p| p.get_mut(id))
    }

    /// Create `id` with the default value if it is owned here and missing.
    ///
    /// Returns whether the vertex exists afterwards.
    pub fn ensure_vertex(&mut self, id: &I, create_missing: bool) -> bool {
        let partition = self.partition_of(id);
        let Some(p) = self.partitions.get_mut(&partition) else {
            return false;
        };
        if p.contains(id) {
            return true;
        }
        if !create_missing {
            return false;
        }
        p.insert(Vertex::new(id.clone(), V::default()));
        true
    }

    /// Move every partition out for compute, in partition order
    pub fn take_partitions(&mut self) -> Vec<Partition<I, V, E>> {
        std::mem::take(&mut self.partitions).into_values().collect()
    }

    /// Hand partitions back after compute
    pub fn return_partitions(&mut self, partitions: impl IntoIterator<Item = Partition<I, V, E>>) {
        for partition in partitions {
            self.partitions.insert(partition.id(), partition);
        }
    }

    pub fn stage(&mut self, mutations: impl IntoIterator<Item = Mutation<I, V, E>>) {
        self.staged.extend(mutations);
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Apply staged mutations. Must not run while partitions are taken.
    ///
    /// Order is remove-edges, remove-vertex, add-vertex, add-edges; within a
    /// phase, staging order. Adding an existing vertex keeps the existing one.
    /// Returns the ids whose edge lists changed or that were created.
    pub fn apply_mutations(&mut self, create_missing: bool) -> (BTreeSet<I>, MutationStats) {
        let mut staged = std::mem::take(&mut self.staged);
        staged.sort_by_key(Mutation::phase);

        let mut touched = BTreeSet::new();
        let mut stats = MutationStats::default();

        for mutation in staged {
            let partition = self.partition_of(mutation.vertex());
            let Some(p) = self.partitions.get_mut(&partition) else {
                tracing::warn!(
                    worker = %self.worker,
                    partition,
                    vertex = ?mutation.vertex(),
                    "dropping mutation for a partition this worker does not own"
                );
                stats.dropped += 1;
                continue;
            };

            match mutation {
                Mutation::RemoveEdges { source, target } => {
                    if let Some(vertex) = p.get_mut(&source) {
                        let removed = vertex.remove_edges_to(&target);
                        if removed > 0 {
                            stats.edges_removed += removed;
                            touched.insert(source);
                        }
                    }
                }
                Mutation::RemoveVertex { id } => {
                    if p.remove(&id).is_some() {
                        stats.vertices_removed += 1;
                        touched.remove(&id);
                    }
                }
                Mutation::AddVertex { id, value } => {
                    if !p.contains(&id) {
                        p.insert(Vertex::new(id.clone(), value));
                        stats.vertices_added += 1;
                        touched.insert(id);
                    }
                }
                Mutation::AddEdge { source, edge } => {
                    if !p.contains(&source) {
                        if !create_missing {
                            stats.dropped += 1;
                            continue;
                        }
                        p.insert(Vertex::new(source.clone(), V::default()));
                        stats.vertices_added += 1;
                    }
                    if let Some(vertex) = p.get_mut(&source) {
                        vertex.push_edge(edge);
                        stats.edges_added += 1;
                        touched.insert(source);
                    }
                }
            }
        }

        (touched, stats)
    }

    pub fn vertex_count(&self) -> usize {
        self.partitions.values().map(Partition::len).sum()
    }

    pub fn edge_count(&self) -> usize {
        self.partitions.values().map(Partition::edge_count).sum()
    }

    pub fn halted_count(&self) -> usize {
        self.partitions.values().map(Partition::halted_count).sum()
    }

    /// Move all vertices out, in partition then id order
    pub fn drain_vertices(&mut self) -> Vec<Vertex<I, V, E>> {
        self.take_partitions()
            .into_iter()
            .flat_map(Partition::into_vertices)
            .collect()
    }
}
