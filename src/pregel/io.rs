//! Graph input and result output adapters
//!
//! Workers call a [`VertexReader`] when they load (or reload, during a
//! recovery without a checkpoint) and a [`VertexWriter`] once the job halts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::PregelResult;
use super::partition::WorkerId;
use super::vertex::Vertex;

/// Ownership test handed to a reader: true for ids the calling worker owns
pub type OwnershipFn<'a, I> = &'a (dyn Fn(&I) -> bool + Send + Sync);

/// Source of the initial graph
#[async_trait]
pub trait VertexReader<I, V, E>: Send + Sync {
    /// Vertices for which `owns` returns true
    async fn read(&self, owns: OwnershipFn<'_, I>) -> PregelResult<Vec<Vertex<I, V, E>>>;
}

/// Sink for final vertex state
#[async_trait]
pub trait VertexWriter<I, V, E>: Send + Sync {
    async fn write(&self, worker: WorkerId, vertices: Vec<Vertex<I, V, E>>) -> PregelResult<()>;
}

/// A graph held in memory, read by every worker
#[derive(Debug, Clone, Default)]
pub struct InMemoryGraph<I, V, E> {
    vertices: Vec<Vertex<I, V, E>>,
}

impl<I, V, E> InMemoryGraph<I, V, E> {
    pub fn new(vertices: Vec<Vertex<I, V, E>>) -> Self {
        Self { vertices }
    }

    pub fn add_vertex(&mut self, vertex: Vertex<I, V, E>) {
        self.vertices.push(vertex);
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertices(&self) -> &[Vertex<I, V, E>] {
        &self.vertices
    }
}

impl<I, V, E> FromIterator<Vertex<I, V, E>> for InMemoryGraph<I, V, E> {
    fn from_iter<T: IntoIterator<Item = Vertex<I, V, E>>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[async_trait]
impl<I, V, E> VertexReader<I, V, E> for InMemoryGraph<I, V, E>
where
    I: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn read(&self, owns: OwnershipFn<'_, I>) -> PregelResult<Vec<Vertex<I, V, E>>> {
        Ok(self.vertices.iter().filter(|v| owns(v.id())).cloned().collect())
    }
}

/// Keeps every written vertex in memory
#[derive(Debug, Default)]
pub struct CollectingWriter<I, V, E> {
    written: Mutex<Vec<(WorkerId, Vertex<I, V, E>)>>,
}

impl<I, V, E> CollectingWriter<I, V, E>
where
    I: Ord + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
        }
    }

    /// Written vertices in id order
    pub fn vertices(&self) -> Vec<Vertex<I, V, E>> {
        let written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        let mut vertices: Vec<_> = written.iter().map(|(_, v)| v.clone()).collect();
        vertices.sort_by(|a, b| a.id().cmp(b.id()));
        vertices
    }

    /// Final value per vertex id
    pub fn values(&self) -> BTreeMap<I, V> {
        let written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        written
            .iter()
            .map(|(_, v)| (v.id().clone(), v.value().clone()))
            .collect()
    }

    /// Which worker wrote each vertex
    pub fn writers(&self) -> BTreeMap<I, WorkerId> {
        let written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        written.iter().map(|(w, v)| (v.id().clone(), *w)).collect()
    }

    pub fn len(&self) -> usize {
        self.written.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<I, V, E> VertexWriter<I, V, E> for CollectingWriter<I, V, E>
where
    I: Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    async fn write(&self, worker: WorkerId, vertices: Vec<Vertex<I, V, E>>) -> PregelResult<()> {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        written.extend(vertices.into_iter().map(|v| (worker, v)));
        Ok(())
    }
}

/// Discards results
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWriter;

#[async_trait]
impl<I, V, E> VertexWriter<I, V, E> for NullWriter
where
    I: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    async fn write(&self, _worker: WorkerId, _vertices: Vec<Vertex<I, V, E>>) -> PregelResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pregel::vertex::Edge;

    #[tokio::test]
    async fn test_reader_filters_by_ownership() {
        let graph: InMemoryGraph<u64, f64, ()> = (0..10u64)
            .map(|id| Vertex::with_edges(id, id as f64, vec![Edge::new((id + 1) % 10, ())]))
            .collect();
        assert_eq!(graph.len(), 10);

        let even = |id: &u64| id % 2 == 0;
        let vertices = graph.read(&even).await.unwrap();
        assert_eq!(vertices.len(), 5);
        assert!(vertices.iter().all(|v| v.id() % 2 == 0));
    }

    #[tokio::test]
    async fn test_collecting_writer() {
        let writer = CollectingWriter::<u64, i32, ()>::new();
        writer
            .write(WorkerId(1), vec![Vertex::new(5, 50), Vertex::new(2, 20)])
            .await
            .unwrap();
        writer.write(WorkerId(0), vec![Vertex::new(3, 30)]).await.unwrap();

        assert_eq!(writer.len(), 3);
        let ids: Vec<u64> = writer.vertices().iter().map(|v| *v.id()).collect();
        assert_eq!(ids, vec![2, 3, 5]);
        assert_eq!(writer.values()[&5], 50);
        assert_eq!(writer.writers()[&3], WorkerId(0));

        let null = NullWriter;
        VertexWriter::<u64, i32, ()>::write(&null, WorkerId(0), vec![Vertex::new(1, 1)])
            .await
            .unwrap();
    }
}
