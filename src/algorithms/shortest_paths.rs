//! Single-source shortest paths over non-negative edge weights

use async_trait::async_trait;

use crate::pregel::{Computation, ComputeContext, Messages, PregelResult, Vertex};

/// Distance of an unreached vertex
pub const UNREACHED: f64 = f64::MAX;

/// Each vertex keeps the shortest known distance from `source` and relaxes
/// its out-edges when that distance improves. Pair with `MinCombiner`.
#[derive(Debug, Clone, Copy)]
pub struct SimpleShortestPaths {
    pub source: u64,
}

impl SimpleShortestPaths {
    pub fn new(source: u64) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Computation for SimpleShortestPaths {
    type Id = u64;
    type Value = f64;
    type Edge = f64;
    type Message = f64;

    async fn compute(
        &self,
        vertex: &mut Vertex<u64, f64, f64>,
        messages: Messages<f64>,
        ctx: &mut ComputeContext<'_, Self>,
    ) -> PregelResult<()> {
        if ctx.superstep() == 0 {
            vertex.set_value(UNREACHED);
        }
        let start = if *vertex.id() == self.source { 0.0 } else { UNREACHED };
        let min_dist = messages.fold(start, f64::min);

        if min_dist < *vertex.value() {
            vertex.set_value(min_dist);
            tracing::trace!(vertex = *vertex.id(), distance = min_dist, "distance improved");
            for edge in vertex.edges() {
                ctx.send_message(edge.target, min_dist + edge.value);
            }
        }
        ctx.vote_to_halt();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pregel::{Edge, MinCombiner, PregelConfig, PregelRuntime};

    fn diamond() -> Vec<Vertex<u64, f64, f64>> {
        vec![
            Vertex::with_edges(0, 0.0, vec![Edge::new(1, 1.0), Edge::new(2, 4.0)]),
            Vertex::with_edges(1, 0.0, vec![Edge::new(2, 2.0), Edge::new(3, 6.0)]),
            Vertex::with_edges(2, 0.0, vec![Edge::new(3, 3.0)]),
            Vertex::with_edges(3, 0.0, vec![]),
            Vertex::with_edges(4, 0.0, vec![Edge::new(0, 1.0)]),
        ]
    }

    #[tokio::test]
    async fn test_shortest_paths_with_combiner() {
        let config = PregelConfig::for_testing().with_workers(2).with_partition_count(4);
        let (result, distances) = PregelRuntime::new(SimpleShortestPaths::new(0), config)
            .with_combiner(MinCombiner)
            .run_values(diamond())
            .await
            .unwrap();

        assert_eq!(distances[&0], 0.0);
        assert_eq!(distances[&1], 1.0);
        assert_eq!(distances[&2], 3.0);
        assert_eq!(distances[&3], 6.0);
        assert_eq!(distances[&4], UNREACHED);
        assert_eq!(result.total_vertices, 5);
    }

    #[tokio::test]
    async fn test_combiner_does_not_change_distances() {
        let config = PregelConfig::for_testing().with_partition_count(3);
        let (_, plain) = PregelRuntime::new(SimpleShortestPaths::new(4), config.clone())
            .run_values(diamond())
            .await
            .unwrap();
        let (_, combined) = PregelRuntime::new(SimpleShortestPaths::new(4), config)
            .with_combiner(MinCombiner)
            .run_values(diamond())
            .await
            .unwrap();
        assert_eq!(plain, combined);
        assert_eq!(plain[&3], 7.0);
    }
}
