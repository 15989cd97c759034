//! Fixed-iteration PageRank
//!
//! Every vertex starts from its input value, then for [`MAX_SUPERSTEPS`]
//! supersteps takes `0.15 / N + 0.85 * sum(incoming)` and spreads its value
//! evenly over its out-edges. Three aggregators track the run: a regular
//! vertex count and persistent minimum and maximum values.

use async_trait::async_trait;

use crate::pregel::{
    AggregatorDef, Computation, ComputeContext, Edge, MasterCompute, MasterContext, Messages, PregelError, PregelResult,
    Vertex,
};

/// Supersteps after which every vertex halts
pub const MAX_SUPERSTEPS: u64 = 30;

pub const SUM_AGG: &str = "sum";
pub const MIN_AGG: &str = "min";
pub const MAX_AGG: &str = "max";

/// Damping factor
const DAMPING: f64 = 0.85;

#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePageRank;

#[async_trait]
impl Computation for SimplePageRank {
    type Id = u64;
    type Value = f64;
    type Edge = f32;
    type Message = f64;

    async fn compute(
        &self,
        vertex: &mut Vertex<u64, f64, f32>,
        messages: Messages<f64>,
        ctx: &mut ComputeContext<'_, Self>,
    ) -> PregelResult<()> {
        if ctx.superstep() >= 1 {
            let sum: f64 = messages.sum();
            let value = (1.0 - DAMPING) / ctx.total_num_vertices() as f64 + DAMPING * sum;
            vertex.set_value(value);
            ctx.aggregate(MAX_AGG, value)?;
            ctx.aggregate(MIN_AGG, value)?;
            ctx.aggregate(SUM_AGG, 1i64)?;
        }

        if ctx.superstep() < MAX_SUPERSTEPS {
            let edges = vertex.num_edges();
            if edges > 0 {
                ctx.send_message_to_all_edges(vertex, vertex.value() / edges as f64);
            }
        } else {
            ctx.vote_to_halt();
        }
        Ok(())
    }
}

/// Registers the PageRank aggregators and checks the vertex count
#[derive(Debug, Clone, Copy, Default)]
pub struct PageRankMasterCompute;

#[async_trait]
impl MasterCompute for PageRankMasterCompute {
    async fn initialize(&mut self, ctx: &mut MasterContext<'_>) -> PregelResult<()> {
        ctx.register_aggregator(SUM_AGG, AggregatorDef::long_sum())?;
        ctx.register_aggregator(MIN_AGG, AggregatorDef::double_min().persistent())?;
        ctx.register_aggregator(MAX_AGG, AggregatorDef::double_max().persistent())?;
        Ok(())
    }

    async fn compute(&mut self, ctx: &mut MasterContext<'_>) -> PregelResult<()> {
        // Vertices count themselves into the sum from superstep 1 on.
        if ctx.superstep() >= 3 {
            let sum = ctx.get_aggregated_value(SUM_AGG).and_then(|v| v.as_i64()).unwrap_or(0);
            if sum as u64 != ctx.total_num_vertices() {
                return Err(PregelError::MasterCompute(format!(
                    "aggregated vertex count {} does not match {} vertices at superstep {}",
                    sum,
                    ctx.total_num_vertices(),
                    ctx.superstep()
                )));
            }
        }
        Ok(())
    }
}

/// A directed ring of `n` vertices: vertex `i` has value `10 * i` and one
/// edge to `(i + 1) % n` weighted `100 * i`
pub fn ring_graph(n: u64) -> Vec<Vertex<u64, f64, f32>> {
    (0..n)
        .map(|id| Vertex::with_edges(id, id as f64 * 10.0, vec![Edge::new((id + 1) % n, id as f32 * 100.0)]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_graph_shape() {
        let ring = ring_graph(5);
        assert_eq!(ring.len(), 5);
        assert_eq!(*ring[4].value(), 40.0);
        assert_eq!(ring[4].edges()[0].target, 0);
        assert_eq!(ring[3].edges()[0].value, 300.0);
        assert!(ring_graph(0).is_empty());
    }
}
