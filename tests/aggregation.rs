//! Aggregator visibility, persistence and determinism

use async_trait::async_trait;
use pregel_bsp::pregel::{
    AggregateValue, AggregatorDef, Computation, ComputeContext, MasterCompute, MasterContext, Messages, PregelConfig,
    PregelResult, PregelRuntime, Vertex,
};

/// Each vertex folds `id + superstep` into `sum` and `total`, folds
/// `id / 7` into `fraction`, and records the `sum` it could read
struct Observe;

#[async_trait]
impl Computation for Observe {
    type Id = u64;
    type Value = Vec<i64>;
    type Edge = ();
    type Message = ();

    async fn compute(
        &self,
        vertex: &mut Vertex<u64, Vec<i64>, ()>,
        _messages: Messages<()>,
        ctx: &mut ComputeContext<'_, Self>,
    ) -> PregelResult<()> {
        let seen = ctx.get_aggregated_value("sum").and_then(AggregateValue::as_i64).unwrap_or(-1);
        vertex.value_mut().push(seen);

        let contribution = (*vertex.id() + ctx.superstep()) as i64;
        ctx.aggregate("sum", contribution)?;
        ctx.aggregate("total", contribution)?;
        ctx.aggregate("fraction", *vertex.id() as f64 / 7.0)?;
        Ok(())
    }
}

fn runtime(config: PregelConfig) -> PregelRuntime<Observe> {
    PregelRuntime::new(Observe, config.with_max_supersteps(4))
        .with_aggregator("sum", AggregatorDef::long_sum())
        .with_aggregator("total", AggregatorDef::long_sum().persistent())
        .with_aggregator("fraction", AggregatorDef::double_sum())
}

fn vertices() -> impl Iterator<Item = Vertex<u64, Vec<i64>, ()>> {
    (0..10u64).map(|id| Vertex::new(id, Vec::new()))
}

#[tokio::test]
async fn test_values_visible_one_superstep_later() {
    let config = PregelConfig::for_testing().with_workers(3).with_partition_count(9);
    let (result, values) = runtime(config).run_values(vertices()).await.unwrap();

    // Superstep s contributes 45 + 10 * s in total.
    for seen in values.values() {
        assert_eq!(seen, &vec![0, 45, 55, 65]);
    }
    assert_eq!(result.aggregate("sum"), Some(&AggregateValue::Long(75)));
    assert_eq!(result.aggregate("total"), Some(&AggregateValue::Long(45 + 55 + 65 + 75)));
}

#[tokio::test]
async fn test_aggregates_deterministic_for_fixed_config() {
    let config = PregelConfig::for_testing().with_workers(3).with_partition_count(9);
    let (first, _) = runtime(config.clone()).run_values(vertices()).await.unwrap();
    let (second, _) = runtime(config).run_values(vertices()).await.unwrap();

    assert_eq!(first.aggregates, second.aggregates);
    let fraction = first.aggregate("fraction").and_then(AggregateValue::as_f64).unwrap();
    assert!((fraction - 45.0 / 7.0).abs() < 1e-9);
}

/// Overrides `sum` before superstep 2
struct Override;

#[async_trait]
impl MasterCompute for Override {
    async fn compute(&mut self, ctx: &mut MasterContext<'_>) -> PregelResult<()> {
        if ctx.superstep() == 2 {
            ctx.set_aggregated_value("sum", 1000i64)?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_master_compute_override_reaches_vertices() {
    let config = PregelConfig::for_testing().with_workers(2);
    let (_, values) = runtime(config)
        .with_master_compute(Override)
        .run_values(vertices())
        .await
        .unwrap();
    for seen in values.values() {
        assert_eq!(seen, &vec![0, 45, 1000, 65]);
    }
}

/// Registers its aggregator from master compute instead of the builder
struct Registering;

#[async_trait]
impl MasterCompute for Registering {
    async fn initialize(&mut self, ctx: &mut MasterContext<'_>) -> PregelResult<()> {
        ctx.register_aggregator("any", AggregatorDef::bool_or())
    }

    async fn compute(&mut self, ctx: &mut MasterContext<'_>) -> PregelResult<()> {
        if ctx.get_aggregated_value("any").and_then(AggregateValue::as_bool) == Some(true) {
            ctx.halt_computation();
        }
        Ok(())
    }
}

/// Vertex 3 raises the flag in superstep 1
struct Flag;

#[async_trait]
impl Computation for Flag {
    type Id = u64;
    type Value = ();
    type Edge = ();
    type Message = ();

    async fn compute(
        &self,
        vertex: &mut Vertex<u64, (), ()>,
        _messages: Messages<()>,
        ctx: &mut ComputeContext<'_, Self>,
    ) -> PregelResult<()> {
        ctx.aggregate("any", *vertex.id() == 3 && ctx.superstep() == 1)?;
        Ok(())
    }
}

#[tokio::test]
async fn test_master_registered_aggregator_drives_halt() {
    let (result, _) = PregelRuntime::new(Flag, PregelConfig::for_testing().with_workers(2))
        .with_master_compute(Registering)
        .run_values((0..5u64).map(|id| Vertex::new(id, ())))
        .await
        .unwrap();
    assert_eq!(result.supersteps, 2);
    assert_eq!(result.aggregate("any"), Some(&AggregateValue::Bool(true)));
}
