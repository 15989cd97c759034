//! Aggregators: named, globally combined values
//!
//! Vertices fold values into a per-task [`AggregatorPartials`] during a
//! superstep. At the barrier the Master folds every worker's partials into the
//! [`AggregatorRegistry`] and ships an immutable [`AggregatorSnapshot`] with the
//! next superstep's start signal. Vertices only ever read a snapshot, so a
//! half-merged value is never observable.
//!
//! The combine function must be commutative and associative, and the initial
//! value must be its identity. The engine does not check this; it is the
//! caller's obligation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{PregelError, PregelResult};

/// A value carried by an aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AggregateValue {
    Long(i64),
    Double(f64),
    Bool(bool),
    Text(String),
}

impl AggregateValue {
    /// Integer view. Doubles truncate, booleans map to 0/1.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            Self::Double(v) => Some(*v as i64),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::Text(_) => None,
        }
    }

    /// Floating point view
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Long(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }

    /// Boolean view. Numbers are true when non-zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Long(v) => Some(*v != 0),
            Self::Double(v) => Some(*v != 0.0),
            Self::Bool(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Text view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for AggregateValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<i32> for AggregateValue {
    fn from(v: i32) -> Self {
        Self::Long(i64::from(v))
    }
}

impl From<u32> for AggregateValue {
    fn from(v: u32) -> Self {
        Self::Long(i64::from(v))
    }
}

impl From<f64> for AggregateValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<f32> for AggregateValue {
    fn from(v: f32) -> Self {
        Self::Double(f64::from(v))
    }
}

impl From<bool> for AggregateValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for AggregateValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for AggregateValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl fmt::Display for AggregateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Combine function shared by the Master and every worker
pub type CombineFn = Arc<dyn Fn(&AggregateValue, &AggregateValue) -> AggregateValue + Send + Sync>;

/// Whether the global value restarts from the initial value every superstep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorKind {
    /// Global value after superstep `i` is the combine of superstep `i`'s values only
    #[default]
    Regular,
    /// Global value keeps folding across supersteps
    Persistent,
}

/// Definition of a registered aggregator
#[derive(Clone)]
pub struct AggregatorDef {
    initial: AggregateValue,
    combine: CombineFn,
    kind: AggregatorKind,
}

impl fmt::Debug for AggregatorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorDef")
            .field("initial", &self.initial)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl AggregatorDef {
    /// Create a regular aggregator from an initial value and a combine function
    pub fn new<F>(initial: impl Into<AggregateValue>, combine: F) -> Self
    where
        F: Fn(&AggregateValue, &AggregateValue) -> AggregateValue + Send + Sync + 'static,
    {
        Self {
            initial: initial.into(),
            combine: Arc::new(combine),
            kind: AggregatorKind::Regular,
        }
    }

    /// Make this aggregator persistent
    pub fn persistent(mut self) -> Self {
        self.kind = AggregatorKind::Persistent;
        self
    }

    /// Sum of integers
    pub fn long_sum() -> Self {
        Self::new(0i64, |a, b| {
            AggregateValue::Long(a.as_i64().unwrap_or(0).wrapping_add(b.as_i64().unwrap_or(0)))
        })
    }

    /// Sum of doubles
    pub fn double_sum() -> Self {
        Self::new(0.0f64, |a, b| {
            AggregateValue::Double(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
        })
    }

    /// Minimum of doubles
    pub fn double_min() -> Self {
        Self::new(f64::MAX, |a, b| {
            AggregateValue::Double(a.as_f64().unwrap_or(f64::MAX).min(b.as_f64().unwrap_or(f64::MAX)))
        })
    }

    /// Maximum of doubles
    pub fn double_max() -> Self {
        Self::new(f64::MIN, |a, b| {
            AggregateValue::Double(a.as_f64().unwrap_or(f64::MIN).max(b.as_f64().unwrap_or(f64::MIN)))
        })
    }

    /// Logical AND
    pub fn bool_and() -> Self {
        Self::new(true, |a, b| {
            AggregateValue::Bool(a.as_bool().unwrap_or(true) && b.as_bool().unwrap_or(true))
        })
    }

    /// Logical OR
    pub fn bool_or() -> Self {
        Self::new(false, |a, b| {
            AggregateValue::Bool(a.as_bool().unwrap_or(false) || b.as_bool().unwrap_or(false))
        })
    }

    pub fn initial(&self) -> &AggregateValue {
        &self.initial
    }

    pub fn kind(&self) -> AggregatorKind {
        self.kind
    }

    /// Apply the combine function
    pub fn combine(&self, a: &AggregateValue, b: &AggregateValue) -> AggregateValue {
        (self.combine)(a, b)
    }
}

/// Registered aggregator definitions, keyed by name
pub type AggregatorDefinitions = BTreeMap<String, AggregatorDef>;

/// Global aggregator values visible during one superstep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSnapshot {
    values: BTreeMap<String, AggregateValue>,
}

impl AggregatorSnapshot {
    pub fn new(values: BTreeMap<String, AggregateValue>) -> Self {
        Self { values }
    }

    /// Value of an aggregator
    pub fn get(&self, name: &str) -> Option<&AggregateValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AggregateValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> BTreeMap<String, AggregateValue> {
        self.values
    }
}

/// Partial aggregates accumulated by one compute task or one worker
#[derive(Debug, Clone)]
pub struct AggregatorPartials {
    definitions: Arc<AggregatorDefinitions>,
    values: BTreeMap<String, AggregateValue>,
}

impl AggregatorPartials {
    pub fn new(definitions: Arc<AggregatorDefinitions>) -> Self {
        Self {
            definitions,
            values: BTreeMap::new(),
        }
    }

    /// Fold `value` into the partial for `name`.
    ///
    /// Referencing an aggregator nobody registered is a fatal configuration error.
    pub fn aggregate(&mut self, name: &str, value: AggregateValue) -> PregelResult<()> {
        let def = self
            .definitions
            .get(name)
            .ok_or_else(|| PregelError::UnknownAggregator { name: name.to_string() })?;
        let folded = match self.values.get(name) {
            Some(current) => def.combine(current, &value),
            None => def.combine(def.initial(), &value),
        };
        self.values.insert(name.to_string(), folded);
        Ok(())
    }

    /// Fold another set of partials into this one
    pub fn merge(&mut self, other: AggregatorPartials) -> PregelResult<()> {
        for (name, value) in other.values {
            self.aggregate(&name, value)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> BTreeMap<String, AggregateValue> {
        self.values
    }
}

/// Master-side registry of definitions and current global values
#[derive(Debug, Clone, Default)]
pub struct AggregatorRegistry {
    definitions: AggregatorDefinitions,
    values: BTreeMap<String, AggregateValue>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from definitions and saved global values.
    ///
    /// Names without a saved value start at their initial value; saved
    /// values without a definition are dropped.
    pub fn from_parts(definitions: AggregatorDefinitions, values: &BTreeMap<String, AggregateValue>) -> Self {
        let mut registry = Self {
            definitions,
            values: BTreeMap::new(),
        };
        registry.restore(values);
        registry
    }

    /// Registered names and their kinds
    pub fn layout(&self) -> BTreeMap<String, AggregatorKind> {
        self.definitions
            .iter()
            .map(|(name, def)| (name.clone(), def.kind()))
            .collect()
    }

    /// Register an aggregator. Its global value starts at the initial value.
    pub fn register(&mut self, name: impl Into<String>, def: AggregatorDef) -> PregelResult<()> {
        let name = name.into();
        if self.definitions.contains_key(&name) {
            return Err(PregelError::DuplicateAggregator { name });
        }
        self.values.insert(name.clone(), def.initial().clone());
        self.definitions.insert(name, def);
        Ok(())
    }

    /// Remove an aggregator. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(name);
        self.definitions.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Shared copy of the definitions for workers
    pub fn definitions(&self) -> Arc<AggregatorDefinitions> {
        Arc::new(self.definitions.clone())
    }

    /// Current global value
    pub fn global_value(&self, name: &str) -> Option<&AggregateValue> {
        self.values.get(name)
    }

    /// Overwrite a global value (master compute only)
    pub fn set_value(&mut self, name: &str, value: AggregateValue) -> PregelResult<()> {
        if !self.definitions.contains_key(name) {
            return Err(PregelError::UnknownAggregator { name: name.to_string() });
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Immutable copy of the current global values
    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot::new(self.values.clone())
    }

    /// Fold one superstep's worker partials into new global values.
    ///
    /// Partials are folded in iteration order; callers pass them sorted by
    /// worker id so the result does not depend on arrival order.
    pub fn merge_partials<'a>(
        &mut self,
        partials: impl IntoIterator<Item = &'a BTreeMap<String, AggregateValue>>,
    ) -> PregelResult<()> {
        let mut next: BTreeMap<String, AggregateValue> = self
            .definitions
            .iter()
            .map(|(name, def)| {
                let start = match def.kind() {
                    AggregatorKind::Regular => def.initial().clone(),
                    AggregatorKind::Persistent => self
                        .values
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| def.initial().clone()),
                };
                (name.clone(), start)
            })
            .collect();

        for worker_partials in partials {
            for (name, value) in worker_partials {
                let def = self
                    .definitions
                    .get(name)
                    .ok_or_else(|| PregelError::UnknownAggregator { name: name.clone() })?;
                if let Some(current) = next.get_mut(name) {
                    *current = def.combine(current, value);
                }
            }
        }

        self.values = next;
        Ok(())
    }

    fn restore(&mut self, values: &BTreeMap<String, AggregateValue>) {
        for (name, def) in &self.definitions {
            let value = values.get(name).cloned().unwrap_or_else(|| def.initial().clone());
            self.values.insert(name.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AggregatorRegistry {
        let mut registry = AggregatorRegistry::new();
        registry.register("sum", AggregatorDef::long_sum()).unwrap();
        registry.register("min", AggregatorDef::double_min().persistent()).unwrap();
        registry.register("any", AggregatorDef::bool_or()).unwrap();
        registry
    }

    #[test]
    fn test_partials_fold_and_reject_unknown() {
        let registry = registry();
        let mut partials = AggregatorPartials::new(registry.definitions());
        partials.aggregate("sum", 2i64.into()).unwrap();
        partials.aggregate("sum", 3i64.into()).unwrap();
        partials.aggregate("min", 4.5.into()).unwrap();
        partials.aggregate("min", 1.5.into()).unwrap();

        let err = partials.aggregate("missing", 1i64.into()).unwrap_err();
        assert!(matches!(err, PregelError::UnknownAggregator { .. }));
        assert!(err.is_fatal());

        let values = partials.into_values();
        assert_eq!(values["sum"], AggregateValue::Long(5));
        assert_eq!(values["min"], AggregateValue::Double(1.5));
        assert!(!values.contains_key("any"));
    }

    #[test]
    fn test_regular_resets_persistent_accumulates() {
        let mut registry = registry();

        let worker_a: BTreeMap<_, _> = [
            ("sum".to_string(), AggregateValue::Long(3)),
            ("min".to_string(), AggregateValue::Double(2.0)),
        ]
        .into_iter()
        .collect();
        let worker_b: BTreeMap<_, _> = [("sum".to_string(), AggregateValue::Long(4))].into_iter().collect();

        registry.merge_partials([&worker_a, &worker_b]).unwrap();
        assert_eq!(registry.global_value("sum"), Some(&AggregateValue::Long(7)));
        assert_eq!(registry.global_value("min"), Some(&AggregateValue::Double(2.0)));
        assert_eq!(registry.global_value("any"), Some(&AggregateValue::Bool(false)));

        let later: BTreeMap<_, _> = [("min".to_string(), AggregateValue::Double(9.0))].into_iter().collect();
        registry.merge_partials([&later]).unwrap();
        assert_eq!(registry.global_value("sum"), Some(&AggregateValue::Long(0)));
        assert_eq!(registry.global_value("min"), Some(&AggregateValue::Double(2.0)));
    }

    #[test]
    fn test_merge_order_does_not_change_result() {
        let mut forward = registry();
        let mut backward = registry();
        let parts: Vec<BTreeMap<String, AggregateValue>> = (1..=5)
            .map(|i| [("sum".to_string(), AggregateValue::Long(i))].into_iter().collect())
            .collect();

        forward.merge_partials(parts.iter()).unwrap();
        backward.merge_partials(parts.iter().rev()).unwrap();
        assert_eq!(forward.snapshot(), backward.snapshot());
        assert_eq!(forward.global_value("sum"), Some(&AggregateValue::Long(15)));
    }

    #[test]
    fn test_duplicate_and_remove() {
        let mut registry = registry();
        assert!(matches!(
            registry.register("sum", AggregatorDef::long_sum()),
            Err(PregelError::DuplicateAggregator { .. })
        ));
        assert!(registry.remove("sum"));
        assert!(!registry.remove("sum"));
        assert!(registry.global_value("sum").is_none());
        assert!(registry.set_value("sum", 1i64.into()).is_err());
    }

    #[test]
    fn test_from_parts_restores_saved_values() {
        let saved: BTreeMap<_, _> = [
            ("min".to_string(), AggregateValue::Double(0.25)),
            ("gone".to_string(), AggregateValue::Long(1)),
        ]
        .into_iter()
        .collect();
        let definitions = (*registry().definitions()).clone();
        let restored = AggregatorRegistry::from_parts(definitions, &saved);
        assert_eq!(restored.global_value("min"), Some(&AggregateValue::Double(0.25)));
        assert_eq!(restored.global_value("sum"), Some(&AggregateValue::Long(0)));
        assert!(restored.global_value("gone").is_none());
        assert!(!restored.contains("gone"));
    }

    #[test]
    fn test_layout_tracks_registrations() {
        let mut registry = registry();
        assert_eq!(
            registry.layout(),
            BTreeMap::from([
                ("any".to_string(), AggregatorKind::Regular),
                ("min".to_string(), AggregatorKind::Persistent),
                ("sum".to_string(), AggregatorKind::Regular),
            ])
        );
        registry.remove("min");
        registry.register("max", AggregatorDef::double_max().persistent()).unwrap();
        assert_eq!(registry.layout().keys().collect::<Vec<_>>(), vec!["any", "max", "sum"]);
    }

    #[test]
    fn test_value_serde_shape() {
        let json = serde_json::to_string(&AggregateValue::Double(1.5)).unwrap();
        assert_eq!(json, r#"{"type":"double","value":1.5}"#);
        let back: AggregateValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AggregateValue::Double(1.5));
    }
}
