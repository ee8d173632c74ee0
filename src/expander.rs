//! Scenario expansion: definitions into units of work.

use std::sync::Arc;

use crate::catalog::QueryCatalog;
use crate::model::{ExecutionScenario, QueryDefinition};

/// The full unit-of-work list for one run.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub scenarios: Vec<Arc<ExecutionScenario>>,
}

impl Expansion {
    /// Expand definitions in order.
    ///
    /// A definition with K parameter sets yields K scenarios; one with none
    /// yields a single scenario with an empty tuple. Labels are 1-based per
    /// query (`scenario_1`, `scenario_2`, ...).
    pub fn from_definitions<'a>(
        definitions: impl IntoIterator<Item = &'a Arc<QueryDefinition>>,
    ) -> Self {
        let mut scenarios = Vec::new();
        for def in definitions {
            if def.parameter_sets.is_empty() {
                scenarios.push(Arc::new(ExecutionScenario {
                    index: scenarios.len(),
                    query: Arc::clone(def),
                    parameter_set: Vec::new(),
                    scenario_label: "scenario_1".to_string(),
                    repeat_count: def.repeat_count,
                }));
                continue;
            }
            for (ordinal, set) in def.parameter_sets.iter().enumerate() {
                scenarios.push(Arc::new(ExecutionScenario {
                    index: scenarios.len(),
                    query: Arc::clone(def),
                    parameter_set: set.clone(),
                    scenario_label: format!("scenario_{}", ordinal + 1),
                    repeat_count: def.repeat_count,
                }));
            }
        }
        Self { scenarios }
    }

    pub fn from_catalog(catalog: &QueryCatalog) -> Self {
        Self::from_definitions(catalog.queries())
    }

    /// Σ over scenarios of `repeat_count`.
    pub fn total_executions(&self) -> u64 {
        self.scenarios.iter().map(|s| s.repeat_count as u64).sum()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
