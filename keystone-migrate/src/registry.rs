//! Per-module migration registration.
//!
//! Modules contribute ordered unit lists through an explicit registration
//! API; the final plan is resolved once, deterministically, before
//! orchestration begins. Nothing here depends on load-order side effects:
//! module order is exactly registration order, which the embedding process
//! controls.

use crate::unit::MigrationUnit;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// One unit in the resolved plan, tagged with its contributing module.
#[derive(Clone)]
pub struct PlannedUnit {
    pub module: String,
    pub unit: Arc<dyn MigrationUnit>,
}

impl PlannedUnit {
    pub fn name(&self) -> &str {
        self.unit.name()
    }
}

impl std::fmt::Debug for PlannedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedUnit")
            .field("module", &self.module)
            .field("name", &self.unit.name())
            .finish()
    }
}

/// Collects migration units from independently-deployed feature modules.
#[derive(Default)]
pub struct MigrationRegistry {
    modules: Vec<(String, Vec<Arc<dyn MigrationUnit>>)>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module's ordered unit list. Module order is registration
    /// order; intra-module order is the order of `units`.
    pub fn register_module(
        &mut self,
        module: impl Into<String>,
        units: Vec<Arc<dyn MigrationUnit>>,
    ) -> &mut Self {
        self.modules.push((module.into(), units));
        self
    }

    /// Builder-style variant of [`register_module`](Self::register_module).
    pub fn with_module(
        mut self,
        module: impl Into<String>,
        units: Vec<Arc<dyn MigrationUnit>>,
    ) -> Self {
        self.register_module(module, units);
        self
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Resolve the final ordered plan: modules concatenated in registration
    /// order, intra-module order preserved, duplicate names dropped keeping
    /// the first occurrence.
    pub fn resolve(&self) -> Vec<PlannedUnit> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut plan = Vec::new();
        for (module, units) in &self.modules {
            for unit in units {
                if !seen.insert(unit.name().to_string()) {
                    warn!(
                        unit = unit.name(),
                        module = module.as_str(),
                        "duplicate migration name dropped, first registration wins"
                    );
                    continue;
                }
                plan.push(PlannedUnit {
                    module: module.clone(),
                    unit: Arc::clone(unit),
                });
            }
        }
        plan
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modules: Vec<(&str, usize)> = self
            .modules
            .iter()
            .map(|(m, units)| (m.as_str(), units.len()))
            .collect();
        f.debug_struct("MigrationRegistry")
            .field("modules", &modules)
            .finish()
    }
}
