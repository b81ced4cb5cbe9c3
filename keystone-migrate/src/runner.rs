//! The migration runner.
//!
//! Applies the resolved plan's pending units in order inside a guarded
//! execution window, recording each success durably before the next unit
//! starts. Any `up()` failure halts the run immediately; earlier successes
//! stay recorded and are never rolled back by the runner.

use crate::registry::PlannedUnit;
use keystone_core::{KeystoneResult, MigrationError};
use keystone_storage::StorageBackend;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// What a runner invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Number of units applied (zero when the ledger already covered the
    /// whole plan).
    Applied(usize),
    /// The backend is non-durable; schema sync was skipped entirely.
    /// Schema for that mode is derived from the declared entity shapes by
    /// the embedding process, not by migrations.
    SkippedEphemeral,
}

/// Single-flight release on every exit path, including panics and `?`.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One-shot startup orchestrator.
///
/// A process owns exactly one runner and passes it wherever bootstrap code
/// needs it; the `running` flag serializes bootstrap passes within the
/// process. Two separate processes racing at startup are arbitrated by the
/// ledger's unique-name constraint instead.
#[derive(Debug, Default)]
pub struct MigrationRunner {
    running: AtomicBool,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> KeystoneResult<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MigrationError::AlreadyRunning.into());
        }
        Ok(RunGuard(&self.running))
    }

    /// Apply every unit in `plan` that the ledger has not recorded yet.
    ///
    /// Units run in plan order. Each success is recorded durably before the
    /// next unit is attempted. The first failure halts the run and surfaces
    /// as [`MigrationError::UnitFailed`], carrying the failing unit's name
    /// and module; the process must not begin serving on that error.
    pub async fn run(
        &self,
        plan: &[PlannedUnit],
        backend: &dyn StorageBackend,
    ) -> KeystoneResult<RunOutcome> {
        if !backend.is_durable() {
            info!("non-durable backend, skipping schema sync");
            return Ok(RunOutcome::SkippedEphemeral);
        }

        let _guard = self.acquire()?;

        let applied: HashSet<String> = backend.applied_names().await?.into_iter().collect();
        let pending: Vec<&PlannedUnit> = plan
            .iter()
            .filter(|planned| !applied.contains(planned.name()))
            .collect();

        if pending.is_empty() {
            debug!(total = plan.len(), "schema already up to date");
            return Ok(RunOutcome::Applied(0));
        }

        let mut count = 0usize;
        for planned in pending {
            info!(
                unit = planned.name(),
                module = planned.module.as_str(),
                "applying migration"
            );
            if let Err(source) = planned.unit.up(backend).await {
                error!(
                    unit = planned.name(),
                    module = planned.module.as_str(),
                    error = %source,
                    "migration failed, halting bootstrap"
                );
                return Err(MigrationError::UnitFailed {
                    unit: planned.name().to_string(),
                    module: planned.module.clone(),
                    source: Box::new(source),
                }
                .into());
            }
            backend.record_applied(planned.name()).await?;
            count += 1;
        }

        info!(applied = count, "schema sync complete");
        Ok(RunOutcome::Applied(count))
    }

    /// Revert the most recently recorded unit. Explicit tooling only; never
    /// part of startup.
    pub async fn rollback_last(
        &self,
        plan: &[PlannedUnit],
        backend: &dyn StorageBackend,
    ) -> KeystoneResult<Option<String>> {
        let _guard = self.acquire()?;

        let names = backend.applied_names().await?;
        let Some(last) = names.last().cloned() else {
            return Ok(None);
        };

        let planned = plan
            .iter()
            .find(|p| p.name() == last)
            .ok_or_else(|| MigrationError::UnknownUnit { name: last.clone() })?;

        info!(
            unit = planned.name(),
            module = planned.module.as_str(),
            "rolling back migration"
        );
        planned.unit.down(backend).await?;
        backend.remove_applied(&last).await?;
        Ok(Some(last))
    }
}
