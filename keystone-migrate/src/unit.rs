//! The migration unit contract.

use async_trait::async_trait;
use keystone_core::KeystoneResult;
use keystone_storage::SchemaExecutor;
use std::future::Future;
use std::pin::Pin;

/// A named, reversible schema change.
///
/// Units are contributed by feature modules and applied by the runner in a
/// fixed order. `down` exists for explicit rollback tooling; the runner
/// never calls it during normal startup.
#[async_trait]
pub trait MigrationUnit: Send + Sync {
    /// Stable identity. Recorded in the ledger; a name is applied at most
    /// once per store, ever.
    fn name(&self) -> &str;

    /// Apply the schema change.
    async fn up(&self, executor: &dyn SchemaExecutor) -> KeystoneResult<()>;

    /// Revert the schema change.
    async fn down(&self, executor: &dyn SchemaExecutor) -> KeystoneResult<()>;
}

/// A boxed future returned by a closure-backed unit.
pub type UnitFuture<'a> = Pin<Box<dyn Future<Output = KeystoneResult<()>> + Send + 'a>>;

type UnitFn = Box<dyn for<'a> Fn(&'a dyn SchemaExecutor) -> UnitFuture<'a> + Send + Sync>;

/// Closure-backed migration unit for simple DDL pairs and tests.
pub struct FnMigration {
    name: String,
    up: UnitFn,
    down: UnitFn,
}

impl FnMigration {
    pub fn new<U, D>(name: impl Into<String>, up: U, down: D) -> Self
    where
        U: for<'a> Fn(&'a dyn SchemaExecutor) -> UnitFuture<'a> + Send + Sync + 'static,
        D: for<'a> Fn(&'a dyn SchemaExecutor) -> UnitFuture<'a> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            up: Box::new(up),
            down: Box::new(down),
        }
    }

    /// A unit that runs one statement up and one statement down.
    pub fn statements(
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        let up_sql = up_sql.into();
        let down_sql = down_sql.into();
        Self::new(
            name,
            move |executor: &dyn SchemaExecutor| -> UnitFuture<'_> {
                let sql = up_sql.clone();
                Box::pin(async move { executor.execute(&sql).await })
            },
            move |executor: &dyn SchemaExecutor| -> UnitFuture<'_> {
                let sql = down_sql.clone();
                Box::pin(async move { executor.execute(&sql).await })
            },
        )
    }
}

#[async_trait]
impl MigrationUnit for FnMigration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, executor: &dyn SchemaExecutor) -> KeystoneResult<()> {
        (self.up)(executor).await
    }

    async fn down(&self, executor: &dyn SchemaExecutor) -> KeystoneResult<()> {
        (self.down)(executor).await
    }
}

impl std::fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMigration").field("name", &self.name).finish()
    }
}
