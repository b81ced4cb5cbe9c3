//! KEYSTONE Migrate - Startup Migration Orchestrator
//!
//! Brings the persisted schema up to date exactly once at process startup.
//! Feature modules contribute ordered lists of named, reversible migration
//! units through [`MigrationRegistry`]; [`MigrationRunner`] applies the ones
//! the ledger has not recorded yet, in a deterministic order, recording each
//! success durably before attempting the next.
//!
//! Two layers of protection keep this exactly-once:
//!
//! - an in-process single-flight guard stops a second bootstrap pass from
//!   starting while one is in flight;
//! - the ledger's unique-name constraint (see
//!   [`keystone_storage::MigrationLedger`]) arbitrates between separate
//!   processes racing at startup.

pub mod registry;
pub mod runner;
pub mod unit;

pub use registry::{MigrationRegistry, PlannedUnit};
pub use runner::{MigrationRunner, RunOutcome};
pub use unit::{FnMigration, MigrationUnit};
