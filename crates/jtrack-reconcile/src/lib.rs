//! Relational integrity reconciliation for the job-tracker datastore.
//!
//! A pass scans the smallest snapshot a category needs, classifies it with the pure
//! functions in [`classify`], applies the configured [`RepairPolicy`] and records every
//! decision in an [`AuditSummary`].

pub mod audit;
pub mod category;
pub mod classify;
pub mod config;
pub mod error;
pub mod reconciler;

pub use audit::{write_reports, AuditReporter, AuditSummary, PassOutcome, PassState, UnitAudit};
pub use category::{
    BackfillTimestamp, Category, CategoryAlias, CategoryRegistry, CounterpartRepair,
    ReconcileRequest, RepairPolicy, ScopeFilter,
};
pub use config::ReconcileConfig;
pub use error::{ConfigError, ReconcileError};
pub use reconciler::{Clock, PassResult, Reconciler, RepairAction, RepairUnit};

pub const CRATE_NAME: &str = "jtrack-reconcile";
