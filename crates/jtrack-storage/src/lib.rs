//! Storage gateway contract plus in-memory and PostgreSQL implementations.
//!
//! Gateways never retry; a failed call surfaces a [`StorageError`] and the caller decides.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use jtrack_core::{
    as_record_id, CascadePolicy, EntityType, FieldMap, Record, RecordId, Relationship, ScanQuery,
    Schema, SchemaError,
};
use serde_json::Value;
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::InMemoryGateway;
pub use postgres::PgGateway;

pub const CRATE_NAME: &str = "jtrack-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Scan,
    CountGroupedBy,
    BulkDelete,
    Insert,
    BulkInsert,
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Scan => "scan",
            Operation::CountGroupedBy => "count_grouped_by",
            Operation::BulkDelete => "bulk_delete",
            Operation::Insert => "insert",
            Operation::BulkInsert => "bulk_insert",
            Operation::Update => "update",
        })
    }
}

#[derive(Debug, Error)]
pub enum StorageCause {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("unique constraint on ({}) violated", .fields.join(", "))]
    UniqueViolation { fields: Vec<String> },
    #[error("delete restricted by {relationship}: {dependents} dependent row(s)")]
    Restricted { relationship: String, dependents: usize },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("row {id} is malformed: {message}")]
    Malformed { id: RecordId, message: String },
    #[error("injected failure")]
    Injected,
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
#[error("{operation} on {entity} failed: {cause}")]
pub struct StorageError {
    pub entity: EntityType,
    pub operation: Operation,
    #[source]
    pub cause: StorageCause,
}

impl StorageError {
    pub fn new(entity: EntityType, operation: Operation, cause: impl Into<StorageCause>) -> Self {
        Self {
            entity,
            operation,
            cause: cause.into(),
        }
    }
}

/// Outcome of one atomic bulk delete, including rows removed by cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: u64,
    pub cascaded: BTreeMap<EntityType, u64>,
}

impl DeleteReport {
    pub fn total(&self) -> u64 {
        self.deleted + self.cascaded.values().sum::<u64>()
    }
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    fn schema(&self) -> &Schema;

    async fn scan(&self, entity: EntityType, query: &ScanQuery) -> Result<Vec<Record>, StorageError>;

    /// Row counts keyed by [`group_key`] of `field`.
    async fn count_grouped_by(
        &self,
        entity: EntityType,
        field: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError>;

    /// Deletes `ids` and everything that cascades from them, all or nothing.
    async fn bulk_delete(
        &self,
        entity: EntityType,
        ids: &BTreeSet<RecordId>,
    ) -> Result<DeleteReport, StorageError>;

    async fn insert(&self, entity: EntityType, fields: FieldMap) -> Result<RecordId, StorageError>;

    /// Inserts every row or none of them. Returns the new ids in row order.
    async fn bulk_insert(
        &self,
        entity: EntityType,
        rows: Vec<FieldMap>,
    ) -> Result<Vec<RecordId>, StorageError>;

    async fn update(
        &self,
        entity: EntityType,
        id: RecordId,
        patch: FieldMap,
    ) -> Result<bool, StorageError>;

    /// Releases backing resources. Called once the caller is done with the gateway.
    async fn close(&self) {}
}

/// Canonical grouping key. Anything [`as_record_id`] reads as an id, including the numeric
/// strings of legacy rows, prints as that integer; everything else as JSON text.
pub fn group_key(value: &Value) -> String {
    match value {
        Value::Number(_) | Value::String(_) => as_record_id(value)
            .map(|id| id.to_string())
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Inverse of [`group_key`].
pub fn parse_group_key(key: &str) -> Value {
    serde_json::from_str(key).unwrap_or_else(|_| Value::String(key.to_string()))
}

/// Dependency-ordered closure of the foreign keys a delete of `root` can reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePlan {
    pub root: EntityType,
    /// Entities in deletion order: every child precedes its parent, `root` is last.
    pub order: Vec<EntityType>,
    pub relationships: Vec<Relationship>,
}

impl CascadePlan {
    pub fn for_delete(schema: &Schema, root: EntityType) -> Self {
        fn visit(
            schema: &Schema,
            entity: EntityType,
            seen: &mut BTreeSet<EntityType>,
            order: &mut Vec<EntityType>,
            relationships: &mut Vec<Relationship>,
        ) {
            if !seen.insert(entity) {
                return;
            }
            for rel in schema.dependents_of(entity) {
                relationships.push(rel.clone());
                if rel.on_delete == CascadePolicy::Cascade {
                    visit(schema, rel.child, seen, order, relationships);
                }
            }
            order.push(entity);
        }

        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut relationships = Vec::new();
        visit(schema, root, &mut seen, &mut order, &mut relationships);
        Self {
            root,
            order,
            relationships,
        }
    }

    /// Every entity a delete of the root may touch.
    pub fn entities(&self) -> BTreeSet<EntityType> {
        self.order.iter().copied().collect()
    }

    pub fn relationships_from(&self, parent: EntityType) -> impl Iterator<Item = &Relationship> {
        self.relationships.iter().filter(move |r| r.parent == parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jtrack_core::SchemaChange;
    use serde_json::json;

    #[test]
    fn job_cascade_orders_children_first() {
        let plan = CascadePlan::for_delete(&Schema::job_tracker(), EntityType::Job);
        let position = |e: EntityType| plan.order.iter().position(|x| *x == e).unwrap();

        assert_eq!(*plan.order.last().unwrap(), EntityType::Job);
        assert!(position(EntityType::ApplicationNote) < position(EntityType::Application));
        assert!(position(EntityType::Match) < position(EntityType::Job));
        assert!(!plan.entities().contains(&EntityType::TestResult));
    }

    #[test]
    fn restrict_dependents_are_recorded_but_not_traversed() {
        let mut schema = Schema::job_tracker();
        SchemaChange::DropForeignKey(Relationship::new(
            EntityType::Application,
            EntityType::ApplicationNote,
            "application_id",
            CascadePolicy::Cascade,
        ))
        .apply(&mut schema)
        .unwrap();
        SchemaChange::AddForeignKey(Relationship::new(
            EntityType::Application,
            EntityType::ApplicationNote,
            "application_id",
            CascadePolicy::Restrict,
        ))
        .apply(&mut schema)
        .unwrap();

        let plan = CascadePlan::for_delete(&schema, EntityType::Application);
        assert_eq!(plan.order, vec![EntityType::Application]);
        assert_eq!(plan.relationships.len(), 1);
        assert_eq!(plan.relationships[0].on_delete, CascadePolicy::Restrict);
    }

    #[test]
    fn group_keys_normalize_numbers() {
        assert_eq!(group_key(&json!(5)), "5");
        assert_eq!(group_key(&json!(5.0)), "5");
        assert_eq!(group_key(&json!("manual-bulk")), "\"manual-bulk\"");
        assert_eq!(group_key(&json!(" 7")), group_key(&json!(7)));
        assert_eq!(group_key(&Value::Null), "null");
        assert_eq!(parse_group_key("5"), json!(5));
        assert_eq!(parse_group_key("\"a\""), json!("a"));
    }
}
