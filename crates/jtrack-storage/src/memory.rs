//! In-memory gateway that simulates cascade and uniqueness enforcement explicitly.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use jtrack_core::{
    CascadePolicy, EntityType, FieldMap, Record, RecordId, ScanQuery, Schema, SchemaError,
};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::{group_key, CascadePlan, DeleteReport, Operation, StorageCause, StorageError, StorageGateway};

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<EntityType, BTreeMap<RecordId, Record>>,
}

impl Tables {
    fn table(&self, entity: EntityType) -> impl Iterator<Item = &Record> {
        self.rows.get(&entity).into_iter().flat_map(|t| t.values())
    }

    fn next_id(&self, entity: EntityType) -> RecordId {
        self.rows
            .get(&entity)
            .and_then(|t| t.keys().next_back().copied())
            .unwrap_or(0)
            + 1
    }
}

/// Gateway over process memory. Writes under one lock, so every call is atomic.
#[derive(Debug)]
pub struct InMemoryGateway {
    schema: Schema,
    tables: RwLock<Tables>,
    failures: Mutex<HashSet<(Operation, EntityType)>>,
    mutations: AtomicU64,
}

impl InMemoryGateway {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            tables: RwLock::new(Tables::default()),
            failures: Mutex::new(HashSet::new()),
            mutations: AtomicU64::new(0),
        }
    }

    pub fn job_tracker() -> Self {
        Self::new(Schema::job_tracker())
    }

    /// Loads a pre-existing row as-is, bypassing constraint checks.
    pub async fn seed(&self, entity: EntityType, record: Record) {
        self.tables
            .write()
            .await
            .rows
            .entry(entity)
            .or_default()
            .insert(record.id, record);
    }

    pub async fn seed_all(&self, entity: EntityType, records: impl IntoIterator<Item = Record>) {
        let mut tables = self.tables.write().await;
        let table = tables.rows.entry(entity).or_default();
        for record in records {
            table.insert(record.id, record);
        }
    }

    /// Makes every later `operation` on `entity` fail until cleared.
    pub async fn fail_on(&self, operation: Operation, entity: EntityType) {
        self.failures.lock().await.insert((operation, entity));
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    /// Number of mutating calls issued so far (delete, insert, update).
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub async fn ids(&self, entity: EntityType) -> BTreeSet<RecordId> {
        self.tables
            .read()
            .await
            .table(entity)
            .map(|r| r.id)
            .collect()
    }

    pub async fn get(&self, entity: EntityType, id: RecordId) -> Option<Record> {
        self.tables
            .read()
            .await
            .rows
            .get(&entity)
            .and_then(|t| t.get(&id))
            .cloned()
    }

    async fn check_failure(&self, operation: Operation, entity: EntityType) -> Result<(), StorageError> {
        if self.failures.lock().await.contains(&(operation, entity)) {
            return Err(StorageError::new(entity, operation, StorageCause::Injected));
        }
        Ok(())
    }

    fn check_fields<'a>(
        &self,
        entity: EntityType,
        operation: Operation,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), StorageError> {
        for field in fields {
            self.schema
                .require_field(entity, field)
                .map_err(|err| StorageError::new(entity, operation, err))?;
        }
        Ok(())
    }

    fn check_unique(
        &self,
        tables: &Tables,
        entity: EntityType,
        operation: Operation,
        candidate: &Record,
    ) -> Result<(), StorageError> {
        for constraint in self.schema.unique_constraints_of(entity) {
            let key = constraint
                .fields
                .iter()
                .map(|f| candidate.value(f))
                .collect::<Vec<_>>();
            if key.iter().any(Value::is_null) {
                continue;
            }
            let clash = tables.table(entity).any(|existing| {
                existing.id != candidate.id
                    && constraint
                        .fields
                        .iter()
                        .zip(&key)
                        .all(|(f, v)| group_key(&existing.value(f)) == group_key(v))
            });
            if clash {
                return Err(StorageError::new(
                    entity,
                    operation,
                    StorageCause::UniqueViolation {
                        fields: constraint.fields.clone(),
                    },
                ));
            }
        }
        Ok(())
    }

    /// Rows reachable from `ids` through cascading foreign keys, keyed by entity.
    fn cascade_closure(
        &self,
        tables: &Tables,
        plan: &CascadePlan,
        ids: BTreeSet<RecordId>,
    ) -> Result<BTreeMap<EntityType, BTreeSet<RecordId>>, StorageError> {
        let mut doomed: BTreeMap<EntityType, BTreeSet<RecordId>> = BTreeMap::new();
        doomed.insert(plan.root, ids.clone());
        let mut frontier = vec![(plan.root, ids)];

        while let Some((parent, parent_ids)) = frontier.pop() {
            for rel in plan.relationships_from(parent) {
                if rel.on_delete != CascadePolicy::Cascade {
                    continue;
                }
                let already = doomed.entry(rel.child).or_default();
                let children = tables
                    .table(rel.child)
                    .filter(|row| {
                        row.reference(&rel.foreign_key)
                            .is_some_and(|fk| parent_ids.contains(&fk))
                    })
                    .map(|row| row.id)
                    .filter(|id| !already.contains(id))
                    .collect::<BTreeSet<_>>();
                if !children.is_empty() {
                    already.extend(children.iter().copied());
                    frontier.push((rel.child, children));
                }
            }
        }

        for rel in &plan.relationships {
            if rel.on_delete != CascadePolicy::Restrict {
                continue;
            }
            let Some(parent_ids) = doomed.get(&rel.parent) else {
                continue;
            };
            let spared = doomed.get(&rel.child);
            let blocking = tables
                .table(rel.child)
                .filter(|row| {
                    row.reference(&rel.foreign_key)
                        .is_some_and(|fk| parent_ids.contains(&fk))
                        && !spared.is_some_and(|s| s.contains(&row.id))
                })
                .count();
            if blocking > 0 {
                return Err(StorageError::new(
                    plan.root,
                    Operation::BulkDelete,
                    StorageCause::Restricted {
                        relationship: rel.label(),
                        dependents: blocking,
                    },
                ));
            }
        }

        Ok(doomed)
    }
}

#[async_trait]
impl StorageGateway for InMemoryGateway {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn scan(&self, entity: EntityType, query: &ScanQuery) -> Result<Vec<Record>, StorageError> {
        self.check_failure(Operation::Scan, entity).await?;
        self.check_fields(entity, Operation::Scan, query.fields())?;

        let tables = self.tables.read().await;
        let mut rows = tables
            .table(entity)
            .filter(|row| query.predicate.as_ref().map_or(true, |p| p.matches(row)))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| query.compare(a, b).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        debug!(entity = %entity, rows = rows.len(), "scan");
        Ok(rows)
    }

    async fn count_grouped_by(
        &self,
        entity: EntityType,
        field: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError> {
        self.check_failure(Operation::CountGroupedBy, entity).await?;
        self.check_fields(entity, Operation::CountGroupedBy, [field])?;

        let tables = self.tables.read().await;
        let mut counts = BTreeMap::new();
        for row in tables.table(entity) {
            *counts.entry(group_key(&row.value(field))).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn bulk_delete(
        &self,
        entity: EntityType,
        ids: &BTreeSet<RecordId>,
    ) -> Result<DeleteReport, StorageError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_failure(Operation::BulkDelete, entity).await?;
        if ids.is_empty() {
            return Ok(DeleteReport::default());
        }

        let plan = CascadePlan::for_delete(&self.schema, entity);
        let mut tables = self.tables.write().await;
        let present = ids
            .iter()
            .copied()
            .filter(|id| tables.rows.get(&entity).is_some_and(|t| t.contains_key(id)))
            .collect::<BTreeSet<_>>();
        let doomed = self.cascade_closure(&tables, &plan, present)?;

        let mut report = DeleteReport::default();
        for target in &plan.order {
            let Some(target_ids) = doomed.get(target) else {
                continue;
            };
            let Some(table) = tables.rows.get_mut(target) else {
                continue;
            };
            let removed = target_ids
                .iter()
                .filter(|id| table.remove(id).is_some())
                .count() as u64;
            if *target == entity {
                report.deleted = removed;
            } else if removed > 0 {
                report.cascaded.insert(*target, removed);
            }
        }
        debug!(entity = %entity, deleted = report.deleted, cascaded = report.total() - report.deleted, "bulk delete");
        Ok(report)
    }

    async fn insert(&self, entity: EntityType, fields: FieldMap) -> Result<RecordId, StorageError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_failure(Operation::Insert, entity).await?;
        if self.schema.entity(entity).is_none() {
            return Err(StorageError::new(
                entity,
                Operation::Insert,
                SchemaError::MissingTable(entity),
            ));
        }
        self.check_fields(entity, Operation::Insert, fields.keys().map(String::as_str))?;

        let mut tables = self.tables.write().await;
        let id = tables.next_id(entity);
        let mut record = Record::new(id);
        record.fields = fields;
        record.fields.remove("id");
        self.check_unique(&tables, entity, Operation::Insert, &record)?;
        tables.rows.entry(entity).or_default().insert(id, record);
        debug!(entity = %entity, id, "insert");
        Ok(id)
    }

    async fn bulk_insert(
        &self,
        entity: EntityType,
        rows: Vec<FieldMap>,
    ) -> Result<Vec<RecordId>, StorageError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_failure(Operation::BulkInsert, entity).await?;
        if self.schema.entity(entity).is_none() {
            return Err(StorageError::new(
                entity,
                Operation::BulkInsert,
                SchemaError::MissingTable(entity),
            ));
        }
        for fields in &rows {
            self.check_fields(entity, Operation::BulkInsert, fields.keys().map(String::as_str))?;
        }

        let mut tables = self.tables.write().await;
        let mut created = Vec::with_capacity(rows.len());
        for fields in rows {
            let id = tables.next_id(entity);
            let mut record = Record::new(id);
            record.fields = fields;
            record.fields.remove("id");
            if let Err(err) = self.check_unique(&tables, entity, Operation::BulkInsert, &record) {
                if let Some(table) = tables.rows.get_mut(&entity) {
                    for id in &created {
                        table.remove(id);
                    }
                }
                return Err(err);
            }
            tables.rows.entry(entity).or_default().insert(id, record);
            created.push(id);
        }
        debug!(entity = %entity, rows = created.len(), "bulk insert");
        Ok(created)
    }

    async fn update(
        &self,
        entity: EntityType,
        id: RecordId,
        patch: FieldMap,
    ) -> Result<bool, StorageError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_failure(Operation::Update, entity).await?;
        self.check_fields(entity, Operation::Update, patch.keys().map(String::as_str))?;

        let mut tables = self.tables.write().await;
        let Some(current) = tables.rows.get(&entity).and_then(|t| t.get(&id)) else {
            return Ok(false);
        };
        let mut updated = current.clone();
        for (field, value) in patch {
            if field != "id" {
                updated.fields.insert(field, value);
            }
        }
        self.check_unique(&tables, entity, Operation::Update, &updated)?;
        tables.rows.entry(entity).or_default().insert(id, updated);
        Ok(true)
    }
}
