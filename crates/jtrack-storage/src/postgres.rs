//! PostgreSQL gateway. Rows travel as JSON objects so one code path serves every entity.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use async_trait::async_trait;
use jtrack_core::{
    as_record_id, CascadePolicy, Direction, EntityType, FieldMap, Predicate, Record, RecordId,
    ScanQuery, Schema,
};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info_span, Instrument};

use crate::{group_key, parse_group_key, CascadePlan, DeleteReport, Operation, StorageCause, StorageError, StorageGateway};

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
    schema: Schema,
}

impl PgGateway {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to job-tracker database")?;
        Ok(Self::from_pool(pool, Schema::job_tracker()))
    }

    pub fn from_pool(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
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

    async fn ids_referencing(
        tx: &mut Transaction<'_, Postgres>,
        child: EntityType,
        foreign_key: &str,
        parents: &BTreeSet<RecordId>,
    ) -> Result<BTreeSet<RecordId>, sqlx::Error> {
        let sql = format!(
            "SELECT t.\"id\"::bigint AS id FROM {} t WHERE t.{}::bigint = ANY($1)",
            ident(child.table_name()),
            ident(foreign_key)
        );
        let rows = sqlx::query(&sql)
            .bind(parents.iter().copied().collect::<Vec<_>>())
            .fetch_all(&mut **tx)
            .await?;
        rows.iter().map(|row| row.try_get::<i64, _>("id")).collect()
    }

    async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan: &CascadePlan,
        ids: &BTreeSet<RecordId>,
    ) -> Result<DeleteReport, StorageError> {
        let root = plan.root;
        let fail = |err: sqlx::Error| classify(root, Operation::BulkDelete, err);

        let sql = format!(
            "SELECT t.\"id\"::bigint AS id FROM {} t WHERE t.\"id\" = ANY($1) FOR UPDATE",
            ident(root.table_name())
        );
        let present = sqlx::query(&sql)
            .bind(ids.iter().copied().collect::<Vec<_>>())
            .fetch_all(&mut **tx)
            .await
            .map_err(fail)?
            .iter()
            .map(|row| row.try_get::<i64, _>("id"))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(fail)?;

        let mut doomed: BTreeMap<EntityType, BTreeSet<RecordId>> = BTreeMap::new();
        doomed.insert(root, present.clone());
        let mut frontier = vec![(root, present)];
        while let Some((parent, parent_ids)) = frontier.pop() {
            for rel in plan.relationships_from(parent) {
                if rel.on_delete != CascadePolicy::Cascade || parent_ids.is_empty() {
                    continue;
                }
                let found = Self::ids_referencing(tx, rel.child, &rel.foreign_key, &parent_ids)
                    .await
                    .map_err(fail)?;
                let already = doomed.entry(rel.child).or_default();
                let fresh = found
                    .into_iter()
                    .filter(|id| already.insert(*id))
                    .collect::<BTreeSet<_>>();
                if !fresh.is_empty() {
                    frontier.push((rel.child, fresh));
                }
            }
        }

        for rel in &plan.relationships {
            if rel.on_delete != CascadePolicy::Restrict {
                continue;
            }
            let Some(parent_ids) = doomed.get(&rel.parent).filter(|ids| !ids.is_empty()) else {
                continue;
            };
            let spared = doomed.get(&rel.child).cloned().unwrap_or_default();
            let blocking = Self::ids_referencing(tx, rel.child, &rel.foreign_key, parent_ids)
                .await
                .map_err(fail)?
                .difference(&spared)
                .count();
            if blocking > 0 {
                return Err(StorageError::new(
                    root,
                    Operation::BulkDelete,
                    StorageCause::Restricted {
                        relationship: rel.label(),
                        dependents: blocking,
                    },
                ));
            }
        }

        let mut report = DeleteReport::default();
        for target in &plan.order {
            let Some(target_ids) = doomed.get(target).filter(|ids| !ids.is_empty()) else {
                continue;
            };
            let sql = format!(
                "DELETE FROM {} WHERE \"id\" = ANY($1)",
                ident(target.table_name())
            );
            let removed = sqlx::query(&sql)
                .bind(target_ids.iter().copied().collect::<Vec<_>>())
                .execute(&mut **tx)
                .await
                .map_err(|err| classify(*target, Operation::BulkDelete, err))?
                .rows_affected();
            if *target == root {
                report.deleted = removed;
            } else if removed > 0 {
                report.cascaded.insert(*target, removed);
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl StorageGateway for PgGateway {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn scan(&self, entity: EntityType, query: &ScanQuery) -> Result<Vec<Record>, StorageError> {
        self.check_fields(entity, Operation::Scan, query.fields())?;
        let (sql, binds) = render_scan(entity, query);
        debug!(entity = %entity, %sql, "scan");

        let mut statement = sqlx::query(&sql);
        for bind in binds {
            statement = match bind {
                Bind::Json(value) => statement.bind(Json(value)),
                Bind::Int(value) => statement.bind(value),
            };
        }
        let rows = statement
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify(entity, Operation::Scan, err))?;

        rows.iter()
            .map(|row| {
                let Json(value) = row
                    .try_get::<Json<Value>, _>("data")
                    .map_err(|err| classify(entity, Operation::Scan, err))?;
                record_from_json(value)
                    .map_err(|cause| StorageError::new(entity, Operation::Scan, cause))
            })
            .collect()
    }

    async fn count_grouped_by(
        &self,
        entity: EntityType,
        field: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError> {
        self.check_fields(entity, Operation::CountGroupedBy, [field])?;
        let sql = format!(
            "SELECT to_jsonb(t.{})::text AS key, COUNT(*)::bigint AS n FROM {} t GROUP BY 1",
            ident(field),
            ident(entity.table_name())
        );
        let fail = |err: sqlx::Error| classify(entity, Operation::CountGroupedBy, err);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(fail)?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let key = row.try_get::<Option<String>, _>("key").map_err(fail)?;
            let n = row.try_get::<i64, _>("n").map_err(fail)?;
            let key = key
                .map(|raw| group_key(&parse_group_key(&raw)))
                .unwrap_or_else(|| group_key(&Value::Null));
            *counts.entry(key).or_insert(0) += n.max(0) as u64;
        }
        Ok(counts)
    }

    async fn bulk_delete(
        &self,
        entity: EntityType,
        ids: &BTreeSet<RecordId>,
    ) -> Result<DeleteReport, StorageError> {
        if ids.is_empty() {
            return Ok(DeleteReport::default());
        }
        let plan = CascadePlan::for_delete(&self.schema, entity);
        let span = info_span!("bulk_delete", entity = %entity, requested = ids.len());
        async {
            let fail = |err: sqlx::Error| classify(entity, Operation::BulkDelete, err);
            let mut tx = self.pool.begin().await.map_err(fail)?;
            // Dropping the transaction on error rolls it back.
            let report = self.delete_in_tx(&mut tx, &plan, ids).await?;
            tx.commit().await.map_err(fail)?;
            debug!(deleted = report.deleted, total = report.total(), "committed");
            Ok::<_, StorageError>(report)
        }
        .instrument(span)
        .await
    }

    async fn insert(&self, entity: EntityType, mut fields: FieldMap) -> Result<RecordId, StorageError> {
        fields.remove("id");
        self.check_fields(entity, Operation::Insert, fields.keys().map(String::as_str))?;
        let table = ident(entity.table_name());
        let sql = if fields.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING \"id\"::bigint AS id")
        } else {
            let columns = fields.keys().map(|f| ident(f)).collect::<Vec<_>>().join(", ");
            format!(
                "INSERT INTO {table} ({columns}) SELECT {columns} \
                 FROM jsonb_populate_record(NULL::{table}, $1::jsonb) RETURNING \"id\"::bigint AS id"
            )
        };
        let payload = Value::Object(fields.into_iter().collect());
        let fail = |err: sqlx::Error| classify(entity, Operation::Insert, err);
        let row = sqlx::query(&sql)
            .bind(Json(payload))
            .fetch_one(&self.pool)
            .await
            .map_err(fail)?;
        row.try_get::<i64, _>("id").map_err(fail)
    }

    async fn bulk_insert(
        &self,
        entity: EntityType,
        rows: Vec<FieldMap>,
    ) -> Result<Vec<RecordId>, StorageError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let columns = rows
            .iter()
            .flat_map(|row| row.keys())
            .filter(|field| field.as_str() != "id")
            .map(String::as_str)
            .collect::<BTreeSet<_>>();
        self.check_fields(entity, Operation::BulkInsert, columns.iter().copied())?;
        let fail = |err: sqlx::Error| classify(entity, Operation::BulkInsert, err);

        if columns.is_empty() {
            let sql = format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING \"id\"::bigint AS id",
                ident(entity.table_name())
            );
            let mut tx = self.pool.begin().await.map_err(fail)?;
            let mut created = Vec::with_capacity(rows.len());
            for _ in &rows {
                let row = sqlx::query(&sql).fetch_one(&mut *tx).await.map_err(fail)?;
                created.push(row.try_get::<i64, _>("id").map_err(fail)?);
            }
            tx.commit().await.map_err(fail)?;
            return Ok(created);
        }

        let sql = render_bulk_insert(entity, &columns);
        let payload = Value::Array(
            rows.into_iter()
                .map(|mut row| {
                    row.remove("id");
                    Value::Object(row.into_iter().collect())
                })
                .collect(),
        );
        let created = sqlx::query(&sql)
            .bind(Json(payload))
            .fetch_all(&self.pool)
            .await
            .map_err(fail)?
            .iter()
            .map(|row| row.try_get::<i64, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(fail)?;
        debug!(entity = %entity, rows = created.len(), "bulk insert");
        Ok(created)
    }

    async fn update(
        &self,
        entity: EntityType,
        id: RecordId,
        mut patch: FieldMap,
    ) -> Result<bool, StorageError> {
        patch.remove("id");
        self.check_fields(entity, Operation::Update, patch.keys().map(String::as_str))?;
        let table = ident(entity.table_name());
        let fail = |err: sqlx::Error| classify(entity, Operation::Update, err);

        if patch.is_empty() {
            let sql = format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE \"id\" = $1) AS found");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(fail)?;
            return row.try_get::<bool, _>("found").map_err(fail);
        }

        let assignments = patch
            .keys()
            .map(|f| format!("{0} = r.{0}", ident(f)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {table} AS t SET {assignments} \
             FROM jsonb_populate_record(NULL::{table}, $1::jsonb) AS r WHERE t.\"id\" = $2"
        );
        let payload = Value::Object(patch.into_iter().collect());
        let result = sqlx::query(&sql)
            .bind(Json(payload))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(fail)?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Json(Value),
    Int(i64),
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_scan(entity: EntityType, query: &ScanQuery) -> (String, Vec<Bind>) {
    let mut binds = Vec::new();
    let mut sql = format!(
        "SELECT row_to_json(t)::jsonb AS data FROM {} t",
        ident(entity.table_name())
    );
    if let Some(predicate) = &query.predicate {
        sql.push_str(" WHERE ");
        sql.push_str(&render_predicate(predicate, &mut binds));
    }
    let mut order = query
        .order_by
        .iter()
        .map(|o| match o.direction {
            Direction::Asc => format!("t.{} ASC NULLS LAST", ident(&o.field)),
            Direction::Desc => format!("t.{} DESC NULLS FIRST", ident(&o.field)),
        })
        .collect::<Vec<_>>();
    order.push("t.\"id\" ASC".to_string());
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));
    if let Some(limit) = query.limit {
        binds.push(Bind::Int(limit as i64));
        sql.push_str(&format!(" LIMIT ${}", binds.len()));
    }
    (sql, binds)
}

/// One statement, so the rows land together or not at all.
fn render_bulk_insert(entity: EntityType, columns: &BTreeSet<&str>) -> String {
    let table = ident(entity.table_name());
    let columns = columns.iter().map(|f| ident(f)).collect::<Vec<_>>().join(", ");
    format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} \
         FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb) WITH ORDINALITY AS r \
         ORDER BY r.ordinality RETURNING \"id\"::bigint AS id"
    )
}

/// Renders with SQL NULL semantics matching [`Predicate::matches`]: a null column never
/// equals anything and negation of an unknown comparison is true.
fn render_predicate(predicate: &Predicate, binds: &mut Vec<Bind>) -> String {
    match predicate {
        Predicate::Eq(field, value) => {
            binds.push(Bind::Json(value.clone()));
            format!("to_jsonb(t.{}) = ${}::jsonb", ident(field), binds.len())
        }
        Predicate::In(field, values) => {
            binds.push(Bind::Json(Value::Array(values.clone())));
            format!(
                "to_jsonb(t.{}) IN (SELECT jsonb_array_elements(${}::jsonb))",
                ident(field),
                binds.len()
            )
        }
        Predicate::IsNull(field) => format!("t.{} IS NULL", ident(field)),
        Predicate::TrimmedIn(field, values) => {
            binds.push(Bind::Json(Value::from(values.clone())));
            format!(
                "btrim(t.{}::text) IN (SELECT jsonb_array_elements_text(${}::jsonb))",
                ident(field),
                binds.len()
            )
        }
        Predicate::Not(inner) => {
            format!("NOT COALESCE(({}), FALSE)", render_predicate(inner, binds))
        }
        Predicate::And(parts) if parts.is_empty() => "TRUE".to_string(),
        Predicate::Or(parts) if parts.is_empty() => "FALSE".to_string(),
        Predicate::And(parts) => join_predicates(parts, " AND ", binds),
        Predicate::Or(parts) => join_predicates(parts, " OR ", binds),
    }
}

fn join_predicates(parts: &[Predicate], separator: &str, binds: &mut Vec<Bind>) -> String {
    let rendered = parts
        .iter()
        .map(|p| format!("COALESCE(({}), FALSE)", render_predicate(p, binds)))
        .collect::<Vec<_>>();
    format!("({})", rendered.join(separator))
}

fn record_from_json(value: Value) -> Result<Record, StorageCause> {
    let Value::Object(mut object) = value else {
        return Err(StorageCause::Malformed {
            id: 0,
            message: "row is not an object".to_string(),
        });
    };
    let id = object
        .remove("id")
        .as_ref()
        .and_then(as_record_id)
        .ok_or_else(|| StorageCause::Malformed {
            id: 0,
            message: "row has no integer id".to_string(),
        })?;
    Ok(Record {
        id,
        fields: object.into_iter().collect(),
    })
}

fn classify(entity: EntityType, operation: Operation, err: sqlx::Error) -> StorageError {
    let cause = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageCause::Unreachable(err.to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StorageCause::UniqueViolation {
                fields: db.constraint().map(str::to_string).into_iter().collect(),
            }
        }
        _ => StorageCause::Backend(err),
    };
    StorageError::new(entity, operation, cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jtrack_core::OrderBy;
    use serde_json::json;

    #[test]
    fn scan_sql_binds_values_in_order() {
        let query = ScanQuery::filter(Predicate::And(vec![
            Predicate::eq("source", "manual-bulk"),
            Predicate::Not(Box::new(Predicate::is_null("title"))),
        ]))
        .order_by(OrderBy::desc("id"))
        .limit(3);
        let (sql, binds) = render_scan(EntityType::Job, &query);

        assert_eq!(
            sql,
            "SELECT row_to_json(t)::jsonb AS data FROM \"jobs\" t WHERE \
             (COALESCE((to_jsonb(t.\"source\") = $1::jsonb), FALSE) AND \
             COALESCE((NOT COALESCE((t.\"title\" IS NULL), FALSE)), FALSE)) \
             ORDER BY t.\"id\" DESC NULLS FIRST, t.\"id\" ASC LIMIT $2"
        );
        assert_eq!(binds, vec![Bind::Json(json!("manual-bulk")), Bind::Int(3)]);
    }

    #[test]
    fn empty_disjunction_matches_nothing() {
        let mut binds = Vec::new();
        assert_eq!(render_predicate(&Predicate::Or(vec![]), &mut binds), "FALSE");
        assert_eq!(render_predicate(&Predicate::And(vec![]), &mut binds), "TRUE");
        let rendered = render_predicate(&Predicate::ids([1, 2]), &mut binds);
        assert!(rendered.contains("jsonb_array_elements($1::jsonb)"));
        assert_eq!(binds, vec![Bind::Json(json!([1, 2]))]);
    }

    #[test]
    fn bulk_insert_is_a_single_statement() {
        let sql = render_bulk_insert(EntityType::Application, &BTreeSet::from(["status", "job_id"]));
        assert_eq!(
            sql,
            "INSERT INTO \"applications\" (\"job_id\", \"status\") SELECT \"job_id\", \"status\" \
             FROM jsonb_populate_recordset(NULL::\"applications\", $1::jsonb) WITH ORDINALITY AS r \
             ORDER BY r.ordinality RETURNING \"id\"::bigint AS id"
        );
    }

    #[test]
    fn trimmed_membership_renders_against_text() {
        let mut binds = Vec::new();
        let rendered = render_predicate(&Predicate::trimmed_in("title", ["", "Untitled Job"]), &mut binds);
        assert_eq!(
            rendered,
            "btrim(t.\"title\"::text) IN (SELECT jsonb_array_elements_text($1::jsonb))"
        );
        assert_eq!(binds, vec![Bind::Json(json!(["", "Untitled Job"]))]);
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(ident("match"), "\"match\"");
        assert_eq!(ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn json_rows_become_records() {
        let record = record_from_json(json!({"id": 7, "title": null, "company": "Acme"}))
            .expect("record");
        assert_eq!(record.id, 7);
        assert_eq!(record.value("company"), json!("Acme"));
        assert!(record.fields.contains_key("title"));
        assert!(matches!(
            record_from_json(json!({"title": "x"})),
            Err(StorageCause::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn live_database_scan_when_configured() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let gateway = PgGateway::connect(&url).await.expect("connect");
        let rows = gateway
            .scan(EntityType::Job, &ScanQuery::all().limit(1))
            .await
            .expect("scan");
        assert!(rows.len() <= 1);
        gateway.close().await;
    }
}
