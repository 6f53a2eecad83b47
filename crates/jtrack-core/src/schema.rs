//! Resolved schema model plus replay of the versioned schema evolution log.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Application,
    ApplicationNote,
    Match,
    TestSession,
    TestResult,
    CacheEntry,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::Job,
        EntityType::Application,
        EntityType::ApplicationNote,
        EntityType::Match,
        EntityType::TestSession,
        EntityType::TestResult,
        EntityType::CacheEntry,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            EntityType::Job => "jobs",
            EntityType::Application => "applications",
            EntityType::ApplicationNote => "application_notes",
            EntityType::Match => "matches",
            EntityType::TestSession => "test_sessions",
            EntityType::TestResult => "test_results",
            EntityType::CacheEntry => "cv_analysis_cache",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        EntityType::ALL
            .into_iter()
            .find(|entity| {
                entity.table_name() == wanted
                    || serde_json::to_value(entity)
                        .ok()
                        .and_then(|v| v.as_str().map(|name| name == wanted))
                        .unwrap_or(false)
            })
            .ok_or(SchemaError::UnknownEntity(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown entity type `{0}`")]
    UnknownEntity(String),
    #[error("table {0} does not exist in the resolved schema")]
    MissingTable(EntityType),
    #[error("{entity} has no field `{field}`")]
    UnknownField { entity: EntityType, field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    Text,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDef {
    pub fn required(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable: false,
        }
    }

    pub fn optional(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity: EntityType,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CascadePolicy {
    Cascade,
    Restrict,
}

/// Foreign key from `child.foreign_key` to `parent.id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub parent: EntityType,
    pub child: EntityType,
    pub foreign_key: String,
    pub on_delete: CascadePolicy,
}

impl Relationship {
    pub fn new(parent: EntityType, child: EntityType, foreign_key: &str, on_delete: CascadePolicy) -> Self {
        Self {
            parent,
            child,
            foreign_key: foreign_key.to_string(),
            on_delete,
        }
    }

    /// Stable label such as `applications.job_id`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.child, self.foreign_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub entity: EntityType,
    pub fields: Vec<String>,
}

impl UniqueConstraint {
    pub fn new(entity: EntityType, fields: &[&str]) -> Self {
        Self {
            entity,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    entities: BTreeMap<EntityType, EntitySchema>,
    relationships: Vec<Relationship>,
    unique_constraints: Vec<UniqueConstraint>,
}

impl Schema {
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a SchemaChange>) -> Result<Self, SchemaError> {
        let mut schema = Schema::default();
        for change in changes {
            change.apply(&mut schema)?;
        }
        Ok(schema)
    }

    /// Current resolved schema of the job-tracker datastore.
    pub fn job_tracker() -> Self {
        SchemaLog::job_tracker()
            .resolve()
            .expect("built-in schema log resolves")
    }

    pub fn entity(&self, entity: EntityType) -> Option<&EntitySchema> {
        self.entities.get(&entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values()
    }

    pub fn has_field(&self, entity: EntityType, field: &str) -> bool {
        field == "id"
            || self
                .entities
                .get(&entity)
                .is_some_and(|schema| schema.field(field).is_some())
    }

    pub fn require_field(&self, entity: EntityType, field: &str) -> Result<(), SchemaError> {
        if !self.entities.contains_key(&entity) {
            return Err(SchemaError::MissingTable(entity));
        }
        if self.has_field(entity, field) {
            Ok(())
        } else {
            Err(SchemaError::UnknownField {
                entity,
                field: field.to_string(),
            })
        }
    }

    /// Foreign keys declared by `entity`.
    pub fn relationships_of(&self, entity: EntityType) -> Vec<&Relationship> {
        self.relationships.iter().filter(|r| r.child == entity).collect()
    }

    /// Relationships in which `entity` is the referenced parent.
    pub fn dependents_of(&self, entity: EntityType) -> Vec<&Relationship> {
        self.relationships.iter().filter(|r| r.parent == entity).collect()
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn unique_constraints_of(&self, entity: EntityType) -> Vec<&UniqueConstraint> {
        self.unique_constraints
            .iter()
            .filter(|c| c.entity == entity)
            .collect()
    }
}

/// One entry of the schema evolution log. Applying an entry twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateTable { entity: EntityType, fields: Vec<FieldDef> },
    DropTable { entity: EntityType, fields: Vec<FieldDef> },
    AddColumn { entity: EntityType, field: FieldDef },
    DropColumn { entity: EntityType, field: FieldDef },
    AddForeignKey(Relationship),
    DropForeignKey(Relationship),
    AddUnique(UniqueConstraint),
    DropUnique(UniqueConstraint),
}

impl SchemaChange {
    pub fn apply(&self, schema: &mut Schema) -> Result<(), SchemaError> {
        match self {
            SchemaChange::CreateTable { entity, fields } => {
                schema.entities.entry(*entity).or_insert_with(|| EntitySchema {
                    entity: *entity,
                    fields: fields.clone(),
                });
            }
            SchemaChange::DropTable { entity, .. } => {
                schema.entities.remove(entity);
                schema
                    .relationships
                    .retain(|r| r.parent != *entity && r.child != *entity);
                schema.unique_constraints.retain(|c| c.entity != *entity);
            }
            SchemaChange::AddColumn { entity, field } => {
                let table = schema
                    .entities
                    .get_mut(entity)
                    .ok_or(SchemaError::MissingTable(*entity))?;
                if table.field(&field.name).is_none() {
                    table.fields.push(field.clone());
                }
            }
            SchemaChange::DropColumn { entity, field } => {
                if let Some(table) = schema.entities.get_mut(entity) {
                    table.fields.retain(|f| f.name != field.name);
                }
                schema
                    .relationships
                    .retain(|r| !(r.child == *entity && r.foreign_key == field.name));
                schema
                    .unique_constraints
                    .retain(|c| !(c.entity == *entity && c.fields.contains(&field.name)));
            }
            SchemaChange::AddForeignKey(rel) => {
                if !schema.entities.contains_key(&rel.parent) {
                    return Err(SchemaError::MissingTable(rel.parent));
                }
                schema.require_field(rel.child, &rel.foreign_key)?;
                if !schema.relationships.contains(rel) {
                    schema.relationships.push(rel.clone());
                }
            }
            SchemaChange::DropForeignKey(rel) => schema.relationships.retain(|r| r != rel),
            SchemaChange::AddUnique(constraint) => {
                for field in &constraint.fields {
                    schema.require_field(constraint.entity, field)?;
                }
                if !schema.unique_constraints.contains(constraint) {
                    schema.unique_constraints.push(constraint.clone());
                }
            }
            SchemaChange::DropUnique(constraint) => {
                schema.unique_constraints.retain(|c| c != constraint)
            }
        }
        Ok(())
    }

    pub fn inverse(&self) -> SchemaChange {
        match self.clone() {
            SchemaChange::CreateTable { entity, fields } => SchemaChange::DropTable { entity, fields },
            SchemaChange::DropTable { entity, fields } => SchemaChange::CreateTable { entity, fields },
            SchemaChange::AddColumn { entity, field } => SchemaChange::DropColumn { entity, field },
            SchemaChange::DropColumn { entity, field } => SchemaChange::AddColumn { entity, field },
            SchemaChange::AddForeignKey(rel) => SchemaChange::DropForeignKey(rel),
            SchemaChange::DropForeignKey(rel) => SchemaChange::AddForeignKey(rel),
            SchemaChange::AddUnique(c) => SchemaChange::DropUnique(c),
            SchemaChange::DropUnique(c) => SchemaChange::AddUnique(c),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedChange {
    pub version: String,
    pub change: SchemaChange,
}

/// Ordered, append-only schema history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLog {
    pub entries: Vec<VersionedChange>,
}

impl SchemaLog {
    pub fn push(&mut self, version: &str, change: SchemaChange) {
        self.entries.push(VersionedChange {
            version: version.to_string(),
            change,
        });
    }

    pub fn resolve(&self) -> Result<Schema, SchemaError> {
        Schema::from_changes(self.entries.iter().map(|e| &e.change))
    }

    /// Migration history of the job-tracker datastore, restricted to the entities the
    /// reconciliation engine knows about.
    pub fn job_tracker() -> Self {
        use CascadePolicy::Cascade;
        use EntityType::*;
        use FieldType::*;

        let mut log = SchemaLog::default();
        log.push(
            "20250723000326_initial_schema",
            SchemaChange::CreateTable {
                entity: Job,
                fields: vec![
                    FieldDef::required("id", Integer),
                    FieldDef::required("title", Text),
                    FieldDef::required("company", Text),
                    FieldDef::optional("location", Text),
                    FieldDef::required("url", Text),
                    FieldDef::required("scraped_at", Timestamp),
                    FieldDef::required("source", Text),
                ],
            },
        );
        log.push(
            "20250723000326_initial_schema",
            SchemaChange::CreateTable {
                entity: Match,
                fields: vec![
                    FieldDef::required("id", Integer),
                    FieldDef::required("job_id", Integer),
                    FieldDef::required("match", Boolean),
                    FieldDef::optional("score", Float),
                    FieldDef::optional("reasons", Json),
                    FieldDef::required("checked_at", Timestamp),
                ],
            },
        );
        log.push(
            "20250723000326_initial_schema",
            SchemaChange::CreateTable {
                entity: Application,
                fields: vec![
                    FieldDef::required("id", Integer),
                    FieldDef::required("job_id", Integer),
                    FieldDef::required("status", Text),
                    FieldDef::optional("applied_at", Timestamp),
                    FieldDef::optional("meta", Json),
                ],
            },
        );
        log.push(
            "20250723000326_initial_schema",
            SchemaChange::AddUnique(UniqueConstraint::new(Job, &["url"])),
        );
        log.push(
            "20250723000326_initial_schema",
            SchemaChange::AddForeignKey(Relationship::new(Job, Match, "job_id", Cascade)),
        );
        log.push(
            "20250723000326_initial_schema",
            SchemaChange::AddForeignKey(Relationship::new(Job, Application, "job_id", Cascade)),
        );
        log.push(
            "20250723210038_add_interview_prep_to_jobs",
            SchemaChange::AddColumn {
                entity: Job,
                field: FieldDef::optional("interview_prep", Json),
            },
        );
        log.push(
            "20250724022622_add_salary_to_jobs",
            SchemaChange::AddColumn {
                entity: Job,
                field: FieldDef::optional("salary", Text),
            },
        );
        log.push(
            "20250725024905_create_test_hub_tables",
            SchemaChange::CreateTable {
                entity: TestSession,
                fields: vec![
                    FieldDef::required("id", Integer),
                    FieldDef::required("skill", Text),
                    FieldDef::required("difficulty", Text),
                    FieldDef::optional("score", Float),
                    FieldDef::required("completed_at", Timestamp),
                ],
            },
        );
        log.push(
            "20250725024905_create_test_hub_tables",
            SchemaChange::CreateTable {
                entity: TestResult,
                fields: vec![
                    FieldDef::required("id", Integer),
                    FieldDef::required("session_id", Integer),
                    FieldDef::required("question_text", Text),
                    FieldDef::optional("user_answer", Text),
                    FieldDef::optional("correct_answer", Text),
                    FieldDef::optional("feedback", Text),
                    FieldDef::optional("is_correct", Boolean),
                ],
            },
        );
        log.push(
            "20250725024905_create_test_hub_tables",
            SchemaChange::AddForeignKey(Relationship::new(
                TestSession,
                TestResult,
                "session_id",
                Cascade,
            )),
        );
        log.push(
            "20250725033155_add_type_to_test_sessions",
            SchemaChange::AddColumn {
                entity: TestSession,
                field: FieldDef::optional("type", Text),
            },
        );
        log.push(
            "20250730112200_add_options_to_test_results",
            SchemaChange::AddColumn {
                entity: TestResult,
                field: FieldDef::optional("options", Json),
            },
        );
        log.push(
            "20250730170049_add_skills_to_jobs_table",
            SchemaChange::AddColumn {
                entity: Job,
                field: FieldDef::optional("skills", Json),
            },
        );
        log.push(
            "20250806131133_add_notes_to_applications_table",
            SchemaChange::CreateTable {
                entity: ApplicationNote,
                fields: vec![
                    FieldDef::required("id", Integer),
                    FieldDef::required("application_id", Integer),
                    FieldDef::required("note", Text),
                    FieldDef::required("created_at", Timestamp),
                ],
            },
        );
        log.push(
            "20250806131133_add_notes_to_applications_table",
            SchemaChange::AddForeignKey(Relationship::new(
                Application,
                ApplicationNote,
                "application_id",
                Cascade,
            )),
        );
        log.push(
            "20250806133903_add_unique_job_id_to_applications",
            SchemaChange::AddUnique(UniqueConstraint::new(Application, &["job_id"])),
        );
        for column in ["missing_skills", "suggested_tests", "completed_tests", "key_insights"] {
            log.push(
                "20250821161749_add_enhanced_matching_fields",
                SchemaChange::AddColumn {
                    entity: Match,
                    field: FieldDef::optional(column, Json),
                },
            );
        }
        log.push(
            "20250822151000_create_cv_analysis_cache_table",
            SchemaChange::CreateTable {
                entity: CacheEntry,
                fields: vec![
                    FieldDef::required("id", Integer),
                    FieldDef::required("cache_key", Text),
                    FieldDef::required("analysis_type", Text),
                    FieldDef::required("cached_result", Json),
                    FieldDef::optional("input_data_hash", Text),
                    FieldDef::optional("created_at", Timestamp),
                    FieldDef::required("expires_at", Timestamp),
                    FieldDef::optional("hit_count", Integer),
                    FieldDef::optional("last_accessed_at", Timestamp),
                ],
            },
        );
        log.push(
            "20250822151000_create_cv_analysis_cache_table",
            SchemaChange::AddUnique(UniqueConstraint::new(CacheEntry, &["cache_key"])),
        );
        log.push(
            "20250825074000_add_missing_columns",
            SchemaChange::AddColumn {
                entity: Application,
                field: FieldDef::optional("source", Text),
            },
        );
        log.push(
            "20250825074100_add_updated_at_to_applications",
            SchemaChange::AddColumn {
                entity: Application,
                field: FieldDef::optional("updated_at", Timestamp),
            },
        );
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_schema_declares_job_cascades() {
        let schema = Schema::job_tracker();
        let dependents = schema
            .dependents_of(EntityType::Job)
            .into_iter()
            .map(|r| r.child)
            .collect::<Vec<_>>();
        assert_eq!(dependents, vec![EntityType::Match, EntityType::Application]);
        assert!(schema
            .dependents_of(EntityType::Job)
            .iter()
            .all(|r| r.on_delete == CascadePolicy::Cascade));
        assert_eq!(
            schema.relationships_of(EntityType::ApplicationNote)[0].label(),
            "application_notes.application_id"
        );
    }

    #[test]
    fn application_job_id_is_unique_after_replay() {
        let schema = Schema::job_tracker();
        let constraints = schema.unique_constraints_of(EntityType::Application);
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].fields, vec!["job_id".to_string()]);
        assert!(schema.has_field(EntityType::Job, "salary"));
        assert!(schema.has_field(EntityType::Match, "key_insights"));
    }

    #[test]
    fn replaying_a_change_twice_is_a_noop() {
        let log = SchemaLog::job_tracker();
        let once = log.resolve().expect("resolve");
        let mut twice = once.clone();
        for entry in &log.entries {
            entry.change.apply(&mut twice).expect("reapply");
        }
        assert_eq!(once, twice);
    }

    #[test]
    fn inverse_undoes_constraint_changes() {
        let mut schema = Schema::job_tracker();
        let change = SchemaChange::AddUnique(UniqueConstraint::new(EntityType::Application, &["job_id"]));
        change.inverse().apply(&mut schema).expect("drop unique");
        assert!(schema.unique_constraints_of(EntityType::Application).is_empty());
        change.apply(&mut schema).expect("re-add unique");
        assert_eq!(schema.unique_constraints_of(EntityType::Application).len(), 1);
    }

    #[test]
    fn foreign_key_on_missing_column_is_rejected() {
        let mut schema = Schema::job_tracker();
        let err = SchemaChange::AddForeignKey(Relationship::new(
            EntityType::Job,
            EntityType::CacheEntry,
            "job_id",
            CascadePolicy::Restrict,
        ))
        .apply(&mut schema)
        .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownField {
                entity: EntityType::CacheEntry,
                field: "job_id".into()
            }
        );
    }

    #[test]
    fn entity_types_parse_from_table_names() {
        assert_eq!("applications".parse::<EntityType>().unwrap(), EntityType::Application);
        assert_eq!("test_session".parse::<EntityType>().unwrap(), EntityType::TestSession);
        assert!("users".parse::<EntityType>().is_err());
    }
}
