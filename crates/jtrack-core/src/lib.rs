//! Core data model for the job-tracker integrity engine: schema, records, predicates.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod entity;
pub mod schema;

pub use entity::{
    parse_timestamp, Application, ApplicationStatus, CacheEntry, Job, NewApplication,
    UNTITLED_JOB,
};
pub use schema::{
    CascadePolicy, EntitySchema, EntityType, FieldDef, FieldType, Relationship, Schema, SchemaChange,
    SchemaError, SchemaLog, UniqueConstraint, VersionedChange,
};

pub const CRATE_NAME: &str = "jtrack-core";

pub type RecordId = i64;

pub type FieldMap = BTreeMap<String, Value>;

/// Entity-generic row exchanged with a storage gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            fields: FieldMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Field value with `id` resolved to the record id and absent fields read as null.
    pub fn value(&self, field: &str) -> Value {
        if field == "id" {
            return Value::from(self.id);
        }
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    /// Foreign key stored in `field`, if it holds something id-shaped.
    pub fn reference(&self, field: &str) -> Option<RecordId> {
        as_record_id(&self.value(field))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut object = serde_json::Map::with_capacity(self.fields.len() + 1);
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        object.insert("id".to_string(), Value::from(self.id));
        serde_json::from_value(Value::Object(object))
    }
}

/// Accepts integer ids as numbers, whole floats, or numeric strings (legacy rows).
pub fn as_record_id(value: &Value) -> Option<RecordId> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(_), Value::Number(_)) | (Value::Number(_), Value::String(_)) => {
            as_record_id(a).is_some() && as_record_id(a) == as_record_id(b)
        }
        _ => a == b,
    }
}

/// Total order over scalar JSON values. Null handling is left to the caller.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) == rank(b) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Row filter understood by every gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    /// Text field whose whitespace-trimmed value is one of the given strings.
    TrimmedIn(String, Vec<String>),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.to_string(), value.into())
    }

    pub fn is_null(field: &str) -> Self {
        Predicate::IsNull(field.to_string())
    }

    pub fn ids(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Predicate::In("id".to_string(), ids.into_iter().map(Value::from).collect())
    }

    pub fn any_of(field: &str, values: impl IntoIterator<Item = Value>) -> Self {
        Predicate::In(field.to_string(), values.into_iter().collect())
    }

    pub fn trimmed_in<'a>(field: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        Predicate::TrimmedIn(
            field.to_string(),
            values.into_iter().map(str::to_string).collect(),
        )
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::Eq(field, expected) => {
                let actual = record.value(field);
                !actual.is_null() && values_equal(&actual, expected)
            }
            Predicate::In(field, candidates) => {
                let actual = record.value(field);
                !actual.is_null() && candidates.iter().any(|c| values_equal(&actual, c))
            }
            Predicate::IsNull(field) => record.value(field).is_null(),
            Predicate::TrimmedIn(field, candidates) => match record.value(field) {
                Value::String(text) => candidates.iter().any(|c| c == text.trim()),
                _ => false,
            },
            Predicate::Not(inner) => !inner.matches(record),
            Predicate::And(all) => all.iter().all(|p| p.matches(record)),
            Predicate::Or(any) => any.iter().any(|p| p.matches(record)),
        }
    }

    /// Every field name the predicate reads.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Predicate::Eq(field, _)
            | Predicate::In(field, _)
            | Predicate::IsNull(field)
            | Predicate::TrimmedIn(field, _) => {
                vec![field.as_str()]
            }
            Predicate::Not(inner) => inner.fields(),
            Predicate::And(parts) | Predicate::Or(parts) => {
                parts.iter().flat_map(|p| p.fields()).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Desc,
        }
    }

    /// Ascending puts nulls last, descending puts them first (PostgreSQL defaults).
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let (va, vb) = (a.value(&self.field), b.value(&self.field));
        let ordering = match (va.is_null(), vb.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_values(&va, &vb),
        };
        match self.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanQuery {
    pub predicate: Option<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl ScanQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        self.order_by
            .iter()
            .map(|order| order.compare(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }

    /// Every field referenced by the filter or the ordering.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = self
            .predicate
            .as_ref()
            .map(|p| p.fields())
            .unwrap_or_default();
        fields.extend(self.order_by.iter().map(|o| o.field.as_str()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicates_treat_null_as_absent() {
        let untitled = Record::new(9).with("title", Value::Null);
        let sentinel = Record::new(10).with("title", UNTITLED_JOB);
        let valid = Record::new(11).with("title", "Rust Engineer");
        let invalid = Predicate::Or(vec![
            Predicate::is_null("title"),
            Predicate::eq("title", UNTITLED_JOB),
        ]);

        assert!(invalid.matches(&untitled));
        assert!(invalid.matches(&sentinel));
        assert!(!invalid.matches(&valid));
        assert!(!Predicate::eq("title", "x").matches(&untitled));
        assert!(Predicate::ids([10, 11]).matches(&valid));
    }

    #[test]
    fn numeric_equality_ignores_representation() {
        let record = Record::new(1).with("job_id", json!(5.0));
        assert!(Predicate::eq("job_id", 5).matches(&record));
        assert_eq!(record.reference("job_id"), Some(5));
        assert_eq!(Record::new(2).with("job_id", "7").reference("job_id"), Some(7));
        assert_eq!(Record::new(3).with("job_id", "seven").reference("job_id"), None);
        let legacy = Record::new(4).with("job_id", "7");
        assert!(Predicate::any_of("job_id", [json!(7)]).matches(&legacy));
        assert!(!Predicate::eq("job_id", 7.5).matches(&legacy));
        assert!(!Predicate::eq("title", 7).matches(&Record::new(5).with("title", "seven")));
    }

    #[test]
    fn trimmed_matching_ignores_padding() {
        let placeholder = Predicate::trimmed_in("title", ["", "Untitled Job"]);
        assert!(placeholder.matches(&Record::new(1).with("title", "  Untitled Job ")));
        assert!(placeholder.matches(&Record::new(2).with("title", "   ")));
        assert!(!placeholder.matches(&Record::new(3).with("title", "Untitled Jobs")));
        assert!(!placeholder.matches(&Record::new(4)));
        assert_eq!(placeholder.fields(), vec!["title"]);
    }

    #[test]
    fn ordering_puts_nulls_last_ascending() {
        let mut rows = vec![
            Record::new(1).with("applied_at", Value::Null),
            Record::new(2).with("applied_at", "2025-07-02T00:00:00Z"),
            Record::new(3).with("applied_at", "2025-07-01T00:00:00Z"),
        ];
        let query = ScanQuery::all()
            .order_by(OrderBy::asc("applied_at"))
            .order_by(OrderBy::asc("id"));
        rows.sort_by(|a, b| query.compare(a, b));
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2, 1]);

        rows.sort_by(|a, b| OrderBy::desc("id").compare(a, b));
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn record_serializes_flat() {
        let record = Record::new(4).with("status", "applied");
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value, json!({"id": 4, "status": "applied"}));
        let back: Record = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, record);
    }
}
