//! Typed views over the records the reconciliation engine reasons about.
//!
//! Rows written over the datastore's lifetime use several encodings for the same column
//! (RFC 3339 strings, naive datetimes, epoch milliseconds, JSON stored as text), so the
//! decoders here accept all of them.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{as_record_id, FieldMap, RecordId};

/// Placeholder title written by scrapers that failed to extract one.
pub const UNTITLED_JOB: &str = "Untitled Job";

pub const BACKFILL_NOTE: &str = "Auto-generated opportunity from existing job.";

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
                return Some(ts.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn flexible_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null);
    if value.is_null() {
        return Ok(None);
    }
    parse_timestamp(&value)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp {value}")))
}

fn flexible_reference<'de, D>(deserializer: D) -> Result<Option<RecordId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null);
    Ok(as_record_id(&value))
}

fn flexible_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null);
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        Value::String(text) if text.trim().is_empty() => return Ok(Vec::new()),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => items,
            _ => return Ok(vec![text]),
        },
        other => vec![other],
    };
    Ok(items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: RecordId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub scraped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default, deserialize_with = "flexible_list")]
    pub skills: Vec<String>,
    #[serde(default)]
    pub interview_prep: Option<Value>,
}

impl Job {
    /// A job is valid only with a non-blank title other than the scraper placeholder.
    pub fn has_usable_title(&self) -> bool {
        match self.title.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(title) => title != UNTITLED_JOB,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Opportunity,
    Applied,
    External,
    Followup,
    Rejected,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: RecordId,
    #[serde(default, deserialize_with = "flexible_reference")]
    pub job_id: Option<RecordId>,
    #[serde(default)]
    pub status: ApplicationStatus,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Synthetic application created for a job that has none.
#[derive(Debug, Clone, PartialEq)]
pub struct NewApplication {
    pub job_id: RecordId,
    pub status: ApplicationStatus,
    pub applied_at: Option<DateTime<Utc>>,
    pub note: String,
}

impl NewApplication {
    pub fn opportunity(job_id: RecordId, applied_at: Option<DateTime<Utc>>) -> Self {
        Self {
            job_id,
            status: ApplicationStatus::Opportunity,
            applied_at,
            note: BACKFILL_NOTE.to_string(),
        }
    }

    pub fn into_fields(self) -> FieldMap {
        let applied_at = self
            .applied_at
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null);
        let mut fields = FieldMap::new();
        fields.insert("job_id".into(), Value::from(self.job_id));
        fields.insert(
            "status".into(),
            serde_json::to_value(self.status).unwrap_or(Value::Null),
        );
        fields.insert("applied_at".into(), applied_at.clone());
        fields.insert("updated_at".into(), applied_at);
        fields.insert("meta".into(), serde_json::json!({ "note": self.note }));
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: RecordId,
    pub cache_key: String,
    #[serde(default)]
    pub analysis_type: Option<String>,
    #[serde(default)]
    pub cached_result: Value,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hit_count: Option<i64>,
}

impl CacheEntry {
    /// Entries without an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;
    use serde_json::json;

    #[test]
    fn timestamps_decode_from_legacy_encodings() {
        let expected = Utc.with_ymd_and_hms(2025, 7, 23, 20, 58, 3).single().unwrap();
        for raw in [
            json!("2025-07-23T20:58:03Z"),
            json!("2025-07-23T22:58:03+02:00"),
            json!("2025-07-23 20:58:03"),
            json!("2025-07-23T20:58:03.000"),
            json!(1_753_304_283_000_i64),
        ] {
            assert_eq!(parse_timestamp(&raw), Some(expected), "decoding {raw}");
        }
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }

    #[test]
    fn application_decodes_drifted_row() {
        let record = Record::new(3)
            .with("job_id", "12")
            .with("status", "archived")
            .with("applied_at", 1_753_304_283_000_i64)
            .with("meta", "{\"note\":\"x\"}");
        let app: Application = record.decode().expect("decode");
        assert_eq!(app.job_id, Some(12));
        assert_eq!(app.status, ApplicationStatus::Unknown);
        assert!(app.applied_at.is_some());
    }

    #[test]
    fn job_title_validity() {
        let mut job: Job = Record::new(1)
            .with("title", "Backend Engineer")
            .with("skills", "[\"rust\",\"sql\"]")
            .decode()
            .expect("decode");
        assert!(job.has_usable_title());
        assert_eq!(job.skills, vec!["rust", "sql"]);

        job.title = Some(UNTITLED_JOB.into());
        assert!(!job.has_usable_title());
        job.title = Some("   ".into());
        assert!(!job.has_usable_title());
        job.title = None;
        assert!(!job.has_usable_title());
    }

    #[test]
    fn backfill_fields_carry_opportunity_status() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().unwrap();
        let fields = NewApplication::opportunity(7, Some(at)).into_fields();
        assert_eq!(fields["status"], json!("opportunity"));
        assert_eq!(fields["job_id"], json!(7));
        assert_eq!(fields["applied_at"], json!(at.to_rfc3339()));
        assert_eq!(fields["meta"]["note"], json!(BACKFILL_NOTE));

        let undated = NewApplication::opportunity(8, None).into_fields();
        assert!(undated["applied_at"].is_null());
    }
}
