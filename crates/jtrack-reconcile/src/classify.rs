//! Pure classification over snapshots. Nothing in here performs I/O or reads the clock.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use jtrack_core::{Application, CacheEntry, Job, Predicate, Record, RecordId};
use serde::{Deserialize, Serialize};

/// Applications sharing one job, with the one to keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub job_id: RecordId,
    pub survivor: RecordId,
    pub redundant: Vec<RecordId>,
}

/// Child row reduced to its id and the foreign key under inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildLink {
    pub id: RecordId,
    pub foreign_key: Option<RecordId>,
}

impl ChildLink {
    pub fn from_record(record: &Record, foreign_key: &str) -> Self {
        Self {
            id: record.id,
            foreign_key: record.reference(foreign_key),
        }
    }
}

/// Groups applications by job and picks the survivor of each group of two or more: the
/// earliest non-null `applied_at`, ties and all-null groups falling back to the lowest id.
/// Applications without a job are left to orphan detection.
pub fn find_duplicate_groups(applications: &[Application]) -> Vec<DuplicateGroup> {
    let mut by_job: BTreeMap<RecordId, Vec<&Application>> = BTreeMap::new();
    for app in applications {
        if let Some(job_id) = app.job_id {
            by_job.entry(job_id).or_default().push(app);
        }
    }

    by_job
        .into_iter()
        .filter(|(_, group)| group.len() >= 2)
        .filter_map(|(job_id, group)| {
            let survivor = group
                .iter()
                .min_by_key(|app| (app.applied_at.is_none(), app.applied_at, app.id))?
                .id;
            let mut redundant = group
                .iter()
                .map(|app| app.id)
                .filter(|id| *id != survivor)
                .collect::<Vec<_>>();
            redundant.sort_unstable();
            Some(DuplicateGroup {
                job_id,
                survivor,
                redundant,
            })
        })
        .collect()
}

/// Children whose foreign key is null or not in `parent_ids`, sorted by id.
pub fn find_orphans(children: &[ChildLink], parent_ids: &HashSet<RecordId>) -> Vec<RecordId> {
    let mut orphans = children
        .iter()
        .filter(|child| {
            child
                .foreign_key
                .map_or(true, |parent| !parent_ids.contains(&parent))
        })
        .map(|child| child.id)
        .collect::<Vec<_>>();
    orphans.sort_unstable();
    orphans.dedup();
    orphans
}

/// Jobs no application points at, in the order given.
pub fn find_missing_counterparts(jobs: &[Job], applications: &[Application]) -> Vec<RecordId> {
    let covered = applications
        .iter()
        .filter_map(|app| app.job_id)
        .collect::<HashSet<_>>();
    jobs.iter()
        .map(|job| job.id)
        .filter(|id| !covered.contains(id))
        .collect()
}

pub fn find_invalid_records(jobs: &[Job]) -> Vec<RecordId> {
    jobs.iter()
        .filter(|job| !job.has_usable_title())
        .map(|job| job.id)
        .collect()
}

pub fn find_expired(entries: &[CacheEntry], now: DateTime<Utc>) -> Vec<RecordId> {
    entries
        .iter()
        .filter(|entry| entry.is_expired(now))
        .map(|entry| entry.id)
        .collect()
}

pub fn find_undated(applications: &[Application]) -> Vec<RecordId> {
    applications
        .iter()
        .filter(|app| app.applied_at.is_none())
        .map(|app| app.id)
        .collect()
}

/// Re-applies a selection predicate to rows already scanned with it.
pub fn find_matching(records: &[Record], predicate: &Predicate) -> Vec<RecordId> {
    records
        .iter()
        .filter(|record| predicate.matches(record))
        .map(|record| record.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jtrack_core::ApplicationStatus;

    fn ts(day: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(2025, 8, day, 9, 0, 0).single()
    }

    fn app(id: RecordId, job_id: Option<RecordId>, applied_at: Option<DateTime<Utc>>) -> Application {
        Application {
            id,
            job_id,
            status: ApplicationStatus::Applied,
            applied_at,
            meta: None,
            source: None,
        }
    }

    fn job(id: RecordId, title: Option<&str>) -> Job {
        Record::new(id)
            .with("title", title.map(str::to_string))
            .decode()
            .expect("job decodes")
    }

    #[test]
    fn earliest_dated_application_survives() {
        let groups = find_duplicate_groups(&[
            app(1, Some(7), ts(2)),
            app(2, Some(7), ts(1)),
            app(3, Some(7), ts(3)),
            app(4, Some(8), ts(1)),
        ]);
        assert_eq!(
            groups,
            vec![DuplicateGroup {
                job_id: 7,
                survivor: 2,
                redundant: vec![1, 3],
            }]
        );
    }

    #[test]
    fn null_timestamps_lose_to_dated_rows_and_ties_go_to_lowest_id() {
        let groups = find_duplicate_groups(&[
            app(5, Some(1), None),
            app(9, Some(1), ts(4)),
            app(6, Some(1), ts(4)),
            app(11, Some(2), None),
            app(10, Some(2), None),
            app(12, None, None),
            app(13, None, None),
        ]);
        assert_eq!(groups[0].survivor, 6);
        assert_eq!(groups[0].redundant, vec![5, 9]);
        assert_eq!(groups[1].survivor, 10);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn null_foreign_keys_are_orphans() {
        let parents = HashSet::from([1, 2]);
        let children = [
            ChildLink { id: 30, foreign_key: Some(2) },
            ChildLink { id: 10, foreign_key: Some(3) },
            ChildLink { id: 20, foreign_key: None },
        ];
        assert_eq!(find_orphans(&children, &parents), vec![10, 20]);
        assert!(find_orphans(&children, &HashSet::new()).len() == 3);
    }

    #[test]
    fn jobs_without_applications_are_missing() {
        let jobs = [job(1, Some("a")), job(2, Some("b")), job(3, Some("c"))];
        let apps = [app(10, Some(1), ts(1)), app(11, Some(99), ts(1))];
        assert_eq!(find_missing_counterparts(&jobs, &apps), vec![2, 3]);
    }

    #[test]
    fn placeholder_and_blank_titles_are_invalid() {
        let jobs = [
            job(8, Some("Backend Engineer")),
            job(9, None),
            job(10, Some("Untitled Job")),
            job(11, Some("  ")),
        ];
        assert_eq!(find_invalid_records(&jobs), vec![9, 10, 11]);
    }

    #[test]
    fn expiry_is_inclusive_of_now() {
        let now = Utc.with_ymd_and_hms(2025, 8, 22, 12, 0, 0).single().unwrap();
        let entry = |id: RecordId, expires_at: Option<DateTime<Utc>>| CacheEntry {
            id,
            cache_key: format!("k{id}"),
            analysis_type: None,
            cached_result: serde_json::Value::Null,
            created_at: None,
            expires_at,
            hit_count: None,
        };
        let entries = [
            entry(1, Some(now)),
            entry(2, Some(now + chrono::Duration::seconds(1))),
            entry(3, None),
            entry(4, Some(now - chrono::Duration::days(1))),
        ];
        assert_eq!(find_expired(&entries, now), vec![1, 4]);
    }

    #[test]
    fn undated_and_matching_selections() {
        assert_eq!(
            find_undated(&[app(1, Some(1), None), app(2, Some(2), ts(1))]),
            vec![1]
        );
        let rows = [
            Record::new(1).with("source", "manual-bulk"),
            Record::new(2).with("source", "linkedin"),
        ];
        assert_eq!(
            find_matching(&rows, &Predicate::eq("source", "manual-bulk")),
            vec![1]
        );
    }
}
