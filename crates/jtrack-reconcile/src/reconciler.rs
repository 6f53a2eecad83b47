//! One reconciliation pass: Idle, Scanning, Classifying, Planning, Applying, Reporting.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use jtrack_core::{
    as_record_id, Application, CacheEntry, EntityType, Job, NewApplication, OrderBy, Predicate,
    Record, RecordId, Relationship, ScanQuery, UNTITLED_JOB,
};
use jtrack_storage::{parse_group_key, CascadePlan, Operation, StorageCause, StorageError, StorageGateway};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::audit::{AuditReporter, AuditSummary, PassState};
use crate::category::{BackfillTimestamp, Category, CounterpartRepair, ReconcileRequest, RepairPolicy};
use crate::classify::{
    find_duplicate_groups, find_expired, find_invalid_records, find_matching,
    find_missing_counterparts, find_orphans, find_undated, ChildLink,
};
use crate::config::ReconcileConfig;
use crate::error::ReconcileError;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const ALREADY_RESOLVED: &str = "already resolved";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Cascading bulk delete of the unit's ids.
    Delete,
    /// One synthetic application per job id, inserted in a single bulk call.
    Backfill,
}

impl RepairAction {
    pub fn name(self) -> &'static str {
        match self {
            RepairAction::Delete => "delete",
            RepairAction::Backfill => "backfill",
        }
    }
}

/// The id set one repair step acts on. Each unit is applied as a single bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairUnit {
    pub label: String,
    pub entity: EntityType,
    pub action: RepairAction,
    pub ids: BTreeSet<RecordId>,
}

#[derive(Debug)]
pub struct PassResult {
    pub summary: AuditSummary,
    pub error: Option<ReconcileError>,
}

impl PassResult {
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, ReconcileError::exit_code)
    }
}

#[derive(Debug)]
struct OrphanScan {
    relationship: Relationship,
    children: Vec<ChildLink>,
}

/// Minimal data pulled for one category.
#[derive(Debug)]
enum Snapshot {
    Duplicates(Vec<Application>),
    Orphans {
        scans: Vec<OrphanScan>,
        parent_ids: HashMap<EntityType, HashSet<RecordId>>,
    },
    Missing {
        jobs: Vec<Job>,
        applications: Vec<Application>,
    },
    InvalidJobs(Vec<Job>),
    Selection {
        label: String,
        entity: EntityType,
        rows: Vec<Record>,
        predicate: Option<Predicate>,
    },
    Expired {
        entries: Vec<CacheEntry>,
        now: DateTime<Utc>,
    },
    Undated(Vec<Application>),
}

pub struct Reconciler {
    gateway: Arc<dyn StorageGateway>,
    config: ReconcileConfig,
    clock: Clock,
    cancel: CancellationToken,
    apply_locks: BTreeMap<EntityType, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn StorageGateway>, config: ReconcileConfig) -> Self {
        Self {
            gateway,
            config,
            clock: Arc::new(Utc::now),
            cancel: CancellationToken::new(),
            apply_locks: EntityType::ALL
                .into_iter()
                .map(|entity| (entity, Arc::new(Mutex::new(()))))
                .collect(),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn run(&self, request: ReconcileRequest) -> PassResult {
        let mut audit = self.open_audit(&request);
        let span = pass_span(&audit, &request);
        async {
            let error = match self.prepare(&request, &mut audit).await {
                Ok(units) => self.apply(&request, &units, &mut audit).await.err(),
                Err(err) => Some(err),
            };
            self.report(audit, error)
        }
        .instrument(span)
        .await
    }

    /// Scans and classifies every request concurrently, then applies them one at a time in
    /// the order given.
    pub async fn run_many(&self, requests: Vec<ReconcileRequest>) -> Vec<PassResult> {
        let prepared = join_all(requests.into_iter().map(|request| async move {
            let mut audit = self.open_audit(&request);
            let span = pass_span(&audit, &request);
            let units = self
                .prepare(&request, &mut audit)
                .instrument(span.clone())
                .await;
            (request, audit, span, units)
        }))
        .await;

        let mut results = Vec::with_capacity(prepared.len());
        for (request, mut audit, span, units) in prepared {
            let result = async {
                let error = match units {
                    Ok(units) => self.apply(&request, &units, &mut audit).await.err(),
                    Err(err) => Some(err),
                };
                self.report(audit, error)
            }
            .instrument(span)
            .await;
            results.push(result);
        }
        results
    }

    fn open_audit(&self, request: &ReconcileRequest) -> AuditReporter {
        AuditReporter::new(
            Uuid::new_v4(),
            request.category.name(),
            request.scope.clone(),
            request.policy.name(),
            (self.clock)(),
            self.config.preview_limit,
        )
    }

    async fn prepare(
        &self,
        request: &ReconcileRequest,
        audit: &mut AuditReporter,
    ) -> Result<Vec<RepairUnit>, ReconcileError> {
        request.validate()?;
        if self.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        transition(audit, PassState::Scanning);
        let snapshot = self.scan(request).await?;

        transition(audit, PassState::Classifying);
        let units = classify(request, snapshot);
        for unit in &units {
            audit.found(&unit.label, unit.entity, unit.action.name(), &unit.ids);
        }
        info!(
            units = units.len(),
            found = units.iter().map(|u| u.ids.len()).sum::<usize>(),
            "classified"
        );
        Ok(units)
    }

    async fn apply(
        &self,
        request: &ReconcileRequest,
        units: &[RepairUnit],
        audit: &mut AuditReporter,
    ) -> Result<(), ReconcileError> {
        transition(audit, PassState::Planning);
        let planned = units.iter().map(|u| u.ids.len()).sum::<usize>();
        match request.policy {
            RepairPolicy::DryRun => {
                skip_all(audit, units, "dry run");
                return Ok(());
            }
            RepairPolicy::ConfirmAboveThreshold { max } if planned > max => {
                skip_all(audit, units, &format!("policy guard: {planned} > {max}"));
                return Err(ReconcileError::PolicyGuardTriggered {
                    category: request.category.name().to_string(),
                    planned,
                    threshold: max,
                });
            }
            _ => {}
        }
        if planned == 0 {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            skip_all(audit, units, "cancelled");
            return Err(ReconcileError::Cancelled);
        }

        transition(audit, PassState::Applying);
        for (index, unit) in units.iter().enumerate() {
            if unit.ids.is_empty() {
                continue;
            }
            if self.cancel.is_cancelled() {
                skip_all(audit, &units[index..], "cancelled");
                return Err(ReconcileError::Cancelled);
            }
            if let Err(err) = self.apply_unit(request, unit, audit).await {
                warn!(unit = %unit.label, error = %err, "repair unit failed");
                audit.unit_error(&unit.label, &err);
                skip_all(audit, &units[index + 1..], "aborted after storage error");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn apply_unit(
        &self,
        request: &ReconcileRequest,
        unit: &RepairUnit,
        audit: &mut AuditReporter,
    ) -> Result<(), ReconcileError> {
        let _guards = self.lock_for(unit).await;

        // Findings that vanished since classification are already fixed.
        let fresh = classify(request, self.scan(request).await?);
        let current = fresh
            .into_iter()
            .find(|u| u.label == unit.label)
            .map(|u| u.ids)
            .unwrap_or_default();
        let live = unit
            .ids
            .intersection(&current)
            .copied()
            .collect::<BTreeSet<_>>();
        let stale = unit.ids.len() - live.len();
        if stale > 0 {
            debug!(unit = %unit.label, stale, "dropping stale findings");
            audit.skipped(&unit.label, stale, ALREADY_RESOLVED);
        }
        if live.is_empty() {
            return Ok(());
        }

        match unit.action {
            RepairAction::Delete => {
                let report = self.gateway.bulk_delete(unit.entity, &live).await?;
                info!(
                    unit = %unit.label,
                    deleted = report.deleted,
                    cascaded = report.total() - report.deleted,
                    "bulk delete applied"
                );
                audit.repaired(&unit.label, report.deleted, &report.cascaded);
                let vanished = live.len().saturating_sub(report.deleted as usize);
                audit.skipped(&unit.label, vanished, ALREADY_RESOLVED);
            }
            RepairAction::Backfill => {
                let applied_at = match self.config.backfill_timestamp {
                    BackfillTimestamp::Now => Some((self.clock)()),
                    BackfillTimestamp::Null => None,
                };
                let rows = live
                    .iter()
                    .map(|job_id| NewApplication::opportunity(*job_id, applied_at).into_fields())
                    .collect();
                match self.gateway.bulk_insert(EntityType::Application, rows).await {
                    Ok(created) => {
                        info!(unit = %unit.label, inserted = created.len(), "backfill applied");
                        audit.repaired(&unit.label, created.len() as u64, &BTreeMap::new());
                    }
                    Err(err) => {
                        audit.skipped(&unit.label, live.len(), "aborted after storage error");
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Locks every entity the unit can touch, in a fixed order so concurrent passes cannot
    /// deadlock.
    async fn lock_for(&self, unit: &RepairUnit) -> Vec<OwnedMutexGuard<()>> {
        let entities = match unit.action {
            RepairAction::Delete => CascadePlan::for_delete(self.gateway.schema(), unit.entity).entities(),
            RepairAction::Backfill => BTreeSet::from([unit.entity, EntityType::Application]),
        };
        let mut guards = Vec::with_capacity(entities.len());
        for entity in entities {
            if let Some(lock) = self.apply_locks.get(&entity) {
                guards.push(Arc::clone(lock).lock_owned().await);
            }
        }
        guards
    }

    fn report(&self, mut audit: AuditReporter, error: Option<ReconcileError>) -> PassResult {
        transition(&mut audit, PassState::Reporting);
        match &error {
            Some(err) => warn!(error = %err, exit_code = err.exit_code(), "pass aborted"),
            None => info!("pass completed"),
        }
        let summary = audit.finish(error.as_ref(), (self.clock)());
        PassResult { summary, error }
    }

    async fn scan(&self, request: &ReconcileRequest) -> Result<Snapshot, StorageError> {
        let gateway = self.gateway.as_ref();
        let scope = &request.scope;
        let snapshot = match request.category {
            Category::Duplicates => {
                let counts = gateway
                    .count_grouped_by(EntityType::Application, "job_id")
                    .await?;
                let shared = counts
                    .into_iter()
                    .filter(|(_, count)| *count > 1)
                    .filter_map(|(key, _)| as_record_id(&parse_group_key(&key)))
                    .map(Value::from)
                    .collect::<Vec<_>>();
                if shared.is_empty() {
                    return Ok(Snapshot::Duplicates(Vec::new()));
                }
                let query = ScanQuery::filter(Predicate::any_of("job_id", shared))
                    .order_by(OrderBy::asc("applied_at"))
                    .order_by(OrderBy::asc("id"));
                let rows = gateway.scan(EntityType::Application, &query).await?;
                Snapshot::Duplicates(decode_rows(EntityType::Application, &rows)?)
            }
            Category::Orphans => {
                let relationships = gateway.schema().relationships().to_vec();
                let mut parent_ids: HashMap<EntityType, HashSet<RecordId>> = HashMap::new();
                let mut scans = Vec::with_capacity(relationships.len());
                for relationship in relationships {
                    if !parent_ids.contains_key(&relationship.parent) {
                        let parents = gateway.scan(relationship.parent, &ScanQuery::all()).await?;
                        parent_ids.insert(
                            relationship.parent,
                            parents.iter().map(|row| row.id).collect(),
                        );
                    }
                    let children = gateway.scan(relationship.child, &ScanQuery::all()).await?;
                    scans.push(OrphanScan {
                        children: children
                            .iter()
                            .map(|row| ChildLink::from_record(row, &relationship.foreign_key))
                            .collect(),
                        relationship,
                    });
                }
                Snapshot::Orphans { scans, parent_ids }
            }
            Category::Missing => {
                let mut query = ScanQuery::all().order_by(OrderBy::desc("id"));
                if let Some(limit) = scope.limit {
                    query = query.limit(limit);
                }
                let jobs: Vec<Job> = decode_rows(EntityType::Job, &gateway.scan(EntityType::Job, &query).await?)?;
                let app_query = match scope.limit {
                    Some(_) => ScanQuery::filter(Predicate::any_of(
                        "job_id",
                        jobs.iter().map(|job| Value::from(job.id)),
                    )),
                    None => ScanQuery::all(),
                };
                let applications = decode_rows(
                    EntityType::Application,
                    &gateway.scan(EntityType::Application, &app_query).await?,
                )?;
                Snapshot::Missing { jobs, applications }
            }
            Category::InvalidJobs => {
                let query = ScanQuery::filter(Predicate::Or(vec![
                    Predicate::is_null("title"),
                    Predicate::trimmed_in("title", ["", UNTITLED_JOB]),
                ]));
                let rows = gateway.scan(EntityType::Job, &query).await?;
                Snapshot::InvalidJobs(decode_rows(EntityType::Job, &rows)?)
            }
            Category::PurgeSource => {
                let source = scope.source.clone().unwrap_or_default();
                let predicate = Predicate::eq("source", source.as_str());
                let rows = gateway
                    .scan(EntityType::Job, &ScanQuery::filter(predicate.clone()))
                    .await?;
                Snapshot::Selection {
                    label: format!("jobs with source {source}"),
                    entity: EntityType::Job,
                    rows,
                    predicate: Some(predicate),
                }
            }
            Category::PurgeRecent => {
                let limit = scope.limit.unwrap_or(1);
                let query = ScanQuery::all().order_by(OrderBy::desc("id")).limit(limit);
                Snapshot::Selection {
                    label: format!("newest {limit} jobs"),
                    entity: EntityType::Job,
                    rows: gateway.scan(EntityType::Job, &query).await?,
                    predicate: None,
                }
            }
            Category::ExpiredCache => {
                let query = ScanQuery::filter(Predicate::Not(Box::new(Predicate::is_null("expires_at"))));
                let rows = gateway.scan(EntityType::CacheEntry, &query).await?;
                Snapshot::Expired {
                    entries: decode_rows(EntityType::CacheEntry, &rows)?,
                    now: (self.clock)(),
                }
            }
            Category::UndatedApplications => {
                let query = ScanQuery::filter(Predicate::is_null("applied_at"));
                let rows = gateway.scan(EntityType::Application, &query).await?;
                Snapshot::Undated(decode_rows(EntityType::Application, &rows)?)
            }
            Category::TestData => Snapshot::Selection {
                label: "test sessions".to_string(),
                entity: EntityType::TestSession,
                rows: gateway.scan(EntityType::TestSession, &ScanQuery::all()).await?,
                predicate: None,
            },
        };
        Ok(snapshot)
    }
}

fn classify(request: &ReconcileRequest, snapshot: Snapshot) -> Vec<RepairUnit> {
    let delete = |label: &str, entity: EntityType, ids: Vec<RecordId>| RepairUnit {
        label: label.to_string(),
        entity,
        action: RepairAction::Delete,
        ids: ids.into_iter().collect(),
    };

    match snapshot {
        Snapshot::Duplicates(applications) => {
            let redundant = find_duplicate_groups(&applications)
                .into_iter()
                .flat_map(|group| group.redundant)
                .collect();
            vec![delete("duplicate applications", EntityType::Application, redundant)]
        }
        Snapshot::Orphans { scans, parent_ids } => {
            let empty = HashSet::new();
            scans
                .into_iter()
                .map(|scan| {
                    let parents = parent_ids.get(&scan.relationship.parent).unwrap_or(&empty);
                    delete(
                        &format!("orphaned {}", scan.relationship.label()),
                        scan.relationship.child,
                        find_orphans(&scan.children, parents),
                    )
                })
                .collect()
        }
        Snapshot::Missing { jobs, applications } => {
            let ids = find_missing_counterparts(&jobs, &applications);
            match request.repair {
                CounterpartRepair::Backfill => vec![RepairUnit {
                    label: "jobs without application".to_string(),
                    entity: EntityType::Job,
                    action: RepairAction::Backfill,
                    ids: ids.into_iter().collect(),
                }],
                CounterpartRepair::Purge => {
                    vec![delete("jobs without application", EntityType::Job, ids)]
                }
            }
        }
        Snapshot::InvalidJobs(jobs) => {
            vec![delete("invalid jobs", EntityType::Job, find_invalid_records(&jobs))]
        }
        Snapshot::Selection {
            label,
            entity,
            rows,
            predicate,
        } => {
            let ids = match &predicate {
                Some(predicate) => find_matching(&rows, predicate),
                None => rows.iter().map(|row| row.id).collect(),
            };
            vec![delete(&label, entity, ids)]
        }
        Snapshot::Expired { entries, now } => vec![delete(
            "expired cache entries",
            EntityType::CacheEntry,
            find_expired(&entries, now),
        )],
        Snapshot::Undated(applications) => vec![delete(
            "undated applications",
            EntityType::Application,
            find_undated(&applications),
        )],
    }
}

fn decode_rows<T: DeserializeOwned>(entity: EntityType, rows: &[Record]) -> Result<Vec<T>, StorageError> {
    rows.iter()
        .map(|row| {
            row.decode().map_err(|err| {
                StorageError::new(
                    entity,
                    Operation::Scan,
                    StorageCause::Malformed {
                        id: row.id,
                        message: err.to_string(),
                    },
                )
            })
        })
        .collect()
}

fn transition(audit: &mut AuditReporter, state: PassState) {
    debug!(from = ?audit.state(), to = ?state, "pass state");
    audit.enter(state);
}

fn skip_all(audit: &mut AuditReporter, units: &[RepairUnit], reason: &str) {
    for unit in units {
        audit.skipped(&unit.label, unit.ids.len(), reason);
    }
}

fn pass_span(audit: &AuditReporter, request: &ReconcileRequest) -> Span {
    info_span!(
        "pass",
        pass_id = %audit.pass_id(),
        category = %request.category,
        policy = request.policy.name()
    )
}
