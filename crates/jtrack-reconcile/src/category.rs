//! Named reconciliation categories, scope filters, repair policies and the alias registry.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Several applications share a job.
    Duplicates,
    /// Rows whose foreign key points at nothing, for every declared relationship.
    Orphans,
    /// Jobs without an application.
    Missing,
    InvalidJobs,
    PurgeSource,
    PurgeRecent,
    ExpiredCache,
    UndatedApplications,
    TestData,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Duplicates,
        Category::Orphans,
        Category::Missing,
        Category::InvalidJobs,
        Category::PurgeSource,
        Category::PurgeRecent,
        Category::ExpiredCache,
        Category::UndatedApplications,
        Category::TestData,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Duplicates => "duplicates",
            Category::Orphans => "orphans",
            Category::Missing => "missing",
            Category::InvalidJobs => "invalid-jobs",
            Category::PurgeSource => "purge-source",
            Category::PurgeRecent => "purge-recent",
            Category::ExpiredCache => "expired-cache",
            Category::UndatedApplications => "undated-applications",
            Category::TestData => "test-data",
        }
    }

    fn accepts_source(self) -> bool {
        self == Category::PurgeSource
    }

    fn accepts_limit(self) -> bool {
        matches!(self, Category::PurgeRecent | Category::Missing)
    }

    /// Checks a scope filter against what this category understands.
    pub fn validate(self, scope: &ScopeFilter) -> Result<(), ConfigError> {
        let category = self.name().to_string();
        match &scope.source {
            Some(_) if !self.accepts_source() => {
                return Err(ConfigError::UnsupportedScope {
                    category,
                    field: "source",
                })
            }
            Some(source) if source.trim().is_empty() => {
                return Err(ConfigError::MissingScope {
                    category,
                    field: "source",
                })
            }
            None if self.accepts_source() => {
                return Err(ConfigError::MissingScope {
                    category,
                    field: "source",
                })
            }
            _ => {}
        }
        match scope.limit {
            Some(_) if !self.accepts_limit() => Err(ConfigError::UnsupportedScope {
                category,
                field: "limit",
            }),
            Some(0) => Err(ConfigError::ZeroLimit),
            None if self == Category::PurgeRecent => Err(ConfigError::MissingScope {
                category,
                field: "limit",
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.name() == s.trim())
            .ok_or_else(|| ConfigError::UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ScopeFilter {
    /// Fields set in `other` win.
    pub fn overlay(&self, other: &ScopeFilter) -> ScopeFilter {
        ScopeFilter {
            source: other.source.clone().or_else(|| self.source.clone()),
            limit: other.limit.or(self.limit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RepairPolicy {
    DryRun,
    AutoRepair,
    /// Repairs only when the planned mutation count is at most `max`.
    ConfirmAboveThreshold { max: usize },
}

impl RepairPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            RepairPolicy::DryRun => "dry-run",
            RepairPolicy::AutoRepair => "auto-repair",
            RepairPolicy::ConfirmAboveThreshold { .. } => "confirm-above-threshold",
        }
    }

    /// The more cautious of two policies. A dry run beats any threshold and the smaller
    /// threshold beats the larger one.
    pub fn stricter(self, other: RepairPolicy) -> RepairPolicy {
        use RepairPolicy::*;
        match (self, other) {
            (DryRun, _) | (_, DryRun) => DryRun,
            (ConfirmAboveThreshold { max: a }, ConfirmAboveThreshold { max: b }) => {
                ConfirmAboveThreshold { max: a.min(b) }
            }
            (ConfirmAboveThreshold { max }, AutoRepair) | (AutoRepair, ConfirmAboveThreshold { max }) => {
                ConfirmAboveThreshold { max }
            }
            (AutoRepair, AutoRepair) => AutoRepair,
        }
    }
}

/// Timestamp given to backfilled applications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillTimestamp {
    #[default]
    Now,
    Null,
}

impl FromStr for BackfillTimestamp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "now" => Ok(BackfillTimestamp::Now),
            "null" | "none" => Ok(BackfillTimestamp::Null),
            other => Err(ConfigError::InvalidValue {
                key: "backfill timestamp".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// What to do with a job that has no application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterpartRepair {
    #[default]
    Backfill,
    Purge,
}

impl FromStr for CounterpartRepair {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backfill" => Ok(CounterpartRepair::Backfill),
            "purge" => Ok(CounterpartRepair::Purge),
            other => Err(ConfigError::InvalidValue {
                key: "repair".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub category: Category,
    #[serde(default)]
    pub scope: ScopeFilter,
    pub policy: RepairPolicy,
    #[serde(default)]
    pub repair: CounterpartRepair,
}

impl ReconcileRequest {
    pub fn new(category: Category, policy: RepairPolicy) -> Self {
        Self {
            category,
            scope: ScopeFilter::default(),
            policy,
            repair: CounterpartRepair::default(),
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.scope.source = Some(source.to_string());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.scope.limit = Some(limit);
        self
    }

    pub fn with_repair(mut self, repair: CounterpartRepair) -> Self {
        self.repair = repair;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.category.validate(&self.scope)?;
        if self.repair == CounterpartRepair::Purge && self.category != Category::Missing {
            return Err(ConfigError::UnsupportedScope {
                category: self.category.name().to_string(),
                field: "repair",
            });
        }
        Ok(())
    }
}

/// A named, pre-configured instance of a built-in category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryAlias {
    pub category: Category,
    #[serde(default)]
    pub scope: ScopeFilter,
    #[serde(default)]
    pub policy: Option<RepairPolicy>,
    #[serde(default)]
    pub repair: Option<CounterpartRepair>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRegistry {
    #[serde(default)]
    pub aliases: BTreeMap<String, CategoryAlias>,
}

impl CategoryRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let registry: CategoryRegistry =
            serde_yaml::from_str(text).map_err(|err| ConfigError::CategoryFile(err.to_string()))?;
        for (name, alias) in &registry.aliases {
            if Category::from_str(name).is_ok() {
                return Err(ConfigError::CategoryFile(format!(
                    "alias `{name}` shadows a built-in category"
                )));
            }
            alias.category.validate(&alias.scope).map_err(|err| {
                ConfigError::CategoryFile(format!("alias `{name}`: {err}"))
            })?;
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Every invocable name: built-ins first, then aliases.
    pub fn names(&self) -> Vec<String> {
        Category::ALL
            .iter()
            .map(|c| c.name().to_string())
            .chain(self.aliases.keys().cloned())
            .collect()
    }

    /// Builds a validated request. Flags in `scope` override an alias's own scope. An alias
    /// policy only ever tightens `policy`, see [`RepairPolicy::stricter`].
    pub fn resolve(
        &self,
        name: &str,
        scope: &ScopeFilter,
        policy: RepairPolicy,
        repair: Option<CounterpartRepair>,
    ) -> Result<ReconcileRequest, ConfigError> {
        let request = match (Category::from_str(name), self.aliases.get(name.trim())) {
            (Ok(category), _) => ReconcileRequest {
                category,
                scope: scope.clone(),
                policy,
                repair: repair.unwrap_or_default(),
            },
            (Err(_), Some(alias)) => ReconcileRequest {
                category: alias.category,
                scope: alias.scope.overlay(scope),
                policy: alias
                    .policy
                    .map_or(policy, |configured| policy.stricter(configured)),
                repair: repair.or(alias.repair).unwrap_or_default(),
            },
            (Err(err), None) => return Err(err),
        };
        request.validate()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIASES: &str = r#"
aliases:
  bulk-imports:
    category: purge-source
    scope:
      source: manual-bulk
    policy:
      mode: confirm-above-threshold
      max: 50
    description: Jobs pasted through the bulk import form
  recent-unmatched:
    category: missing
    scope:
      limit: 10
    repair: purge
"#;

    #[test]
    fn scope_filters_are_checked_per_category() {
        assert!(Category::PurgeSource.validate(&ScopeFilter::default()).is_err());
        assert_eq!(
            Category::PurgeRecent.validate(&ScopeFilter {
                limit: Some(0),
                ..Default::default()
            }),
            Err(ConfigError::ZeroLimit)
        );
        assert!(matches!(
            Category::Duplicates.validate(&ScopeFilter {
                source: Some("manual-bulk".into()),
                ..Default::default()
            }),
            Err(ConfigError::UnsupportedScope { field: "source", .. })
        ));
        assert!(Category::PurgeSource
            .validate(&ScopeFilter {
                source: Some("   ".into()),
                ..Default::default()
            })
            .is_err());
        assert!(Category::Missing
            .validate(&ScopeFilter {
                limit: Some(10),
                ..Default::default()
            })
            .is_ok());
    }

    #[test]
    fn category_names_parse_back() {
        for category in Category::ALL {
            assert_eq!(category.name().parse::<Category>(), Ok(category));
        }
        assert_eq!(
            "cleanup".parse::<Category>(),
            Err(ConfigError::UnknownCategory("cleanup".into()))
        );
    }

    #[test]
    fn aliases_resolve_with_overrides() {
        let registry = CategoryRegistry::from_yaml_str(ALIASES).expect("registry");
        let request = registry
            .resolve("bulk-imports", &ScopeFilter::default(), RepairPolicy::AutoRepair, None)
            .expect("resolve");
        assert_eq!(request.category, Category::PurgeSource);
        assert_eq!(request.scope.source.as_deref(), Some("manual-bulk"));
        assert_eq!(request.policy, RepairPolicy::ConfirmAboveThreshold { max: 50 });

        let dry = registry
            .resolve("bulk-imports", &ScopeFilter::default(), RepairPolicy::DryRun, None)
            .expect("resolve");
        assert_eq!(dry.policy, RepairPolicy::DryRun);

        let narrowed = registry
            .resolve(
                "recent-unmatched",
                &ScopeFilter {
                    limit: Some(3),
                    ..Default::default()
                },
                RepairPolicy::AutoRepair,
                None,
            )
            .expect("resolve");
        assert_eq!(narrowed.scope.limit, Some(3));
        assert_eq!(narrowed.repair, CounterpartRepair::Purge);
        assert_eq!(registry.names().len(), Category::ALL.len() + 2);
    }

    #[test]
    fn alias_policies_never_loosen_the_callers_guard() {
        let registry = CategoryRegistry::from_yaml_str(
            "aliases:\n  nuke-bulk:\n    category: purge-source\n    scope:\n      source: manual-bulk\n    policy:\n      mode: auto-repair\n",
        )
        .expect("registry");
        let resolve = |policy| {
            registry
                .resolve("nuke-bulk", &ScopeFilter::default(), policy, None)
                .expect("resolve")
                .policy
        };
        let guarded = RepairPolicy::ConfirmAboveThreshold { max: 5 };
        assert_eq!(resolve(guarded), guarded);
        assert_eq!(resolve(RepairPolicy::AutoRepair), RepairPolicy::AutoRepair);

        let strict = CategoryRegistry::from_yaml_str(ALIASES).expect("registry");
        let tighter = strict
            .resolve(
                "bulk-imports",
                &ScopeFilter::default(),
                RepairPolicy::ConfirmAboveThreshold { max: 10 },
                None,
            )
            .expect("resolve");
        assert_eq!(tighter.policy, RepairPolicy::ConfirmAboveThreshold { max: 10 });
    }

    #[test]
    fn stricter_policy_prefers_dry_run_then_smaller_threshold() {
        use RepairPolicy::*;
        let five = ConfirmAboveThreshold { max: 5 };
        let nine = ConfirmAboveThreshold { max: 9 };
        assert_eq!(AutoRepair.stricter(DryRun), DryRun);
        assert_eq!(five.stricter(DryRun), DryRun);
        assert_eq!(nine.stricter(five), five);
        assert_eq!(AutoRepair.stricter(nine), nine);
        assert_eq!(nine.stricter(AutoRepair), nine);
        assert_eq!(AutoRepair.stricter(AutoRepair), AutoRepair);
    }

    #[test]
    fn invalid_alias_files_are_rejected() {
        let shadowing = "aliases:\n  orphans:\n    category: duplicates\n";
        assert!(matches!(
            CategoryRegistry::from_yaml_str(shadowing),
            Err(ConfigError::CategoryFile(_))
        ));
        let unscoped = "aliases:\n  purge-it:\n    category: purge-source\n";
        assert!(CategoryRegistry::from_yaml_str(unscoped).is_err());
        assert!(matches!(
            CategoryRegistry::default().resolve(
                "nope",
                &ScopeFilter::default(),
                RepairPolicy::DryRun,
                None
            ),
            Err(ConfigError::UnknownCategory(_))
        ));
    }

    #[test]
    fn purge_repair_only_applies_to_missing() {
        let request = ReconcileRequest::new(Category::Orphans, RepairPolicy::AutoRepair)
            .with_repair(CounterpartRepair::Purge);
        assert!(request.validate().is_err());
        assert_eq!("NULL".parse::<BackfillTimestamp>(), Ok(BackfillTimestamp::Null));
    }
}
