use std::path::PathBuf;

use crate::category::{BackfillTimestamp, RepairPolicy};
use crate::error::ConfigError;

pub const DEFAULT_PREVIEW_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub database_url: Option<String>,
    pub reports_dir: PathBuf,
    /// Mutation ceiling applied when no explicit policy is requested.
    pub max_mutations: Option<usize>,
    pub preview_limit: usize,
    pub backfill_timestamp: BackfillTimestamp,
    pub categories_file: Option<PathBuf>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            reports_dir: PathBuf::from("./reports"),
            max_mutations: None,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            backfill_timestamp: BackfillTimestamp::Now,
            categories_file: None,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Ok(Self {
            database_url: get("DATABASE_URL"),
            reports_dir: get("JTRACK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            max_mutations: get("JTRACK_MAX_MUTATIONS")
                .map(|v| parse_count("JTRACK_MAX_MUTATIONS", &v))
                .transpose()?,
            preview_limit: get("JTRACK_PREVIEW_LIMIT")
                .map(|v| parse_count("JTRACK_PREVIEW_LIMIT", &v))
                .transpose()?
                .unwrap_or(defaults.preview_limit),
            backfill_timestamp: get("JTRACK_BACKFILL_TIMESTAMP")
                .map(|v| v.parse::<BackfillTimestamp>())
                .transpose()?
                .unwrap_or_default(),
            categories_file: get("JTRACK_CATEGORIES_FILE").map(PathBuf::from),
        })
    }

    /// Policy for a pass whose caller gave neither `--dry-run` nor `--max`.
    pub fn default_policy(&self) -> RepairPolicy {
        match self.max_mutations {
            Some(max) => RepairPolicy::ConfirmAboveThreshold { max },
            None => RepairPolicy::AutoRepair,
        }
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ReconcileConfig::from_lookup(lookup(&[("JTRACK_MAX_MUTATIONS", "")]))
            .expect("config");
        assert_eq!(config, ReconcileConfig::default());
        assert_eq!(config.default_policy(), RepairPolicy::AutoRepair);
    }

    #[test]
    fn env_values_are_parsed() {
        let config = ReconcileConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/jobs"),
            ("JTRACK_REPORTS_DIR", "/tmp/audits"),
            ("JTRACK_MAX_MUTATIONS", "25"),
            ("JTRACK_PREVIEW_LIMIT", "5"),
            ("JTRACK_BACKFILL_TIMESTAMP", "null"),
        ]))
        .expect("config");
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(config.reports_dir, PathBuf::from("/tmp/audits"));
        assert_eq!(config.preview_limit, 5);
        assert_eq!(config.backfill_timestamp, BackfillTimestamp::Null);
        assert_eq!(
            config.default_policy(),
            RepairPolicy::ConfirmAboveThreshold { max: 25 }
        );
    }

    #[test]
    fn malformed_numbers_fail_fast() {
        let err = ReconcileConfig::from_lookup(lookup(&[("JTRACK_PREVIEW_LIMIT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
