//! Pattern rules: configuration, seeding into the Registry, and compiled
//! glob matching.
//!
//! Rules are declared in the engine TOML under `[rules.<name>]` and synced
//! into the Registry's versioned rule table. The dispatcher only ever reads
//! the Registry's active versions, so a record's classification event always
//! points at the exact rule row that produced it.

use crate::db::{FileRecord, NewRule, RuleKind, RuleStore, StoredRule};
use crate::error::{Result, StowageError};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pattern rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Glob matched against the file name and the full original path
    pub pattern: String,
    pub category: String,
    /// Higher is evaluated first
    #[serde(default = "default_priority")]
    pub rule_priority: i32,
}

fn default_priority() -> i32 {
    50
}

/// Brings the Registry's rule table in line with configuration.
///
/// A configured rule whose latest stored version differs gets a new version;
/// an active pattern rule missing from configuration gets an inactive one.
/// Unchanged rules are left alone, so seeding on every run is a no-op once
/// the table is current. Returns the number of versions written.
pub fn seed_rules<S: RuleStore + ?Sized>(
    store: &mut S,
    rules: &BTreeMap<String, RuleConfig>,
) -> Result<usize> {
    let active: BTreeMap<String, StoredRule> = store
        .active_rules()?
        .into_iter()
        .map(|rule| (rule.name.clone(), rule))
        .collect();

    let mut written = 0;
    for (name, rule) in rules {
        compile_glob(&rule.pattern)?;

        let current = active.get(name);
        let unchanged = current.is_some_and(|stored| {
            stored.kind == RuleKind::Pattern
                && stored.pattern.as_deref() == Some(rule.pattern.as_str())
                && stored.category.as_deref() == Some(rule.category.as_str())
                && stored.priority == rule.rule_priority
        });
        if unchanged {
            continue;
        }

        store.add_rule(&NewRule {
            name: name.clone(),
            kind: RuleKind::Pattern,
            category: Some(rule.category.clone()),
            priority: rule.rule_priority,
            pattern: Some(rule.pattern.clone()),
        })?;
        written += 1;
    }

    for (name, stored) in &active {
        if stored.kind == RuleKind::Pattern && !rules.contains_key(name) {
            store.retire_rule(name)?;
            log::info!("Retired rule '{}': no longer configured", name);
            written += 1;
        }
    }

    if written > 0 {
        log::info!("Seeded {} rule version(s) from configuration", written);
    }
    Ok(written)
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .map_err(|e| StowageError::Config(format!("Invalid glob pattern '{}': {}", pattern, e)))?;
    Ok(glob.compile_matcher())
}

/// An active pattern rule compiled for matching.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub rule: StoredRule,
    pub category: String,
    matcher: GlobMatcher,
}

impl PatternRule {
    pub fn compile(rule: StoredRule) -> Result<Self> {
        let pattern = rule.pattern.as_deref().ok_or_else(|| {
            StowageError::Config(format!("Pattern rule '{}' has no pattern", rule.name))
        })?;
        let category = rule.category.clone().ok_or_else(|| {
            StowageError::Config(format!("Pattern rule '{}' has no category", rule.name))
        })?;
        let matcher = compile_glob(pattern)?;

        Ok(Self {
            rule,
            category,
            matcher,
        })
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        let name = record.file_name();
        self.matcher.is_match(&name) || self.matcher.is_match(&record.original_path)
    }
}

/// Compiles every active pattern rule, highest priority first. A rule that
/// fails to compile is skipped with a warning rather than disabling
/// classification.
pub fn compile_active_rules(rules: Vec<StoredRule>) -> Vec<PatternRule> {
    let mut compiled: Vec<PatternRule> = rules
        .into_iter()
        .filter(|rule| rule.kind == RuleKind::Pattern)
        .filter_map(|rule| {
            let name = rule.name.clone();
            match PatternRule::compile(rule) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    log::warn!("Skipping rule '{}': {}", name, e);
                    None
                }
            }
        })
        .collect();
    compiled.sort_by(|a, b| {
        b.rule
            .priority
            .cmp(&a.rule.priority)
            .then_with(|| a.rule.name.cmp(&b.rule.name))
    });
    compiled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewFile, Registry, SqliteRegistry};

    fn create_test_registry() -> SqliteRegistry {
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        registry
    }

    fn rules_from_toml(toml_str: &str) -> BTreeMap<String, RuleConfig> {
        #[derive(Deserialize)]
        struct Wrapper {
            rules: BTreeMap<String, RuleConfig>,
        }
        toml::from_str::<Wrapper>(toml_str).unwrap().rules
    }

    #[test]
    fn test_seed_rules_is_idempotent() {
        let mut registry = create_test_registry();
        let rules = rules_from_toml(
            r#"
            [rules.invoices]
            pattern = "*invoice*"
            category = "invoice"
            rule_priority = 90

            [rules.photos]
            pattern = "*.{jpg,jpeg,heic}"
            category = "photo"
            "#,
        );

        assert_eq!(seed_rules(&mut registry, &rules).unwrap(), 2);
        assert_eq!(seed_rules(&mut registry, &rules).unwrap(), 0);

        let mut changed = rules.clone();
        changed.get_mut("photos").unwrap().rule_priority = 70;
        assert_eq!(seed_rules(&mut registry, &changed).unwrap(), 1);

        let active = registry.active_rules().unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].name, "invoices");
        assert_eq!(active[1].version, 2);
    }

    #[test]
    fn test_rule_removed_from_config_is_retired() {
        let mut registry = create_test_registry();
        let rules = rules_from_toml(
            r#"
            [rules.invoices]
            pattern = "*invoice*"
            category = "invoice"

            [rules.photos]
            pattern = "*.jpg"
            category = "photo"
            "#,
        );
        seed_rules(&mut registry, &rules).unwrap();
        registry
            .add_rule(&NewRule {
                name: "model".to_string(),
                kind: RuleKind::Model,
                category: None,
                priority: 0,
                pattern: None,
            })
            .unwrap();

        let mut trimmed = rules.clone();
        trimmed.remove("photos");
        assert_eq!(seed_rules(&mut registry, &trimmed).unwrap(), 1);
        assert_eq!(seed_rules(&mut registry, &trimmed).unwrap(), 0);

        let names: Vec<String> = registry
            .active_rules()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"invoices".to_string()));
        assert!(names.contains(&"model".to_string()));

        let photo = registry.register_file(&NewFile::new("/drop/cat.jpg", 1, 1)).unwrap();
        let compiled = compile_active_rules(registry.active_rules().unwrap());
        assert!(compiled.iter().all(|rule| !rule.matches(&photo)));
    }

    #[test]
    fn test_seed_rejects_invalid_glob() {
        let mut registry = create_test_registry();
        let rules = rules_from_toml(
            r#"
            [rules.broken]
            pattern = "[unclosed"
            category = "x"
            "#,
        );
        assert!(seed_rules(&mut registry, &rules).is_err());
        assert!(registry.active_rules().unwrap().is_empty());
    }

    #[test]
    fn test_pattern_matches_name_and_path_case_insensitively() {
        let mut registry = create_test_registry();
        let rules = rules_from_toml(
            r#"
            [rules.invoices]
            pattern = "*invoice*"
            category = "invoice"

            [rules.tax]
            pattern = "**/taxes/**"
            category = "tax"
            "#,
        );
        seed_rules(&mut registry, &rules).unwrap();
        let compiled = compile_active_rules(registry.active_rules().unwrap());
        assert_eq!(compiled.len(), 2);

        let invoice = registry
            .register_file(&NewFile::new("/drop/ACME-Invoice-0042.PDF", 10, 1))
            .unwrap();
        let tax = registry
            .register_file(&NewFile::new("/drop/taxes/2023/w2.pdf", 10, 1))
            .unwrap();
        let other = registry
            .register_file(&NewFile::new("/drop/holiday.jpg", 10, 1))
            .unwrap();

        let matched = |record: &FileRecord| {
            compiled
                .iter()
                .find(|rule| rule.matches(record))
                .map(|rule| rule.category.clone())
        };
        assert_eq!(matched(&invoice).as_deref(), Some("invoice"));
        assert_eq!(matched(&tax).as_deref(), Some("tax"));
        assert_eq!(matched(&other), None);
    }
}
