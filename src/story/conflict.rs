//! Conflict-group partitioning.
//!
//! Stories that touch the same module must not run concurrently. Each
//! story key is matched against an ordered prefix table (most specific
//! first); keys sharing a module form one group, processed serially in
//! input order. Keys with no matching prefix are isolated singletons.
//! Groups are the unit of parallelism for the orchestrator pool.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::epic_of;

/// One prefix → module rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRule {
    pub prefix: String,
    pub module: String,
}

/// The ordered rule table.
#[derive(Debug, Clone, Default)]
pub struct ConflictRules {
    rules: Vec<ConflictRule>,
}

/// A maximal set of story keys sharing a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictGroup {
    /// Module name for rule-matched groups; singleton groups carry the
    /// story key itself.
    pub module: String,
    pub keys: Vec<String>,
}

impl ConflictRules {
    /// Build a table from explicit rules, reordered most-specific-first.
    pub fn new(mut rules: Vec<ConflictRule>) -> Self {
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { rules }
    }

    /// Load rules from a `conflict-groups.json` file:
    /// `[{"prefix": "10-1", "module": "compiled-workflows"}, ...]`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read conflict rules at {}", path.display()))?;
        let rules: Vec<ConflictRule> =
            serde_json::from_str(&content).context("Failed to parse conflict rules JSON")?;
        Ok(Self::new(rules))
    }

    /// Default policy when no rule file exists: one rule per epic, so
    /// stories within an epic serialize and epics parallelize.
    pub fn by_epic(keys: &[String]) -> Self {
        let mut rules = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for key in keys {
            if let Some(epic) = epic_of(key) {
                if seen.insert(epic.to_string()) {
                    rules.push(ConflictRule {
                        prefix: format!("{epic}-"),
                        module: format!("epic-{epic}"),
                    });
                }
            }
        }
        Self::new(rules)
    }

    fn module_for(&self, key: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| key.starts_with(rule.prefix.as_str()))
            .map(|rule| rule.module.as_str())
    }

    /// Partition story keys into conflict groups. Group order follows the
    /// first appearance of each module in the input; key order within a
    /// group follows the input.
    pub fn partition(&self, keys: &[String]) -> Vec<ConflictGroup> {
        let mut groups: Vec<ConflictGroup> = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();

        for key in keys {
            match self.module_for(key) {
                Some(module) => {
                    if let Some(&i) = index_of.get(module) {
                        groups[i].keys.push(key.clone());
                    } else {
                        index_of.insert(module.to_string(), groups.len());
                        groups.push(ConflictGroup {
                            module: module.to_string(),
                            keys: vec![key.clone()],
                        });
                    }
                }
                None => {
                    // Unknown prefix: isolated singleton.
                    groups.push(ConflictGroup {
                        module: key.clone(),
                        keys: vec![key.clone()],
                    });
                }
            }
        }
        groups
    }
}
