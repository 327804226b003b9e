//! Story-level building blocks for the implementation phase: markdown
//! analysis, task batching and conflict-group partitioning.

pub mod analyzer;
pub mod batch;
pub mod conflict;

pub use analyzer::{StoryAnalysis, StoryScope, TaskInfo, analyze_story};
pub use batch::{TASKS_PER_BATCH, TaskBatch, plan_task_batches};
pub use conflict::{ConflictGroup, ConflictRules};

use std::sync::LazyLock;

use regex::Regex;

static STORY_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+-\d+(-[A-Za-z0-9][A-Za-z0-9-]*)?$").unwrap());

/// Check a `<epic>-<story>[-suffix]` key such as `10-2` or `10-4-impl-orch`.
pub fn is_valid_story_key(key: &str) -> bool {
    STORY_KEY_REGEX.is_match(key)
}

/// The `<epic>` portion of a story key, when the key is well-formed.
pub fn epic_of(key: &str) -> Option<&str> {
    if !is_valid_story_key(key) {
        return None;
    }
    key.split('-').next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_story_keys() {
        assert!(is_valid_story_key("5-1"));
        assert!(is_valid_story_key("10-4-impl-orch"));
        assert!(is_valid_story_key("13-5"));
    }

    #[test]
    fn test_invalid_story_keys() {
        assert!(!is_valid_story_key(""));
        assert!(!is_valid_story_key("5"));
        assert!(!is_valid_story_key("-1"));
        assert!(!is_valid_story_key("a-b"));
        assert!(!is_valid_story_key("5-1-"));
    }

    #[test]
    fn test_epic_extraction() {
        assert_eq!(epic_of("10-4-impl-orch"), Some("10"));
        assert_eq!(epic_of("bogus"), None);
    }
}
