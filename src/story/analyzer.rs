//! Story markdown analysis.
//!
//! Parses the "Tasks" section of a story file into a task list with
//! subtask counts and acceptance-criteria references, then estimates the
//! story's scope and a suggested batch count. Analysis is best-effort by
//! contract: malformed input produces the safe default, never an error.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::batch::TASKS_PER_BATCH;

static TASKS_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{2,3}\s+Tasks\s*$").unwrap());

static NEXT_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,2}\s+").unwrap());

// `- [ ] T3: title` / `- [ ] Task 3: title` / `- [ ] title`
static TASK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^( *)- \[[ xX]\]\s+(.*)$").unwrap());

static TASK_ID_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:T|Task\s+)(\d+)\s*:\s*(.*)$").unwrap());

// `(AC: #1, #3)` list form
static AC_LIST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(AC:([^)]*)\)").unwrap());

// `(AC1)` and standalone inline `AC1`
static AC_INLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bAC(\d+)\b").unwrap());

static AC_PAREN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(AC\d+\)").unwrap());

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Estimated implementation scope of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryScope {
    #[default]
    Small,
    Medium,
    Large,
}

impl StoryScope {
    fn from_task_count(count: usize) -> Self {
        match count {
            0..=5 => Self::Small,
            6..=9 => Self::Medium,
            _ => Self::Large,
        }
    }
}

/// One parsed task line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task id from a `Tn:`/`Task n:` prefix, or the 1-based position for
    /// generic task lines.
    pub id: u32,
    pub title: String,
    pub subtask_count: u32,
    /// Distinct AC numbers referenced on the task line, ascending.
    pub ac_refs: Vec<u32>,
}

/// Result of analyzing one story file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryAnalysis {
    pub ac_count: usize,
    pub tasks: Vec<TaskInfo>,
    pub task_count: usize,
    pub estimated_scope: StoryScope,
    pub suggested_batch_count: usize,
}

impl Default for StoryAnalysis {
    fn default() -> Self {
        Self {
            ac_count: 0,
            tasks: Vec::new(),
            task_count: 0,
            estimated_scope: StoryScope::Small,
            suggested_batch_count: 1,
        }
    }
}

/// Analyze a story markdown document. Returns the safe default on any
/// shape the parser does not recognize; this function does not fail.
pub fn analyze_story(content: &str) -> StoryAnalysis {
    let tasks = parse_tasks(content);
    let task_count = tasks.len();
    let ac_count = count_distinct_acs(content);
    StoryAnalysis {
        ac_count,
        task_count,
        estimated_scope: StoryScope::from_task_count(task_count),
        suggested_batch_count: task_count.div_ceil(TASKS_PER_BATCH).max(1),
        tasks,
    }
}

fn tasks_section(content: &str) -> Option<&str> {
    let heading = TASKS_HEADING.find(content)?;
    let rest = &content[heading.end()..];
    match NEXT_HEADING.find(rest) {
        Some(next) => Some(&rest[..next.start()]),
        None => Some(rest),
    }
}

fn parse_tasks(content: &str) -> Vec<TaskInfo> {
    let Some(section) = tasks_section(content) else {
        return Vec::new();
    };

    let mut tasks: Vec<TaskInfo> = Vec::new();
    for line in section.lines() {
        let Some(caps) = TASK_LINE.captures(line) else {
            continue;
        };
        let indent = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim();

        if indent >= 2 {
            // Indented checkbox: subtask of the current task.
            if let Some(current) = tasks.last_mut() {
                current.subtask_count += 1;
            }
            continue;
        }

        let (id, title) = match TASK_ID_PREFIX.captures(body) {
            Some(idc) => {
                let id = idc
                    .get(1)
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or((tasks.len() + 1) as u32);
                let title = idc.get(2).map(|m| m.as_str()).unwrap_or("").trim();
                (id, title.to_string())
            }
            None => ((tasks.len() + 1) as u32, body.to_string()),
        };

        let ac_refs = ac_refs_of(&title);
        let title = strip_ac_annotations(&title);
        tasks.push(TaskInfo {
            id,
            title,
            subtask_count: 0,
            ac_refs,
        });
    }
    tasks
}

fn ac_refs_of(text: &str) -> Vec<u32> {
    let mut refs = BTreeSet::new();
    for caps in AC_LIST.captures_iter(text) {
        if let Some(list) = caps.get(1) {
            for number in NUMBER.find_iter(list.as_str()) {
                if let Ok(n) = number.as_str().parse() {
                    refs.insert(n);
                }
            }
        }
    }
    for caps in AC_INLINE.captures_iter(text) {
        if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
            refs.insert(n);
        }
    }
    refs.into_iter().collect()
}

fn strip_ac_annotations(title: &str) -> String {
    let no_lists = AC_LIST.replace_all(title, "");
    AC_PAREN.replace_all(&no_lists, "").trim().to_string()
}

fn count_distinct_acs(content: &str) -> usize {
    let mut seen = BTreeSet::new();
    for caps in AC_INLINE.captures_iter(content) {
        if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            seen.insert(n);
        }
    }
    for caps in AC_LIST.captures_iter(content) {
        if let Some(list) = caps.get(1) {
            for number in NUMBER.find_iter(list.as_str()) {
                if let Ok(n) = number.as_str().parse::<u32>() {
                    seen.insert(n);
                }
            }
        }
    }
    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORY: &str = "\
# Story 13-5: Implementation orchestrator

## Acceptance Criteria

- AC1: groups run in parallel
- AC2: pause gates transitions
- AC3: heartbeats are emitted

## Tasks

- [ ] T1: Wire the pause gate (AC: #2)
- [ ] T2: Build the group pool (AC1)
  - [ ] Spawn one task per group
  - [ ] Bound with a semaphore
- [ ] T3: Emit heartbeats AC3
- [ ] T4: Stall detection (AC: #2, #3)
- [ ] T5: Persist snapshots

## Notes

Some trailing section.
";

    #[test]
    fn test_parses_t_prefixed_tasks() {
        let analysis = analyze_story(STORY);
        assert_eq!(analysis.task_count, 5);
        assert_eq!(analysis.tasks[0].id, 1);
        assert_eq!(analysis.tasks[0].title, "Wire the pause gate");
        assert_eq!(analysis.tasks[4].title, "Persist snapshots");
    }

    #[test]
    fn test_subtasks_attach_to_preceding_task() {
        let analysis = analyze_story(STORY);
        assert_eq!(analysis.tasks[1].subtask_count, 2);
        assert_eq!(analysis.tasks[0].subtask_count, 0);
    }

    #[test]
    fn test_ac_refs_from_all_three_forms() {
        let analysis = analyze_story(STORY);
        assert_eq!(analysis.tasks[0].ac_refs, vec![2]); // (AC: #2)
        assert_eq!(analysis.tasks[1].ac_refs, vec![1]); // (AC1)
        assert_eq!(analysis.tasks[2].ac_refs, vec![3]); // inline AC3
        assert_eq!(analysis.tasks[3].ac_refs, vec![2, 3]); // (AC: #2, #3)
    }

    #[test]
    fn test_ac_count_is_distinct_across_story() {
        let analysis = analyze_story(STORY);
        assert_eq!(analysis.ac_count, 3);
    }

    #[test]
    fn test_scope_thresholds() {
        let tasks = |n: usize| {
            let body: String = (1..=n).map(|i| format!("- [ ] T{i}: task\n")).collect();
            format!("## Tasks\n\n{body}")
        };
        assert_eq!(analyze_story(&tasks(0)).estimated_scope, StoryScope::Small);
        assert_eq!(analyze_story(&tasks(5)).estimated_scope, StoryScope::Small);
        assert_eq!(analyze_story(&tasks(6)).estimated_scope, StoryScope::Medium);
        assert_eq!(analyze_story(&tasks(9)).estimated_scope, StoryScope::Medium);
        assert_eq!(analyze_story(&tasks(10)).estimated_scope, StoryScope::Large);
    }

    #[test]
    fn test_suggested_batch_count() {
        let tasks = |n: usize| {
            let body: String = (1..=n).map(|i| format!("- [ ] T{i}: task\n")).collect();
            format!("## Tasks\n\n{body}")
        };
        assert_eq!(analyze_story(&tasks(3)).suggested_batch_count, 1);
        assert_eq!(analyze_story(&tasks(5)).suggested_batch_count, 1);
        assert_eq!(analyze_story(&tasks(6)).suggested_batch_count, 2);
        assert_eq!(analyze_story(&tasks(10)).suggested_batch_count, 2);
        assert_eq!(analyze_story(&tasks(11)).suggested_batch_count, 3);
    }

    #[test]
    fn test_task_n_form_and_generic_lines() {
        let story = "\
## Tasks

- [ ] Task 7: Named with the long form
- [ ] A generic task with no id
";
        let analysis = analyze_story(story);
        assert_eq!(analysis.tasks[0].id, 7);
        assert_eq!(analysis.tasks[0].title, "Named with the long form");
        assert_eq!(analysis.tasks[1].id, 2);
        assert_eq!(analysis.tasks[1].title, "A generic task with no id");
    }

    #[test]
    fn test_section_bounded_by_next_heading() {
        let story = "\
## Tasks

- [ ] T1: inside

## Dev Notes

- [ ] not a task, different section
";
        let analysis = analyze_story(story);
        assert_eq!(analysis.task_count, 1);
    }

    #[test]
    fn test_h3_tasks_heading_accepted() {
        let story = "### Tasks\n\n- [ ] T1: via h3\n";
        assert_eq!(analyze_story(story).task_count, 1);
    }

    #[test]
    fn test_malformed_input_returns_safe_default() {
        for content in ["", "no tasks heading here", "## Tasks", "\u{0}\u{1}garbage"] {
            let analysis = analyze_story(content);
            assert_eq!(analysis, StoryAnalysis::default(), "input: {content:?}");
        }
    }

    #[test]
    fn test_checked_boxes_still_count() {
        let story = "## Tasks\n\n- [x] T1: already done\n- [ ] T2: pending\n";
        assert_eq!(analyze_story(story).task_count, 2);
    }
}
