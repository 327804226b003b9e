//! The code-review compiled workflow.
//!
//! Captures review context under a hard diff budget, dispatches the
//! reviewer, then overrides the agent's verdict deterministically from the
//! issue severities. The agent's own verdict survives only as
//! `agent_verdict` for logging.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{StepResult, WorkflowDeps};
use crate::dispatch::schema::{as_u64, code_review_schema, field, str_field};
use crate::dispatch::{DispatchRequest, DispatchStatus, TokenEstimate};
use crate::gitops::GitWorkspace;
use crate::pack::TEMPLATE_CODE_REVIEW;
use crate::prompt::{Section, assemble_prompt};
use crate::util::estimate_tokens;

/// Hard ceiling for the diff section of a review prompt.
const DIFF_TOKEN_CEILING: usize = 100_000;
const REVIEW_PROMPT_TOKENS: usize = 160_000;
const CODE_REVIEW_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Severity of one review issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Blocker,
    Major,
    Minor,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocker => "blocker",
            Self::Major => "major",
            Self::Minor => "minor",
        }
    }

    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "blocker" => Self::Blocker,
            "major" => Self::Major,
            _ => Self::Minor,
        }
    }
}

/// One issue reported by the reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// Pipeline-computed review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewVerdict {
    #[serde(rename = "SHIP_IT")]
    ShipIt,
    #[serde(rename = "NEEDS_MINOR_FIXES")]
    NeedsMinorFixes,
    #[serde(rename = "NEEDS_MAJOR_REWORK")]
    NeedsMajorRework,
}

impl ReviewVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShipIt => "SHIP_IT",
            Self::NeedsMinorFixes => "NEEDS_MINOR_FIXES",
            Self::NeedsMajorRework => "NEEDS_MAJOR_REWORK",
        }
    }

    /// The verdict law: any blocker forces a rework, any issue at all
    /// forces fixes, a clean list ships.
    pub fn from_issues(issues: &[ReviewIssue]) -> Self {
        if issues.iter().any(|i| i.severity == IssueSeverity::Blocker) {
            Self::NeedsMajorRework
        } else if !issues.is_empty() {
            Self::NeedsMinorFixes
        } else {
            Self::ShipIt
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeReviewInput {
    pub story_key: String,
    pub story_file_path: PathBuf,
    pub pipeline_run_id: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub files_modified: Option<Vec<String>>,
    /// Findings from the previous review cycle, for re-verification.
    pub previous_issues: Option<Vec<ReviewIssue>>,
}

#[derive(Debug, Clone)]
pub struct CodeReviewReport {
    pub result: StepResult,
    pub verdict: ReviewVerdict,
    /// What the agent claimed, kept for logging only.
    pub agent_verdict: Option<String>,
    pub issues: usize,
    pub issue_list: Vec<ReviewIssue>,
    pub notes: Option<String>,
    pub error: Option<String>,
    pub token_usage: TokenEstimate,
}

/// Diff capture under the ceiling.
///
/// Tier 1: a diff scoped to `files_modified` when that fits. Tier 2: with
/// no file list, the full-repo diff when that fits. Tier 3: the stat-only
/// summary.
fn capture_diff(workdir: &std::path::Path, files: Option<&Vec<String>>) -> String {
    let ws = match GitWorkspace::open(workdir) {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "review without git context");
            return "(no git repository; diff unavailable)".to_string();
        }
    };

    let scoped = match files {
        Some(files) if !files.is_empty() => ws.diff_text(Some(files.as_slice())),
        _ => ws.diff_text(None),
    };
    match scoped {
        Ok(diff) if estimate_tokens(&diff) <= DIFF_TOKEN_CEILING => diff,
        Ok(_) | Err(_) => match ws.diff_stat() {
            Ok(stat) => format!("(diff too large; file summary only)\n{stat}"),
            Err(e) => {
                warn!(error = %e, "diff stat failed");
                "(diff unavailable)".to_string()
            }
        },
    }
}

fn arch_constraints(deps: &WorkflowDeps, run_id: Option<&str>) -> String {
    let Some(run_id) = run_id else {
        return String::new();
    };
    let decisions = deps
        .db
        .get_active_decisions(run_id, Some("solutioning"))
        .unwrap_or_default();
    decisions
        .into_iter()
        .filter(|d| d.category == "architecture")
        .map(|d| format!("- {}: {}", d.key, d.value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn previous_findings_section(previous: &[ReviewIssue]) -> String {
    let mut section = String::from(
        "\n## PREVIOUS FINDINGS\nVerify each finding below. Report only findings that are still present or newly introduced:\n",
    );
    for issue in previous {
        let location = issue
            .file
            .as_ref()
            .map(|f| match issue.line {
                Some(line) => format!(" ({f}:{line})"),
                None => format!(" ({f})"),
            })
            .unwrap_or_default();
        section.push_str(&format!(
            "- [{}] {}{}\n",
            issue.severity.as_str(),
            issue.description,
            location
        ));
    }
    section
}

fn parse_issue(value: &serde_yaml::Value) -> Option<ReviewIssue> {
    let description = str_field(value, "description")?;
    let severity = str_field(value, "severity")
        .map(|s| IssueSeverity::parse(&s))
        .unwrap_or(IssueSeverity::Minor);
    Some(ReviewIssue {
        severity,
        description,
        file: str_field(value, "file"),
        line: field(value, "line").and_then(as_u64),
    })
}

pub async fn run_code_review(
    deps: &WorkflowDeps,
    input: CodeReviewInput,
) -> Result<CodeReviewReport> {
    let story_content = std::fs::read_to_string(&input.story_file_path).unwrap_or_else(|e| {
        warn!(story = %input.story_key, error = %e, "story file unreadable for review");
        format!("(story file unreadable: {})", input.story_file_path.display())
    });

    let workdir = input
        .working_directory
        .clone()
        .unwrap_or_else(|| deps.project_root.clone());
    let diff = capture_diff(&workdir, input.files_modified.as_ref());
    let previous = input
        .previous_issues
        .as_ref()
        .map(|issues| previous_findings_section(issues))
        .unwrap_or_default();

    let template = deps.pack.template(TEMPLATE_CODE_REVIEW)?;
    let assembled = assemble_prompt(
        &template,
        &[
            Section::required("story_content", story_content),
            Section::required("git_diff", diff),
            Section::required("previous_findings", previous),
            Section::optional(
                "arch_constraints",
                arch_constraints(deps, input.pipeline_run_id.as_deref()),
            ),
        ],
        REVIEW_PROMPT_TOKENS,
    );

    let result = deps
        .dispatcher
        .dispatch(DispatchRequest {
            prompt: assembled.prompt,
            agent: "code-review".into(),
            task_type: format!("code-review-{}", input.story_key),
            timeout: Some(CODE_REVIEW_TIMEOUT),
            output_schema: Some(code_review_schema()),
        })
        .await?;

    let token_usage = result.token_estimate;
    if result.status != DispatchStatus::Completed {
        return Ok(CodeReviewReport {
            result: StepResult::Failed,
            verdict: ReviewVerdict::NeedsMajorRework,
            agent_verdict: None,
            issues: 0,
            issue_list: Vec::new(),
            notes: None,
            error: Some(match result.status {
                DispatchStatus::Timeout => "dispatch_timeout".into(),
                _ => format!("dispatch_failed (exit {})", result.exit_code),
            }),
            token_usage,
        });
    }
    let Some(parsed) = result.parsed else {
        return Ok(CodeReviewReport {
            result: StepResult::Failed,
            verdict: ReviewVerdict::NeedsMajorRework,
            agent_verdict: None,
            issues: 0,
            issue_list: Vec::new(),
            notes: None,
            error: result.parse_error.or(Some("schema_validation_failed".into())),
            token_usage,
        });
    };

    let issue_list: Vec<ReviewIssue> = field(&parsed, "issue_list")
        .and_then(|v| v.as_sequence())
        .map(|seq| seq.iter().filter_map(parse_issue).collect())
        .unwrap_or_default();

    let agent_verdict = str_field(&parsed, "verdict");
    let verdict = ReviewVerdict::from_issues(&issue_list);
    if agent_verdict.as_deref() != Some(verdict.as_str()) {
        info!(
            story = %input.story_key,
            verdict = verdict.as_str(),
            agent = agent_verdict.as_deref().unwrap_or("none"),
            "review verdict overridden from issue severities"
        );
    } else {
        info!(story = %input.story_key, verdict = verdict.as_str(), issues = issue_list.len(), "review complete");
    }

    Ok(CodeReviewReport {
        result: StepResult::Success,
        verdict,
        agent_verdict,
        issues: issue_list.len(),
        issue_list,
        notes: str_field(&parsed, "notes"),
        error: None,
        token_usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::ScriptedDispatcher;
    use crate::pack::FilePack;
    use crate::store::DecisionStore;
    use std::sync::Arc;

    fn deps(dispatcher: ScriptedDispatcher, root: PathBuf) -> WorkflowDeps {
        WorkflowDeps {
            db: Arc::new(DecisionStore::open_in_memory().unwrap()),
            pack: Arc::new(FilePack::new(PathBuf::from("/nonexistent"))),
            dispatcher: Arc::new(dispatcher),
            project_root: root,
        }
    }

    fn input(dir: &tempfile::TempDir) -> CodeReviewInput {
        let story = dir.path().join("5-1.md");
        std::fs::write(&story, "# Story 5-1").unwrap();
        CodeReviewInput {
            story_key: "5-1".into(),
            story_file_path: story,
            pipeline_run_id: None,
            working_directory: None,
            files_modified: None,
            previous_issues: None,
        }
    }

    #[test]
    fn test_verdict_law() {
        let blocker = ReviewIssue {
            severity: IssueSeverity::Blocker,
            description: "x".into(),
            file: None,
            line: None,
        };
        let minor = ReviewIssue {
            severity: IssueSeverity::Minor,
            description: "y".into(),
            file: None,
            line: None,
        };

        assert_eq!(ReviewVerdict::from_issues(&[]), ReviewVerdict::ShipIt);
        assert_eq!(
            ReviewVerdict::from_issues(&[minor.clone()]),
            ReviewVerdict::NeedsMinorFixes
        );
        assert_eq!(
            ReviewVerdict::from_issues(&[minor, blocker]),
            ReviewVerdict::NeedsMajorRework
        );
    }

    #[tokio::test]
    async fn test_verdict_overrides_agent_claim() {
        let dir = tempfile::tempdir().unwrap();
        // Agent says SHIP_IT but reports a blocker; the pipeline must not
        // trust it.
        let reply = "```yaml\nverdict: SHIP_IT\nissues: 0\nissue_list:\n  - severity: blocker\n    description: data loss on restart\n    file: src/db.rs\n    line: \"42\"\n```";
        let report = run_code_review(&deps(ScriptedDispatcher::completing(reply), dir.path().into()), input(&dir))
            .await
            .unwrap();

        assert_eq!(report.verdict, ReviewVerdict::NeedsMajorRework);
        assert_eq!(report.agent_verdict.as_deref(), Some("SHIP_IT"));
        assert_eq!(report.issues, 1, "issues recomputed from the list");
        assert_eq!(report.issue_list[0].line, Some(42), "quoted line coerces");
    }

    #[tokio::test]
    async fn test_clean_review_ships() {
        let dir = tempfile::tempdir().unwrap();
        let reply = "```yaml\nverdict: NEEDS_MINOR_FIXES\nissues: 3\nissue_list: []\n```";
        let report = run_code_review(&deps(ScriptedDispatcher::completing(reply), dir.path().into()), input(&dir))
            .await
            .unwrap();

        assert_eq!(report.verdict, ReviewVerdict::ShipIt);
        assert_eq!(report.issues, 0);
    }

    #[tokio::test]
    async fn test_previous_issues_prime_the_reviewer() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::completing(
            "```yaml\nverdict: SHIP_IT\nissue_list: []\n```",
        );
        let requests = dispatcher.requests();
        let deps = deps(dispatcher, dir.path().into());

        let mut inp = input(&dir);
        inp.previous_issues = Some(vec![ReviewIssue {
            severity: IssueSeverity::Major,
            description: "unbounded retry loop".into(),
            file: Some("src/retry.rs".into()),
            line: Some(17),
        }]);
        run_code_review(&deps, inp).await.unwrap();

        let prompt = requests.lock().unwrap()[0].prompt.clone();
        assert!(prompt.contains("PREVIOUS FINDINGS"));
        assert!(prompt.contains("unbounded retry loop"));
        assert!(prompt.contains("src/retry.rs:17"));
    }

    #[tokio::test]
    async fn test_scoped_diff_reaches_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("touched.rs"), "fn touched() {}\n").unwrap();
        std::fs::write(dir.path().join("noise.rs"), "fn noise() {}\n").unwrap();
        drop(repo);

        let dispatcher = ScriptedDispatcher::completing(
            "```yaml\nverdict: SHIP_IT\nissue_list: []\n```",
        );
        let requests = dispatcher.requests();
        let deps = deps(dispatcher, dir.path().into());

        let mut inp = input(&dir);
        inp.files_modified = Some(vec!["touched.rs".into()]);
        run_code_review(&deps, inp).await.unwrap();

        let prompt = requests.lock().unwrap()[0].prompt.clone();
        assert!(prompt.contains("fn touched"));
        assert!(!prompt.contains("fn noise"));
    }

    #[tokio::test]
    async fn test_no_repository_still_reviews() {
        let dir = tempfile::tempdir().unwrap();
        let reply = "```yaml\nverdict: SHIP_IT\nissue_list: []\n```";
        let report = run_code_review(&deps(ScriptedDispatcher::completing(reply), dir.path().into()), input(&dir))
            .await
            .unwrap();
        assert_eq!(report.result, StepResult::Success);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher =
            ScriptedDispatcher::new().script_status("code-review", DispatchStatus::Failed, "");
        let report = run_code_review(&deps(dispatcher, dir.path().into()), input(&dir))
            .await
            .unwrap();
        assert_eq!(report.result, StepResult::Failed);
        assert!(report.error.unwrap().contains("dispatch_failed"));
    }
}
