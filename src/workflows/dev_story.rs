//! The dev-story compiled workflow.
//!
//! Reads the story file (failing fast when it is missing or empty),
//! injects test-pattern decisions or the built-in default block, and
//! dispatches the implementation agent. A schema-validation failure does
//! not lose the working tree: `files_modified` is recovered from git
//! status so code review can still run over what was actually written.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::{StepResult, WorkflowDeps};
use crate::dispatch::schema::{dev_story_schema, normalize_result, seq_field, str_field};
use crate::dispatch::{DispatchRequest, DispatchStatus, TokenEstimate};
use crate::gitops::GitWorkspace;
use crate::pack::TEMPLATE_DEV_STORY;
use crate::prompt::{Section, assemble_prompt};

const DEV_STORY_PROMPT_TOKENS: usize = 24_000;
pub const DEV_STORY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Fallback test-pattern guidance when solutioning recorded none.
const DEFAULT_TEST_PATTERNS: &str = "\
Use the project's existing test runner. Structure tests as focused units:

```
describe('<unit under test>', () => {
  it('<behavior>', () => {
    expect(actual).toEqual(expected);
  });
});
```

Cover every acceptance criterion with at least one test, and run the full
suite before reporting `tests: pass`.";

#[derive(Debug, Clone)]
pub struct DevStoryInput {
    pub story_key: String,
    pub story_file_path: PathBuf,
    pub pipeline_run_id: Option<String>,
    /// `Tn: title` lines restricting this dispatch to one batch.
    pub task_scope: Option<String>,
    /// Files already modified by earlier batches of the same story.
    pub prior_files: Vec<String>,
    pub timeout: Option<Duration>,
}

/// Outcome of tests as the agent reported them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone)]
pub struct DevStoryReport {
    pub result: StepResult,
    pub ac_met: Vec<String>,
    pub ac_failures: Vec<String>,
    pub files_modified: Vec<String>,
    pub tests: TestOutcome,
    pub notes: Option<String>,
    pub error: Option<String>,
    pub details: Option<String>,
    pub token_usage: TokenEstimate,
}

impl DevStoryReport {
    fn failed(error: &str, details: Option<String>, token_usage: TokenEstimate) -> Self {
        Self {
            result: StepResult::Failed,
            ac_met: Vec::new(),
            ac_failures: Vec::new(),
            files_modified: Vec::new(),
            tests: TestOutcome::Fail,
            notes: None,
            error: Some(error.to_string()),
            details,
            token_usage,
        }
    }
}

fn test_patterns(deps: &WorkflowDeps, run_id: Option<&str>) -> String {
    let decisions = match run_id {
        Some(run_id) => deps
            .db
            .get_active_decisions(run_id, Some("solutioning"))
            .unwrap_or_default(),
        None => Vec::new(),
    };
    let patterns: Vec<String> = decisions
        .into_iter()
        .filter(|d| d.category == "test-patterns")
        .map(|d| d.value)
        .collect();
    if patterns.is_empty() {
        DEFAULT_TEST_PATTERNS.to_string()
    } else {
        patterns.join("\n")
    }
}

pub async fn run_dev_story(deps: &WorkflowDeps, input: DevStoryInput) -> Result<DevStoryReport> {
    // Fail fast on an unreadable or empty story: no dispatch.
    let story_content = match std::fs::read_to_string(&input.story_file_path) {
        Ok(content) if content.trim().is_empty() => {
            return Ok(DevStoryReport::failed(
                "story_file_empty",
                Some(input.story_file_path.display().to_string()),
                TokenEstimate::default(),
            ));
        }
        Ok(content) => content,
        Err(e) => {
            return Ok(DevStoryReport::failed(
                "story_file_missing",
                Some(format!("{}: {e}", input.story_file_path.display())),
                TokenEstimate::default(),
            ));
        }
    };

    let template = deps.pack.template(TEMPLATE_DEV_STORY)?;
    let task_scope = input
        .task_scope
        .as_ref()
        .map(|scope| format!("\n## TASK SCOPE\nImplement only these tasks in this pass:\n{scope}\n"))
        .unwrap_or_default();
    let prior_files = if input.prior_files.is_empty() {
        String::new()
    } else {
        format!(
            "\n## FILES FROM EARLIER BATCHES\nThese files were already touched by this story; build on them:\n{}\n",
            input.prior_files.join("\n")
        )
    };

    let assembled = assemble_prompt(
        &template,
        &[
            Section::required("story_content", story_content),
            Section::required("task_scope", task_scope),
            Section::required("prior_files", prior_files),
            Section::optional(
                "test_patterns",
                test_patterns(deps, input.pipeline_run_id.as_deref()),
            ),
        ],
        DEV_STORY_PROMPT_TOKENS,
    );
    if assembled.truncated {
        warn!(story = %input.story_key, tokens = assembled.token_count, "dev-story prompt over budget; optional context trimmed");
    }

    let result = deps
        .dispatcher
        .dispatch(DispatchRequest {
            prompt: assembled.prompt,
            agent: "dev-story".into(),
            task_type: format!("dev-story-{}", input.story_key),
            timeout: Some(input.timeout.unwrap_or(DEV_STORY_TIMEOUT)),
            output_schema: Some(dev_story_schema()),
        })
        .await?;

    let token_usage = result.token_estimate;
    if result.status != DispatchStatus::Completed {
        let error = match result.status {
            DispatchStatus::Timeout => "dispatch_timeout",
            _ => "dispatch_failed",
        };
        return Ok(DevStoryReport::failed(
            error,
            Some(format!("exit code {}", result.exit_code)),
            token_usage,
        ));
    }

    let Some(parsed) = result.parsed else {
        // Schema failure: the agent may still have written code. Recover
        // the modified set from the working tree so review can proceed.
        let recovered = recover_files_from_git(deps);
        info!(story = %input.story_key, files = recovered.len(), "recovered files_modified from git after schema failure");
        let mut report = DevStoryReport::failed(
            "schema_validation_failed",
            result.parse_error,
            token_usage,
        );
        report.files_modified = recovered;
        return Ok(report);
    };

    let result_field = normalize_result(&str_field(&parsed, "result").unwrap_or_default());
    let tests = match str_field(&parsed, "tests").as_deref() {
        Some("pass") => TestOutcome::Pass,
        _ => TestOutcome::Fail,
    };

    Ok(DevStoryReport {
        result: if result_field == "success" {
            StepResult::Success
        } else {
            StepResult::Failed
        },
        ac_met: seq_field(&parsed, "ac_met"),
        ac_failures: seq_field(&parsed, "ac_failures"),
        files_modified: seq_field(&parsed, "files_modified"),
        tests,
        notes: str_field(&parsed, "notes"),
        error: if result_field == "success" {
            None
        } else {
            Some("dev-story reported failure".into())
        },
        details: None,
        token_usage,
    })
}

fn recover_files_from_git(deps: &WorkflowDeps) -> Vec<String> {
    match GitWorkspace::open(&deps.project_root) {
        Ok(ws) => ws.modified_files().unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "cannot recover files from git; not a repository");
            Vec::new()
        }
    }
}
