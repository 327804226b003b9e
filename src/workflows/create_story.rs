//! The create-story compiled workflow.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::WorkflowDeps;
use crate::dispatch::schema::{create_story_schema, str_field};
use crate::dispatch::{DispatchRequest, DispatchStatus, TokenEstimate};
use crate::pack::TEMPLATE_CREATE_STORY;
use crate::prompt::{Section, assemble_prompt};

const CREATE_STORY_PROMPT_TOKENS: usize = 8_000;
const CREATE_STORY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct CreateStoryInput {
    pub epic_id: String,
    pub story_key: String,
    pub pipeline_run_id: Option<String>,
}

/// Outcome of a create-story dispatch.
#[derive(Debug, Clone)]
pub enum CreateStoryOutcome {
    Success {
        story_file: String,
        story_key: String,
        story_title: String,
        token_usage: TokenEstimate,
    },
    Failure {
        error: String,
        token_usage: TokenEstimate,
    },
}

impl CreateStoryOutcome {
    pub fn token_usage(&self) -> TokenEstimate {
        match self {
            Self::Success { token_usage, .. } | Self::Failure { token_usage, .. } => *token_usage,
        }
    }
}

/// Retrieve epic context from the solutioning decisions of the given run.
fn epic_context(deps: &WorkflowDeps, input: &CreateStoryInput) -> String {
    let Some(run_id) = &input.pipeline_run_id else {
        return String::new();
    };
    let mut context = String::new();
    if let Ok(Some(epic)) = deps.db.find_decision(
        run_id,
        "solutioning",
        "epics",
        &format!("epic-{}", input.epic_id),
    ) {
        context.push_str(&epic.value);
        context.push('\n');
    }
    if let Ok(Some(story)) =
        deps.db
            .find_decision(run_id, "solutioning", "stories", &input.story_key)
    {
        context.push_str(&story.value);
        context.push('\n');
    }
    context
}

pub async fn run_create_story(
    deps: &WorkflowDeps,
    input: CreateStoryInput,
) -> Result<CreateStoryOutcome> {
    let template = deps.pack.template(TEMPLATE_CREATE_STORY)?;
    let assembled = assemble_prompt(
        &template,
        &[
            Section::required("story_key", input.story_key.clone()),
            Section::important("epic_context", epic_context(deps, &input)),
        ],
        CREATE_STORY_PROMPT_TOKENS,
    );

    let result = deps
        .dispatcher
        .dispatch(DispatchRequest {
            prompt: assembled.prompt,
            agent: "create-story".into(),
            task_type: format!("create-story-{}", input.story_key),
            timeout: Some(CREATE_STORY_TIMEOUT),
            output_schema: Some(create_story_schema()),
        })
        .await?;

    let token_usage = result.token_estimate;
    if result.status != DispatchStatus::Completed {
        warn!(story = %input.story_key, status = ?result.status, "create-story dispatch did not complete");
        return Ok(CreateStoryOutcome::Failure {
            error: match result.status {
                DispatchStatus::Timeout => "dispatch_timeout".into(),
                _ => format!("dispatch_failed (exit {})", result.exit_code),
            },
            token_usage,
        });
    }
    let Some(parsed) = result.parsed else {
        return Ok(CreateStoryOutcome::Failure {
            error: result
                .parse_error
                .unwrap_or_else(|| "schema_validation_failed".into()),
            token_usage,
        });
    };

    let outcome_result = str_field(&parsed, "result").unwrap_or_default();
    let story_file = str_field(&parsed, "story_file");
    if outcome_result != "success" {
        return Ok(CreateStoryOutcome::Failure {
            error: str_field(&parsed, "error").unwrap_or_else(|| "create-story reported failure".into()),
            token_usage,
        });
    }
    let Some(story_file) = story_file.filter(|f| !f.is_empty()) else {
        return Ok(CreateStoryOutcome::Failure {
            error: "create-story succeeded without a story_file".into(),
            token_usage,
        });
    };

    info!(story = %input.story_key, file = %story_file, "story file created");
    Ok(CreateStoryOutcome::Success {
        story_file,
        story_key: str_field(&parsed, "story_key").unwrap_or_else(|| input.story_key.clone()),
        story_title: str_field(&parsed, "story_title").unwrap_or_default(),
        token_usage,
    })
}
