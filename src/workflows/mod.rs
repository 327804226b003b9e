//! Compiled workflows: create-story, dev-story and code-review.
//!
//! Each workflow assembles its prompt from the pack template, dispatches
//! one agent, validates the declared schema and maps the YAML onto a typed
//! result. Workflows never write token usage themselves; they return the
//! estimate and the caller records it with its own metadata.

pub mod code_review;
pub mod create_story;
pub mod dev_story;

use std::path::PathBuf;
use std::sync::Arc;

use crate::dispatch::AgentDispatcher;
use crate::pack::PromptPack;
use crate::store::DecisionStore;

pub use code_review::{
    CodeReviewInput, CodeReviewReport, IssueSeverity, ReviewIssue, ReviewVerdict, run_code_review,
};
pub use create_story::{CreateStoryInput, CreateStoryOutcome, run_create_story};
pub use dev_story::{DevStoryInput, DevStoryReport, TestOutcome, run_dev_story};

/// Success/failure tag shared by workflow results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Success,
    Failed,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Shared dependency bundle injected into every workflow.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub db: Arc<DecisionStore>,
    pub pack: Arc<dyn PromptPack>,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    /// Root of the project working tree (git operations resolve here).
    pub project_root: PathBuf,
}
