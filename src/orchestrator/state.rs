//! Orchestrator and per-story state, and the persisted status snapshot.
//!
//! The snapshot serialized into `pipeline_runs.token_usage_json` after
//! every transition is the single source of truth for `status` reporting,
//! resume detection and the health check.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::now_rfc3339;

/// Top-level orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    #[default]
    Idle,
    Running,
    Paused,
    Complete,
    Failed,
}

/// Per-story phase in the implementation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryPhase {
    #[default]
    Pending,
    InStoryCreation,
    InDev,
    InReview,
    NeedsFixes,
    Complete,
    Escalated,
}

impl StoryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InStoryCreation => "IN_STORY_CREATION",
            Self::InDev => "IN_DEV",
            Self::InReview => "IN_REVIEW",
            Self::NeedsFixes => "NEEDS_FIXES",
            Self::Complete => "COMPLETE",
            Self::Escalated => "ESCALATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Escalated)
    }

    /// A phase that has left PENDING and not yet terminated; eligible for
    /// stall detection.
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, Self::Pending) && !self.is_terminal()
    }
}

/// Batching metrics for a decomposed story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompositionMetrics {
    pub total_tasks: usize,
    pub batch_count: usize,
    pub batch_sizes: Vec<usize>,
}

/// Tracked state of one story.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryState {
    pub phase: StoryPhase,
    pub review_cycles: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verdict: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<DecompositionMetrics>,
    pub started_at: String,
    pub updated_at: String,
}

impl StoryState {
    pub fn pending() -> Self {
        let now = now_rfc3339();
        Self {
            started_at: now.clone(),
            updated_at: now,
            ..Default::default()
        }
    }

    pub fn transition(&mut self, phase: StoryPhase) {
        self.phase = phase;
        self.updated_at = now_rfc3339();
    }
}

/// The full status snapshot persisted after every meaningful mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: OrchestratorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_run_id: Option<String>,
    pub stories: BTreeMap<String, StoryState>,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_pids: Vec<u32>,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }

    pub fn completed(&self) -> Vec<String> {
        self.stories_in(StoryPhase::Complete)
    }

    pub fn escalated(&self) -> Vec<String> {
        self.stories_in(StoryPhase::Escalated)
    }

    pub fn active(&self) -> Vec<String> {
        self.stories
            .iter()
            .filter(|(_, s)| s.phase.is_in_flight())
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn stories_in(&self, phase: StoryPhase) -> Vec<String> {
        self.stories
            .iter()
            .filter(|(_, s)| s.phase == phase)
            .map(|(k, _)| k.clone())
            .collect()
    }
}
