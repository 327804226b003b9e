//! Typed rows and closed status enums for the decision store.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown run status '{other}'")),
        }
    }

    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A pipeline run row. `config_json` carries the invocation parameters and
/// the phase history; `token_usage_json` carries the orchestrator's status
/// snapshot for resumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub methodology: String,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub config_json: String,
    pub token_usage_json: Option<String>,
    pub parent_run_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Status of a stored decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Active,
    Superseded,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "active" => Ok(Self::Active),
            "superseded" => Ok(Self::Superseded),
            other => Err(format!("unknown decision status '{other}'")),
        }
    }
}

/// A persisted decision keyed by `(run, phase, category, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub pipeline_run_id: String,
    pub phase: String,
    pub category: String,
    pub key: String,
    pub value: String,
    pub rationale: Option<String>,
    pub status: DecisionStatus,
    pub superseded_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Kind of requirement tracked for downstream discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementType {
    Functional,
    NonFunctional,
    Story,
}

impl RequirementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::NonFunctional => "non_functional",
            Self::Story => "story",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "functional" => Ok(Self::Functional),
            "non_functional" => Ok(Self::NonFunctional),
            "story" => Ok(Self::Story),
            other => Err(format!("unknown requirement type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub pipeline_run_id: String,
    pub source: String,
    pub requirement_type: RequirementType,
    pub description: String,
    pub priority: String,
    pub status: String,
    pub created_at: String,
}

/// An artifact registered by a phase. Presence of an artifact for a
/// `(run, phase, type)` is how retries detect an already-finished
/// sub-phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub pipeline_run_id: String,
    pub phase: String,
    pub artifact_type: String,
    pub path: String,
    pub summary: Option<String>,
    pub created_at: String,
}

/// Aggregated usage for one `(phase, agent)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageSummary {
    pub phase: String,
    pub agent: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub dispatches: u64,
}

/// Totals across a whole run, with per-(phase, agent) breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsageTotals {
    pub by_phase_agent: Vec<TokenUsageSummary>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Stopped,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::from_str("queued").is_err());
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_decision_status_round_trip() {
        assert_eq!(
            DecisionStatus::from_str("active").unwrap(),
            DecisionStatus::Active
        );
        assert_eq!(
            DecisionStatus::from_str("superseded").unwrap(),
            DecisionStatus::Superseded
        );
        assert!(DecisionStatus::from_str("stale").is_err());
    }

    #[test]
    fn test_requirement_type_wire_names() {
        assert_eq!(RequirementType::NonFunctional.as_str(), "non_functional");
        assert_eq!(
            RequirementType::from_str("non_functional").unwrap(),
            RequirementType::NonFunctional
        );
    }

    #[test]
    fn test_run_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Stopped).unwrap(),
            "\"stopped\""
        );
        let parsed: RunStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, RunStatus::Running);
    }
}
