//! Typed error hierarchy for the pipeline orchestrator.
//!
//! Two enums cover the two places errors cross subsystem boundaries:
//! - `DispatchError`: agent subprocess failures
//! - `PipelineError`: run-level and CLI-surface failures
//!
//! Phase and story failures are data, not errors: they travel in
//! `PhaseOutcome` and the story state machine so the pipeline can apply
//! its own continue/stop policy.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the agent dispatch subsystem.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to spawn agent process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write prompt to agent stdin: {0}")]
    StdinWriteFailed(#[source] std::io::Error),

    #[error("Agent output contained no fenced YAML block")]
    NoYamlBlock,

    #[error("Agent YAML failed schema '{schema}': {message}")]
    SchemaValidation { schema: String, message: String },
}

/// Errors from the run-level surface (CLI commands, store setup).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline run {id} not found")]
    RunNotFound { id: String },

    #[error("No pipeline run exists yet; run 'conductor run' first")]
    NoRuns,

    #[error("No completed run to amend; amendments require a completed parent")]
    NoCompletedParent,

    #[error("Store not initialized at {path}; run 'conductor init' first")]
    NotInitialized { path: PathBuf },

    #[error("Invalid phase name '{name}' (expected analysis, planning, solutioning or implementation)")]
    InvalidPhase { name: String },

    #[error("--from analysis requires --concept or --concept-file")]
    MissingConcept,

    #[error("--stop-after {stop_after} precedes --from {from}; nothing would run")]
    StopBeforeStart { stop_after: String, from: String },

    #[error("Malformed story key '{key}' (expected <epic>-<story>[-suffix])")]
    MalformedStoryKey { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "agent not found");
        let err = DispatchError::SpawnFailed {
            command: "claude".into(),
            source: io_err,
        };
        match &err {
            DispatchError::SpawnFailed { command, source } => {
                assert_eq!(command, "claude");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed variant"),
        }
    }

    #[test]
    fn schema_validation_message_names_the_schema() {
        let err = DispatchError::SchemaValidation {
            schema: "dev-story".into(),
            message: "missing required field 'result'".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("dev-story"));
        assert!(rendered.contains("result"));
    }

    #[test]
    fn pipeline_error_run_not_found_carries_id() {
        let err = PipelineError::RunNotFound {
            id: "abc-123".into(),
        };
        assert!(err.to_string().contains("abc-123"));
    }

    #[test]
    fn input_errors_render_flag_guidance() {
        assert!(PipelineError::MissingConcept.to_string().contains("--concept"));
        let err = PipelineError::StopBeforeStart {
            stop_after: "planning".into(),
            from: "solutioning".into(),
        };
        assert!(err.to_string().contains("nothing would run"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&DispatchError::NoYamlBlock);
        assert_std_error(&PipelineError::NoRuns);
    }
}
