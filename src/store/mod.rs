//! Durable decision store backed by an embedded SQLite database.
//!
//! Everything a pipeline run decides lives here: the run row itself, the
//! per-phase decisions (upserted so retries never duplicate), the
//! requirements derived from planning and solutioning, the artifacts that
//! mark sub-phases complete, and the append-only token usage log. The
//! store owns the single connection; callers never see SQL.

pub mod db;
pub mod models;

pub use db::DecisionStore;
pub use models::{
    Artifact, Decision, DecisionStatus, PipelineRun, Requirement, RequirementType, RunStatus,
    TokenUsageSummary, TokenUsageTotals,
};
