//! Sequential phase orchestration.
//!
//! Runs analysis → planning → solutioning → implementation, persisting a
//! phase history in the run's `config_json`. Resume reads the history and
//! continues at the first pending phase; the stop-after gate converts the
//! run to `stopped` strictly between phases; amendment runs replay phases
//! against a completed parent and supersede matching parent decisions.

pub mod analysis;
pub mod implementation;
pub mod planning;
pub mod solutioning;

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::events::{Event, EventBus};
use crate::orchestrator::OrchestratorConfig;
use crate::store::db::RunUpdate;
use crate::store::{PipelineRun, RunStatus};
use crate::util::{estimate_tokens, now_rfc3339, truncate_to_tokens};
use crate::workflows::WorkflowDeps;

pub const ANALYSIS_PROMPT_TOKENS: usize = 4_000;
pub const PLANNING_PROMPT_TOKENS: usize = 3_500;
pub const ARCHITECTURE_PROMPT_TOKENS: usize = 6_000;
pub const BASE_STORY_PROMPT_TOKENS: usize = 6_000;
pub const STORY_TOKENS_PER_DECISION: usize = 40;

/// The four pipeline phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Analysis,
    Planning,
    Solutioning,
    Implementation,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [
        Phase::Analysis,
        Phase::Planning,
        Phase::Solutioning,
        Phase::Implementation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Planning => "planning",
            Self::Solutioning => "solutioning",
            Self::Implementation => "implementation",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "planning" => Ok(Self::Planning),
            "solutioning" => Ok(Self::Solutioning),
            "implementation" => Ok(Self::Implementation),
            other => Err(PipelineError::InvalidPhase { name: other.into() }),
        }
    }

    /// Phases from `start` (inclusive) to the end of the pipeline.
    pub fn from_phase(start: Phase) -> Vec<Phase> {
        Self::ORDER.iter().copied().filter(|p| *p >= start).collect()
    }

    /// Phases strictly before `start`; an amendment copies these from the
    /// parent instead of executing them.
    pub fn before(start: Phase) -> Vec<Phase> {
        Self::ORDER.iter().copied().filter(|p| *p < start).collect()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of `config_json.phaseHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub phase: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// The run's invocation parameters plus phase history, stored as
/// `config_json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
}

impl RunConfig {
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn is_phase_completed(&self, phase: Phase) -> bool {
        self.phase_history
            .iter()
            .any(|r| r.phase == phase.as_str() && r.completed_at.is_some())
    }

    /// First pipeline phase with no completed history entry.
    pub fn next_pending_phase(&self, start: Phase) -> Option<Phase> {
        Phase::from_phase(start)
            .into_iter()
            .find(|p| !self.is_phase_completed(*p))
    }
}

/// Outcome of one phase execution.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub success: bool,
    pub decisions: usize,
    pub error: Option<String>,
    /// Uncovered functional requirements when a readiness gate failed.
    pub gaps: Vec<String>,
}

impl PhaseOutcome {
    pub fn success(decisions: usize) -> Self {
        Self {
            success: true,
            decisions,
            error: None,
            gaps: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            decisions: 0,
            error: Some(error.into()),
            gaps: Vec::new(),
        }
    }
}

/// Human summary printed when the stop-after gate fires.
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub phase: String,
    pub started_at: String,
    pub completed_at: String,
    pub decisions_count: usize,
    pub run_id: String,
}

/// Terminal report of `execute_run`.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: RunStatus,
    pub run_id: String,
    pub stopped_after: Option<StopSummary>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
}

/// Dependencies shared by every phase.
#[derive(Clone)]
pub struct PhaseDeps {
    pub wf: WorkflowDeps,
    pub bus: EventBus,
    pub orch_config: OrchestratorConfig,
    /// The methodology directory (conflict rules, logs), not the project
    /// working tree.
    pub pack_root: PathBuf,
}

/// Options for starting a fresh run.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub methodology: String,
    pub concept: Option<String>,
    pub from: Phase,
    pub stop_after: Option<Phase>,
    pub stories: Option<Vec<String>>,
    pub concurrency: Option<usize>,
}

pub struct PhaseOrchestrator {
    deps: PhaseDeps,
}

impl PhaseOrchestrator {
    pub fn new(deps: PhaseDeps) -> Self {
        Self { deps }
    }

    /// Create a new pipeline run. `--from analysis` requires a concept.
    pub fn start_run(&self, options: StartOptions) -> Result<PipelineRun> {
        if options.from == Phase::Analysis && options.concept.is_none() {
            return Err(PipelineError::MissingConcept.into());
        }
        if let Some(stop) = options.stop_after {
            if stop < options.from {
                return Err(PipelineError::StopBeforeStart {
                    stop_after: stop.as_str().into(),
                    from: options.from.as_str().into(),
                }
                .into());
            }
        }
        let config = RunConfig {
            concept: options.concept,
            from: Some(options.from.as_str().into()),
            stop_after: options.stop_after.map(|p| p.as_str().into()),
            stories: options.stories,
            concurrency: options.concurrency,
            phase_history: Vec::new(),
        };
        self.deps
            .wf
            .db
            .create_pipeline_run(&options.methodology, &config.to_json())
    }

    /// Create an amendment run against the latest (or named) completed
    /// parent, copying decisions for every phase before `from`.
    pub fn start_amendment(
        &self,
        concept: String,
        parent_run_id: Option<String>,
        from: Phase,
        stop_after: Option<Phase>,
    ) -> Result<PipelineRun> {
        let parent = match parent_run_id {
            Some(id) => self
                .deps
                .wf
                .db
                .get_pipeline_run_by_id(&id)?
                .ok_or(PipelineError::RunNotFound { id })?,
            None => self
                .deps
                .wf
                .db
                .get_latest_completed_run()?
                .ok_or(PipelineError::NoCompletedParent)?,
        };
        if parent.status != RunStatus::Completed {
            return Err(PipelineError::NoCompletedParent.into());
        }

        let config = RunConfig {
            concept: Some(concept),
            from: Some(from.as_str().into()),
            stop_after: stop_after.map(|p| p.as_str().into()),
            ..Default::default()
        };
        let skipped: Vec<&str> = Phase::before(from).iter().map(|p| p.as_str()).collect();
        self.deps.wf.db.create_amendment_run(
            &parent.id,
            &parent.methodology,
            &config.to_json(),
            &skipped,
        )
    }

    /// Execute every pending phase of the run, honoring resume and the
    /// stop-after gate.
    pub async fn execute_run(&self, run_id: &str) -> Result<ExecutionReport> {
        let run = self
            .deps
            .wf
            .db
            .get_pipeline_run_by_id(run_id)?
            .ok_or_else(|| PipelineError::RunNotFound { id: run_id.into() })?;
        let mut config = RunConfig::from_json(&run.config_json);
        let start = config
            .from
            .as_deref()
            .map(Phase::parse)
            .transpose()?
            .unwrap_or(Phase::Analysis);
        let stop_after = config
            .stop_after
            .as_deref()
            .map(Phase::parse)
            .transpose()?;

        for phase in Phase::from_phase(start) {
            if config.is_phase_completed(phase) {
                info!(run = %run_id, phase = %phase, "phase already complete; skipping");
                continue;
            }

            let started_at = now_rfc3339();
            config.phase_history.push(PhaseRecord {
                phase: phase.as_str().into(),
                started_at: started_at.clone(),
                completed_at: None,
            });
            self.deps.wf.db.update_pipeline_run(
                run_id,
                RunUpdate {
                    current_phase: Some(phase.as_str().into()),
                    config_json: Some(config.to_json()),
                    ..Default::default()
                },
            )?;
            self.deps.bus.publish(Event::PhaseStart {
                run_id: run_id.into(),
                phase: phase.as_str().into(),
            });
            info!(run = %run_id, phase = %phase, "phase starting");

            // A throw inside a phase fails the phase, not the process.
            let outcome = match self.run_phase(run_id, phase, &config).await {
                Ok(outcome) => outcome,
                Err(e) => PhaseOutcome::failed(format!("{e:#}")),
            };
            if !outcome.success {
                let error = outcome.error.unwrap_or_else(|| "phase failed".into());
                warn!(run = %run_id, phase = %phase, error = %error, "phase failed");
                self.deps.wf.db.update_pipeline_run(
                    run_id,
                    RunUpdate {
                        status: Some(RunStatus::Failed),
                        ..Default::default()
                    },
                )?;
                return Ok(ExecutionReport {
                    status: RunStatus::Failed,
                    run_id: run_id.into(),
                    stopped_after: None,
                    failed_phase: Some(phase),
                    error: Some(error),
                });
            }

            let completed_at = now_rfc3339();
            if let Some(record) = config
                .phase_history
                .iter_mut()
                .rev()
                .find(|r| r.phase == phase.as_str())
            {
                record.completed_at = Some(completed_at.clone());
            }
            self.deps.wf.db.update_pipeline_run(
                run_id,
                RunUpdate {
                    config_json: Some(config.to_json()),
                    ..Default::default()
                },
            )?;
            self.deps.bus.publish(Event::PhaseComplete {
                run_id: run_id.into(),
                phase: phase.as_str().into(),
                decisions: outcome.decisions,
            });
            info!(run = %run_id, phase = %phase, decisions = outcome.decisions, "phase complete");

            // Amendment supersession is atomic with phase completion:
            // store failures are warned, never fatal.
            if let Some(parent_id) = &run.parent_run_id {
                self.supersede_parent_decisions(run_id, parent_id, phase);
            }

            // Stop-after is evaluated only between phases.
            if stop_after == Some(phase) {
                self.deps.wf.db.update_pipeline_run(
                    run_id,
                    RunUpdate {
                        status: Some(RunStatus::Stopped),
                        ..Default::default()
                    },
                )?;
                return Ok(ExecutionReport {
                    status: RunStatus::Stopped,
                    run_id: run_id.into(),
                    stopped_after: Some(StopSummary {
                        phase: phase.as_str().into(),
                        started_at,
                        completed_at,
                        decisions_count: outcome.decisions,
                        run_id: run_id.into(),
                    }),
                    failed_phase: None,
                    error: None,
                });
            }
        }

        self.deps.wf.db.update_pipeline_run(
            run_id,
            RunUpdate {
                status: Some(RunStatus::Completed),
                ..Default::default()
            },
        )?;
        if run.parent_run_id.is_some() {
            if let Err(e) = self.write_delta_document(run_id) {
                warn!(error = %e, "failed to write amendment delta document");
            }
        }
        Ok(ExecutionReport {
            status: RunStatus::Completed,
            run_id: run_id.into(),
            stopped_after: None,
            failed_phase: None,
            error: None,
        })
    }

    /// Continue the named (or latest) run at its next pending phase.
    pub async fn resume_run(&self, run_id: Option<String>) -> Result<ExecutionReport> {
        let run = match run_id {
            Some(id) => self
                .deps
                .wf
                .db
                .get_pipeline_run_by_id(&id)?
                .ok_or(PipelineError::RunNotFound { id })?,
            None => self.deps.wf.db.get_latest_run()?.ok_or(PipelineError::NoRuns)?,
        };
        self.deps.wf.db.update_pipeline_run(
            &run.id,
            RunUpdate {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )?;
        self.execute_run(&run.id).await
    }

    async fn run_phase(&self, run_id: &str, phase: Phase, config: &RunConfig) -> Result<PhaseOutcome> {
        match phase {
            Phase::Analysis => analysis::run_analysis(&self.deps, run_id, config).await,
            Phase::Planning => planning::run_planning(&self.deps, run_id).await,
            Phase::Solutioning => solutioning::run_solutioning(&self.deps, run_id).await,
            Phase::Implementation => {
                implementation::run_implementation(&self.deps, run_id, config).await
            }
        }
    }

    /// For every decision this phase produced whose `(phase, category,
    /// key)` also exists in the parent, mark the parent decision
    /// superseded.
    fn supersede_parent_decisions(&self, run_id: &str, parent_id: &str, phase: Phase) {
        let db = &self.deps.wf.db;
        let new_decisions = match db.get_decisions_by_phase_for_run(run_id, phase.as_str()) {
            Ok(decisions) => decisions,
            Err(e) => {
                warn!(error = %e, "supersession scan failed");
                return;
            }
        };
        for new_decision in new_decisions {
            let parent_decision = match db.find_decision(
                parent_id,
                &new_decision.phase,
                &new_decision.category,
                &new_decision.key,
            ) {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, key = %new_decision.key, "supersession lookup failed");
                    continue;
                }
            };
            match db.supersede_decision(&parent_decision.id, &new_decision.id) {
                Ok(()) => info!(
                    phase = %phase,
                    category = %new_decision.category,
                    key = %new_decision.key,
                    "parent decision superseded"
                ),
                Err(e) => warn!(error = %e, key = %new_decision.key, "supersession write failed"),
            }
        }
    }

    /// Write `amendment-<short-id>.md` listing every supersession.
    fn write_delta_document(&self, run_id: &str) -> Result<PathBuf> {
        let db = &self.deps.wf.db;
        let run = db
            .get_pipeline_run_by_id(run_id)?
            .ok_or_else(|| PipelineError::RunNotFound { id: run_id.into() })?;
        let parent_id = run
            .parent_run_id
            .clone()
            .context("delta document requires an amendment run")?;

        let amendment_decisions = db.get_active_decisions(run_id, None)?;

        let mut lines = Vec::new();
        for decision in &amendment_decisions {
            let Ok(Some(parent)) = db.find_decision(
                &parent_id,
                &decision.phase,
                &decision.category,
                &decision.key,
            ) else {
                continue;
            };
            if parent.superseded_by.as_deref() == Some(decision.id.as_str()) {
                lines.push(format!(
                    "- [{}/{}/{}] {} -> {}",
                    decision.phase, decision.category, decision.key, parent.value, decision.value
                ));
            }
        }

        let short_id: String = run_id.chars().take(8).collect();
        let path = self
            .deps
            .wf
            .project_root
            .join(format!("amendment-{short_id}.md"));
        let body = format!(
            "# Amendment delta\n\nRun: {run_id}\nParent: {parent_id}\nWritten: {}\n\n## Superseded decisions\n\n{}\n",
            now_rfc3339(),
            if lines.is_empty() {
                "(none)".to_string()
            } else {
                lines.join("\n")
            }
        );
        std::fs::write(&path, body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "amendment delta written");
        Ok(path)
    }
}

/// Append the parent-run decision block to an already-substituted prompt,
/// truncated to fit what remains of the phase budget.
pub(crate) fn append_amendment_context(
    prompt: String,
    deps: &PhaseDeps,
    run_id: &str,
    phase: Phase,
    ceiling: usize,
) -> String {
    let Ok(Some(run)) = deps.wf.db.get_pipeline_run_by_id(run_id) else {
        return prompt;
    };
    let Some(parent_id) = run.parent_run_id else {
        return prompt;
    };
    let decisions = deps
        .wf
        .db
        .get_decisions_by_phase_for_run(&parent_id, phase.as_str())
        .unwrap_or_default();
    if decisions.is_empty() {
        return prompt;
    }

    let mut block = String::from("\n--- AMENDMENT CONTEXT (Parent Run Decisions) ---\n");
    for decision in decisions {
        block.push_str(&format!(
            "[{}/{}] {}\n",
            decision.category, decision.key, decision.value
        ));
    }

    let remaining = ceiling.saturating_sub(estimate_tokens(&prompt));
    if estimate_tokens(&block) > remaining {
        let mut truncated = truncate_to_tokens(&block, remaining.saturating_sub(4));
        truncated.push_str("\n[TRUNCATED]");
        return prompt + &truncated;
    }
    prompt + &block
}
