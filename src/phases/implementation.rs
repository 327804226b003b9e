//! Implementation phase: delegates to the implementation orchestrator.

use anyhow::Result;
use tracing::{info, warn};

use super::{PhaseDeps, PhaseOutcome, RunConfig};
use crate::orchestrator::{ImplementationOrchestrator, OrchestratorState};
use crate::story::ConflictRules;

/// Story keys for the run: the `--stories` override when present,
/// otherwise every solutioning story in creation order.
fn story_keys(deps: &PhaseDeps, run_id: &str, config: &RunConfig) -> Result<Vec<String>> {
    if let Some(stories) = &config.stories {
        if !stories.is_empty() {
            return Ok(stories.clone());
        }
    }
    let decisions = deps
        .wf
        .db
        .get_decisions_by_phase_for_run(run_id, "solutioning")?;
    Ok(decisions
        .into_iter()
        .filter(|d| d.category == "stories")
        .map(|d| d.key)
        .collect())
}

pub async fn run_implementation(
    deps: &PhaseDeps,
    run_id: &str,
    config: &RunConfig,
) -> Result<PhaseOutcome> {
    let keys = story_keys(deps, run_id, config)?;
    if keys.is_empty() {
        return Ok(PhaseOutcome::failed(
            "no stories to implement; solutioning produced none",
        ));
    }

    let orch_config = match config.concurrency {
        Some(n) => deps.orch_config.clone().with_max_concurrency(n),
        None => deps.orch_config.clone(),
    };

    let mut orchestrator = ImplementationOrchestrator::new(
        deps.wf.clone(),
        deps.bus.clone(),
        orch_config,
    )
    .with_run_id(run_id.to_string());

    // The conflict prefix table is data-driven; fall back to the by-epic
    // policy when the pack carries no rule file.
    let rules_path = deps.pack_root.join("conflict-groups.json");
    if rules_path.exists() {
        match ConflictRules::load(&rules_path) {
            Ok(rules) => orchestrator = orchestrator.with_conflict_rules(rules),
            Err(e) => warn!(error = %e, "ignoring unreadable conflict rules"),
        }
    }

    let snapshot = orchestrator.run(keys).await?;
    let completed = snapshot.completed().len();
    let escalated = snapshot.escalated().len();
    info!(run = %run_id, completed, escalated, "implementation finished");

    // Escalated stories do not fail the phase; an orchestrator-level
    // failure does.
    if snapshot.state == OrchestratorState::Failed {
        return Ok(PhaseOutcome::failed("implementation orchestrator failed"));
    }
    Ok(PhaseOutcome::success(0))
}
