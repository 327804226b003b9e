//! Analysis phase: concept → product brief.

use anyhow::Result;
use tracing::info;

use super::{ANALYSIS_PROMPT_TOKENS, Phase, PhaseDeps, PhaseOutcome, RunConfig, append_amendment_context};
use crate::dispatch::DispatchRequest;
use crate::dispatch::schema::{analysis_schema, field, str_field};
use crate::pack::TEMPLATE_ANALYSIS;
use crate::prompt::{Section, assemble_prompt};
use crate::store::db::TokenUsageEntry;
use crate::util::dispatch_cost_usd;

/// The product-brief keys persisted under `(analysis, product-brief, _)`.
const BRIEF_KEYS: [&str; 5] = [
    "problem_statement",
    "target_users",
    "core_features",
    "success_metrics",
    "constraints",
];

pub async fn run_analysis(
    deps: &PhaseDeps,
    run_id: &str,
    config: &RunConfig,
) -> Result<PhaseOutcome> {
    let Some(concept) = config.concept.clone() else {
        return Ok(PhaseOutcome::failed("analysis requires a concept"));
    };

    let template = deps.wf.pack.template(TEMPLATE_ANALYSIS)?;
    let assembled = assemble_prompt(
        &template,
        &[Section::required("concept", concept)],
        ANALYSIS_PROMPT_TOKENS,
    );
    if assembled.truncated && assembled.token_count > ANALYSIS_PROMPT_TOKENS {
        return Ok(PhaseOutcome::failed("prompt_too_long"));
    }
    let prompt = append_amendment_context(
        assembled.prompt,
        deps,
        run_id,
        Phase::Analysis,
        ANALYSIS_PROMPT_TOKENS,
    );

    let result = deps
        .wf
        .dispatcher
        .dispatch(DispatchRequest {
            prompt,
            agent: "analysis".into(),
            task_type: "analysis".into(),
            timeout: None,
            output_schema: Some(analysis_schema()),
        })
        .await?;

    let usage = result.token_estimate;
    if let Err(e) = deps.wf.db.add_token_usage(
        run_id,
        TokenUsageEntry {
            phase: "analysis".into(),
            agent: "analysis".into(),
            input_tokens: usage.input,
            output_tokens: usage.output,
            cost_usd: dispatch_cost_usd(usage.input, usage.output),
            metadata_json: None,
        },
    ) {
        tracing::warn!(error = %e, "failed to record analysis token usage");
    }

    let Some(parsed) = result.parsed else {
        return Ok(PhaseOutcome {
            success: false,
            decisions: 0,
            error: Some("schema_validation_failed".into()),
            gaps: Vec::new(),
        });
    };

    let mut decisions = 0;
    for key in BRIEF_KEYS {
        let value = match field(&parsed, key) {
            Some(serde_yaml::Value::Sequence(entries)) => serde_json::to_string(
                &entries
                    .iter()
                    .filter_map(crate::dispatch::schema::as_string)
                    .collect::<Vec<_>>(),
            )?,
            Some(_) => str_field(&parsed, key).unwrap_or_default(),
            None => continue,
        };
        deps.wf
            .db
            .upsert_decision(run_id, "analysis", "product-brief", key, &value, None)?;
        decisions += 1;
    }

    info!(run = %run_id, decisions, "product brief persisted");
    Ok(PhaseOutcome::success(decisions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::ScriptedDispatcher;
    use crate::events::EventBus;
    use crate::orchestrator::OrchestratorConfig;
    use crate::pack::FilePack;
    use crate::store::DecisionStore;
    use crate::workflows::WorkflowDeps;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn deps(dispatcher: ScriptedDispatcher) -> PhaseDeps {
        PhaseDeps {
            wf: WorkflowDeps {
                db: Arc::new(DecisionStore::open_in_memory().unwrap()),
                pack: Arc::new(FilePack::new(PathBuf::from("/nonexistent"))),
                dispatcher: Arc::new(dispatcher),
                project_root: PathBuf::from("/tmp"),
            },
            bus: EventBus::new(),
            orch_config: OrchestratorConfig::default(),
            pack_root: PathBuf::from("/tmp"),
        }
    }

    const BRIEF_REPLY: &str = "```yaml\nproblem_statement: teams ship slowly\ntarget_users: product engineers\ncore_features:\n  - pipeline orchestration\n  - review gating\nsuccess_metrics:\n  - lead time under a day\nconstraints:\n  - single machine\n```";

    fn config_with_concept() -> RunConfig {
        RunConfig {
            concept: Some("an autonomous delivery pipeline".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_brief_persisted_as_decisions() {
        let deps = deps(ScriptedDispatcher::completing(BRIEF_REPLY));
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();

        let outcome = run_analysis(&deps, &run.id, &config_with_concept())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.decisions, 5);

        let statement = deps
            .wf
            .db
            .find_decision(&run.id, "analysis", "product-brief", "problem_statement")
            .unwrap()
            .unwrap();
        assert_eq!(statement.value, "teams ship slowly");

        let features = deps
            .wf
            .db
            .find_decision(&run.id, "analysis", "product-brief", "core_features")
            .unwrap()
            .unwrap();
        assert!(features.value.contains("pipeline orchestration"));
    }

    #[tokio::test]
    async fn test_retry_does_not_duplicate_brief() {
        let deps = deps(ScriptedDispatcher::completing(BRIEF_REPLY));
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();

        run_analysis(&deps, &run.id, &config_with_concept()).await.unwrap();
        run_analysis(&deps, &run.id, &config_with_concept()).await.unwrap();

        let decisions = deps
            .wf
            .db
            .get_decisions_by_phase_for_run(&run.id, "analysis")
            .unwrap();
        assert_eq!(decisions.len(), 5);
    }

    #[tokio::test]
    async fn test_schema_failure_fails_phase() {
        let deps = deps(ScriptedDispatcher::completing("nothing structured"));
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();

        let outcome = run_analysis(&deps, &run.id, &config_with_concept())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("schema_validation_failed"));
    }

    #[tokio::test]
    async fn test_missing_concept_fails_without_dispatch() {
        let dispatcher = ScriptedDispatcher::completing(BRIEF_REPLY);
        let requests = dispatcher.requests();
        let deps = deps(dispatcher);
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();

        let outcome = run_analysis(&deps, &run.id, &RunConfig::default())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_usage_recorded() {
        let deps = deps(ScriptedDispatcher::completing(BRIEF_REPLY));
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();

        run_analysis(&deps, &run.id, &config_with_concept()).await.unwrap();
        let totals = deps.wf.db.get_token_usage_summary(&run.id).unwrap();
        assert_eq!(totals.by_phase_agent.len(), 1);
        assert_eq!(totals.by_phase_agent[0].phase, "analysis");
        assert!(totals.input_tokens > 0);
    }
}
