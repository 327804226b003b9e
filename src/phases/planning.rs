//! Planning phase: product brief → requirements, stories, tech stack.

use anyhow::Result;
use serde_yaml::Value;
use tracing::info;

use super::{PLANNING_PROMPT_TOKENS, Phase, PhaseDeps, PhaseOutcome, append_amendment_context};
use crate::dispatch::DispatchRequest;
use crate::dispatch::schema::{as_string, field, planning_schema, str_field};
use crate::pack::TEMPLATE_PLANNING;
use crate::prompt::{Section, assemble_prompt};
use crate::store::RequirementType;
use crate::store::db::TokenUsageEntry;
use crate::util::dispatch_cost_usd;

fn format_product_brief(deps: &PhaseDeps, run_id: &str) -> Result<String> {
    let decisions = deps
        .wf
        .db
        .get_decisions_by_phase_for_run(run_id, "analysis")?;
    let mut brief = String::new();
    for decision in decisions {
        if decision.category == "product-brief" {
            brief.push_str(&format!("{}: {}\n", decision.key, decision.value));
        }
    }
    Ok(brief)
}

/// An FR/NFR entry may be a plain string or a `{description, priority}`
/// mapping.
fn requirement_entry(value: &Value) -> Option<(String, String)> {
    if let Some(s) = as_string(value) {
        return Some((s, "should".to_string()));
    }
    let description = str_field(value, "description")?;
    let priority = str_field(value, "priority").unwrap_or_else(|| "should".into());
    Some((description, priority))
}

pub async fn run_planning(deps: &PhaseDeps, run_id: &str) -> Result<PhaseOutcome> {
    let brief = format_product_brief(deps, run_id)?;
    if brief.is_empty() {
        return Ok(PhaseOutcome::failed(
            "no product brief; analysis must run first",
        ));
    }

    let template = deps.wf.pack.template(TEMPLATE_PLANNING)?;
    let assembled = assemble_prompt(
        &template,
        &[Section::required("product_brief", brief)],
        PLANNING_PROMPT_TOKENS,
    );
    // The planning budget is strict: an oversize prompt is an error, not a
    // dispatch.
    if assembled.token_count > PLANNING_PROMPT_TOKENS {
        return Ok(PhaseOutcome::failed("prompt_too_long"));
    }
    let prompt = append_amendment_context(
        assembled.prompt,
        deps,
        run_id,
        Phase::Planning,
        PLANNING_PROMPT_TOKENS,
    );

    let result = deps
        .wf
        .dispatcher
        .dispatch(DispatchRequest {
            prompt,
            agent: "planning".into(),
            task_type: "planning".into(),
            timeout: None,
            output_schema: Some(planning_schema()),
        })
        .await?;

    let usage = result.token_estimate;
    if let Err(e) = deps.wf.db.add_token_usage(
        run_id,
        TokenUsageEntry {
            phase: "planning".into(),
            agent: "planning".into(),
            input_tokens: usage.input,
            output_tokens: usage.output,
            cost_usd: dispatch_cost_usd(usage.input, usage.output),
            metadata_json: None,
        },
    ) {
        tracing::warn!(error = %e, "failed to record planning token usage");
    }

    let Some(parsed) = result.parsed else {
        return Ok(PhaseOutcome {
            success: false,
            decisions: 0,
            error: Some("schema_validation_failed".into()),
            gaps: Vec::new(),
        });
    };

    let db = &deps.wf.db;
    let mut decisions = 0;

    if let Some(frs) = field(&parsed, "functional_requirements").and_then(|v| v.as_sequence()) {
        for (i, entry) in frs.iter().enumerate() {
            let Some((description, priority)) = requirement_entry(entry) else {
                continue;
            };
            let key = format!("FR-{}", i + 1);
            let existed = db
                .find_decision(run_id, "planning", "functional-requirements", &key)?
                .is_some();
            db.upsert_decision(run_id, "planning", "functional-requirements", &key, &description, None)?;
            if !existed {
                db.create_requirement(
                    run_id,
                    "planning-phase",
                    RequirementType::Functional,
                    &description,
                    &priority,
                )?;
            }
            decisions += 1;
        }
    }

    if let Some(nfrs) = field(&parsed, "non_functional_requirements").and_then(|v| v.as_sequence())
    {
        for (i, entry) in nfrs.iter().enumerate() {
            let Some((description, _)) = requirement_entry(entry) else {
                continue;
            };
            let key = format!("NFR-{}", i + 1);
            let existed = db
                .find_decision(run_id, "planning", "non-functional-requirements", &key)?
                .is_some();
            db.upsert_decision(run_id, "planning", "non-functional-requirements", &key, &description, None)?;
            if !existed {
                db.create_requirement(
                    run_id,
                    "planning-phase",
                    RequirementType::NonFunctional,
                    &description,
                    "should",
                )?;
            }
            decisions += 1;
        }
    }

    if let Some(stack) = field(&parsed, "tech_stack").and_then(|v| v.as_mapping()) {
        for (key, value) in stack {
            let (Some(key), Some(value)) = (as_string(key), as_string(value)) else {
                continue;
            };
            db.upsert_decision(run_id, "planning", "tech-stack", &key, &value, None)?;
            decisions += 1;
        }
    }

    if let Some(stories) = field(&parsed, "user_stories").and_then(|v| v.as_sequence()) {
        for (i, entry) in stories.iter().enumerate() {
            let Some(story) = as_string(entry) else { continue };
            let key = format!("US-{}", i + 1);
            db.upsert_decision(run_id, "planning", "user-stories", &key, &story, None)?;
            decisions += 1;
        }
    }

    if let Some(model) = field(&parsed, "domain_model") {
        let entities = field(model, "entities")
            .map(|v| serde_yaml::to_string(v).unwrap_or_default())
            .unwrap_or_else(|| serde_yaml::to_string(model).unwrap_or_default());
        db.upsert_decision(run_id, "planning", "domain-model", "entities", entities.trim(), None)?;
        decisions += 1;
    }

    db.register_artifact(
        run_id,
        "planning",
        "prd",
        "decision-store://planning/prd",
        Some(&format!("{decisions} planning decisions")),
    )?;

    info!(run = %run_id, decisions, "planning persisted");
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

    fn seeded_run(deps: &PhaseDeps) -> String {
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();
        deps.wf
            .db
            .upsert_decision(
                &run.id,
                "analysis",
                "product-brief",
                "problem_statement",
                "teams ship slowly",
                None,
            )
            .unwrap();
        run.id
    }

    const PLAN_REPLY: &str = "```yaml\nfunctional_requirements:\n  - description: users can start a pipeline run\n    priority: must\n  - description: runs are resumable after restart\n    priority: should\nnon_functional_requirements:\n  - description: status queries answer within a second\nuser_stories:\n  - as an operator, I want to resume a run, so that crashes are cheap\ntech_stack:\n  language: rust\n  storage: sqlite\ndomain_model:\n  entities:\n    - PipelineRun\n    - Decision\nout_of_scope:\n  - multi-tenant hosting\n```";

    #[tokio::test]
    async fn test_planning_persists_every_category() {
        let deps = deps(ScriptedDispatcher::completing(PLAN_REPLY));
        let run_id = seeded_run(&deps);

        let outcome = run_planning(&deps, &run_id).await.unwrap();
        assert!(outcome.success);

        let db = &deps.wf.db;
        let fr1 = db
            .find_decision(&run_id, "planning", "functional-requirements", "FR-1")
            .unwrap()
            .unwrap();
        assert_eq!(fr1.value, "users can start a pipeline run");
        assert!(
            db.find_decision(&run_id, "planning", "non-functional-requirements", "NFR-1")
                .unwrap()
                .is_some()
        );
        let stack = db
            .find_decision(&run_id, "planning", "tech-stack", "language")
            .unwrap()
            .unwrap();
        assert_eq!(stack.value, "rust");
        assert!(
            db.find_decision(&run_id, "planning", "user-stories", "US-1")
                .unwrap()
                .is_some()
        );
        let model = db
            .find_decision(&run_id, "planning", "domain-model", "entities")
            .unwrap()
            .unwrap();
        assert!(model.value.contains("PipelineRun"));
    }

    #[tokio::test]
    async fn test_requirements_created_with_types() {
        let deps = deps(ScriptedDispatcher::completing(PLAN_REPLY));
        let run_id = seeded_run(&deps);
        run_planning(&deps, &run_id).await.unwrap();

        let requirements = deps.wf.db.get_requirements_for_run(&run_id).unwrap();
        let functional: Vec<_> = requirements
            .iter()
            .filter(|r| r.requirement_type == RequirementType::Functional)
            .collect();
        assert_eq!(functional.len(), 2);
        assert_eq!(functional[0].priority, "must");
        assert!(
            requirements
                .iter()
                .any(|r| r.requirement_type == RequirementType::NonFunctional
                    && r.priority == "should")
        );
    }

    #[tokio::test]
    async fn test_prd_artifact_registered() {
        let deps = deps(ScriptedDispatcher::completing(PLAN_REPLY));
        let run_id = seeded_run(&deps);
        run_planning(&deps, &run_id).await.unwrap();

        let artifact = deps
            .wf
            .db
            .get_artifact_by_type_for_run(&run_id, "prd")
            .unwrap()
            .expect("prd artifact");
        assert_eq!(artifact.phase, "planning");
        assert!(artifact.path.starts_with("decision-store://"));
    }

    #[tokio::test]
    async fn test_oversize_brief_is_prompt_too_long() {
        let dispatcher = ScriptedDispatcher::completing(PLAN_REPLY);
        let requests = dispatcher.requests();
        let deps = deps(dispatcher);
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();
        deps.wf
            .db
            .upsert_decision(
                &run.id,
                "analysis",
                "product-brief",
                "problem_statement",
                &"x".repeat(20_000),
                None,
            )
            .unwrap();

        let outcome = run_planning(&deps, &run.id).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("prompt_too_long"));
        assert!(requests.lock().unwrap().is_empty(), "no dispatch on oversize");
    }

    #[tokio::test]
    async fn test_missing_brief_fails() {
        let deps = deps(ScriptedDispatcher::completing(PLAN_REPLY));
        let run = deps.wf.db.create_pipeline_run("bmad", "{}").unwrap();
        let outcome = run_planning(&deps, &run.id).await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_retry_upserts_without_duplicates() {
        let deps = deps(ScriptedDispatcher::completing(PLAN_REPLY));
        let run_id = seeded_run(&deps);
        run_planning(&deps, &run_id).await.unwrap();
        run_planning(&deps, &run_id).await.unwrap();

        let planning = deps
            .wf
            .db
            .get_decisions_by_phase_for_run(&run_id, "planning")
            .unwrap();
        let fr_count = planning
            .iter()
            .filter(|d| d.category == "functional-requirements")
            .count();
        assert_eq!(fr_count, 2);

        // Requirements are not upserted, so the retry must not mint more.
        let requirements = deps.wf.db.get_requirements_for_run(&run_id).unwrap();
        assert_eq!(requirements.len(), 3);
    }
}
