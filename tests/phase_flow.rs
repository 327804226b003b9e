//! Phase orchestration scenarios: stop-after, resume, amendment.

use std::path::Path;
use std::sync::Arc;

use conductor::dispatch::testing::ScriptedDispatcher;
use conductor::events::EventBus;
use conductor::orchestrator::OrchestratorConfig;
use conductor::pack::FilePack;
use conductor::phases::{Phase, PhaseDeps, PhaseOrchestrator, RunConfig, StartOptions};
use conductor::store::{DecisionStatus, DecisionStore, RunStatus};
use conductor::workflows::WorkflowDeps;

const ANALYSIS_REPLY: &str = "```yaml\nproblem_statement: delivery is slow\ntarget_users: product teams\ncore_features:\n  - pipeline runs\nsuccess_metrics:\n  - fast lead time\nconstraints:\n  - single machine\n```";

const PLANNING_REPLY: &str = "```yaml\nfunctional_requirements:\n  - description: users can start a pipeline run\n    priority: must\nnon_functional_requirements:\n  - description: status answers fast\nuser_stories:\n  - as a user, I start a run\ntech_stack:\n  language: rust\ndomain_model:\n  entities:\n    - PipelineRun\n```";

const PLANNING_REPLY_AMENDED: &str = "```yaml\nfunctional_requirements:\n  - description: users can start a pipeline run from a saved concept\n    priority: must\nnon_functional_requirements: []\nuser_stories: []\ntech_stack:\n  language: rust\ndomain_model:\n  entities:\n    - PipelineRun\n```";

const ARCH_REPLY: &str = "```yaml\narchitecture_decisions:\n  - key: storage\n    decision: embedded sqlite\n```";

const STORIES_REPLY: &str = "```yaml\nepics:\n  - id: 1\n    title: Core\nstories:\n  - key: 1-1\n    epic: 1\n    title: Start pipeline runs\n    description: users start a pipeline run end to end\n    acceptance_criteria:\n      - AC1: run row is created\n```";

const DEV_REPLY: &str =
    "```yaml\nresult: success\nfiles_modified: [src/run.rs]\ntests: pass\n```";
const REVIEW_SHIP: &str = "```yaml\nverdict: SHIP_IT\nissues: 0\nissue_list: []\n```";

fn deps_with(db: Arc<DecisionStore>, dispatcher: ScriptedDispatcher, root: &Path) -> PhaseDeps {
    PhaseDeps {
        wf: WorkflowDeps {
            db,
            pack: Arc::new(FilePack::new(root.join("pack"))),
            dispatcher: Arc::new(dispatcher),
            project_root: root.to_path_buf(),
        },
        bus: EventBus::new(),
        orch_config: OrchestratorConfig::default(),
        pack_root: root.join("pack"),
    }
}

fn create_story_reply(dir: &Path, key: &str) -> String {
    let file = dir.join(format!("{key}.md"));
    std::fs::write(
        &file,
        format!("# Story {key}\n\n## Tasks\n\n- [ ] T1: build it (AC: #1)\n"),
    )
    .unwrap();
    format!(
        "```yaml\nresult: success\nstory_file: {}\nstory_key: {key}\nstory_title: scripted\n```",
        file.display()
    )
}

// ── S5: stop-after planning ───────────────────────────────────────────

#[tokio::test]
async fn s5_stop_after_planning_never_reaches_solutioning() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(DecisionStore::open_in_memory().unwrap());
    // Nothing scripted for solutioning: a dispatch there would fail the
    // phase and the final status would be `failed`, not `stopped`.
    let dispatcher = ScriptedDispatcher::new()
        .script("analysis", ANALYSIS_REPLY)
        .script("planning", PLANNING_REPLY);

    let orchestrator = PhaseOrchestrator::new(deps_with(db.clone(), dispatcher, dir.path()));
    let run = orchestrator
        .start_run(StartOptions {
            methodology: "bmad".into(),
            concept: Some("a delivery pipeline".into()),
            from: Phase::Analysis,
            stop_after: Some(Phase::Planning),
            stories: None,
            concurrency: None,
        })
        .unwrap();
    let report = orchestrator.execute_run(&run.id).await.unwrap();

    assert_eq!(report.status, RunStatus::Stopped);
    let summary = report.stopped_after.expect("stop summary");
    assert_eq!(summary.phase, "planning");
    assert!(summary.decisions_count > 0);
    assert_eq!(summary.run_id, run.id);

    let row = db.get_pipeline_run_by_id(&run.id).unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Stopped);

    // Analysis and planning both completed in history.
    let config = RunConfig::from_json(&row.config_json);
    assert!(config.is_phase_completed(Phase::Analysis));
    assert!(config.is_phase_completed(Phase::Planning));
    assert!(!config.is_phase_completed(Phase::Solutioning));
}

// ── S6: resume after restart ──────────────────────────────────────────

#[tokio::test]
async fn s6_resume_starts_at_next_pending_phase() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(DecisionStore::open_in_memory().unwrap());

    // First process: analysis + planning, then "killed" at the gate.
    let first = PhaseOrchestrator::new(deps_with(
        db.clone(),
        ScriptedDispatcher::new()
            .script("analysis", ANALYSIS_REPLY)
            .script("planning", PLANNING_REPLY),
        dir.path(),
    ));
    let run = first
        .start_run(StartOptions {
            methodology: "bmad".into(),
            concept: Some("a delivery pipeline".into()),
            from: Phase::Analysis,
            stop_after: Some(Phase::Planning),
            stories: None,
            concurrency: None,
        })
        .unwrap();
    first.execute_run(&run.id).await.unwrap();

    let before: Vec<_> = db
        .get_decisions_by_phase_for_run(&run.id, "planning")
        .unwrap()
        .into_iter()
        .map(|d| (d.id.clone(), d.value.clone()))
        .collect();
    assert!(!before.is_empty());

    // Second process: no analysis/planning scripts, so any re-dispatch of
    // those phases would fail the run.
    let second = PhaseOrchestrator::new(deps_with(
        db.clone(),
        ScriptedDispatcher::new()
            .script("architecture", ARCH_REPLY)
            .script("stories", STORIES_REPLY)
            .script("create-story", &create_story_reply(dir.path(), "1-1"))
            .script("dev-story", DEV_REPLY)
            .script("code-review", REVIEW_SHIP),
        dir.path(),
    ));
    let report = second.resume_run(Some(run.id.clone())).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    // Earlier phases' decisions are untouched: same ids, same values.
    let after: Vec<_> = db
        .get_decisions_by_phase_for_run(&run.id, "planning")
        .unwrap()
        .into_iter()
        .map(|d| (d.id, d.value))
        .collect();
    assert_eq!(before, after);
}

// ── S7: amendment supersession + delta document ───────────────────────

#[tokio::test]
async fn s7_amendment_supersedes_parent_and_writes_delta() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(DecisionStore::open_in_memory().unwrap());

    // Completed parent with an analysis brief and FR-1 = "old".
    let parent = db.create_pipeline_run("bmad", "{}").unwrap();
    db.upsert_decision(
        &parent.id,
        "analysis",
        "product-brief",
        "problem_statement",
        "delivery is slow",
        None,
    )
    .unwrap();
    let parent_fr = db
        .upsert_decision(
            &parent.id,
            "planning",
            "functional-requirements",
            "FR-1",
            "users can start a pipeline run",
            None,
        )
        .unwrap();
    db.update_pipeline_run(
        &parent.id,
        conductor::store::db::RunUpdate {
            status: Some(RunStatus::Completed),
            ..Default::default()
        },
    )
    .unwrap();

    let orchestrator = PhaseOrchestrator::new(deps_with(
        db.clone(),
        ScriptedDispatcher::new()
            .script("planning", PLANNING_REPLY_AMENDED)
            .script("architecture", ARCH_REPLY)
            .script("stories", STORIES_REPLY)
            .script("create-story", &create_story_reply(dir.path(), "1-1"))
            .script("dev-story", DEV_REPLY)
            .script("code-review", REVIEW_SHIP),
        dir.path(),
    ));
    let amendment = orchestrator
        .start_amendment(
            "runs should start from saved concepts".into(),
            Some(parent.id.clone()),
            Phase::Planning,
            None,
        )
        .unwrap();
    assert_eq!(amendment.parent_run_id.as_deref(), Some(parent.id.as_str()));

    // The skipped analysis phase was copied from the parent.
    let copied = db
        .get_decisions_by_phase_for_run(&amendment.id, "analysis")
        .unwrap();
    assert_eq!(copied.len(), 1);
    assert_eq!(copied[0].value, "delivery is slow");

    let report = orchestrator.execute_run(&amendment.id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    // Parent FR-1 is superseded and linked to the amendment decision.
    let new_fr = db
        .find_decision(&amendment.id, "planning", "functional-requirements", "FR-1")
        .unwrap()
        .unwrap();
    assert!(new_fr.value.contains("saved concept"));

    let old_fr = db
        .find_decision(&parent.id, "planning", "functional-requirements", "FR-1")
        .unwrap()
        .unwrap();
    assert_eq!(old_fr.id, parent_fr.id);
    assert_eq!(old_fr.status, DecisionStatus::Superseded);
    assert_eq!(old_fr.superseded_by.as_deref(), Some(new_fr.id.as_str()));

    // The delta document lists the change.
    let short_id: String = amendment.id.chars().take(8).collect();
    let delta_path = dir.path().join(format!("amendment-{short_id}.md"));
    let delta = std::fs::read_to_string(&delta_path).expect("delta document written");
    assert!(delta.contains("planning/functional-requirements/FR-1"));
    assert!(delta.contains("users can start a pipeline run"));
    assert!(delta.contains("saved concept"));
}
