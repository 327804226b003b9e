//! The story state machine and the bounded conflict-group pool.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::state::{
    DecompositionMetrics, OrchestratorState, StatusSnapshot, StoryPhase, StoryState,
};
use super::{OrchestratorConfig, PauseGate};
use crate::dispatch::{DispatchRequest, TokenEstimate};
use crate::events::{Event, EventBus, IssueSummary, StepKind, StepStatus};
use crate::pack::{TEMPLATE_MAJOR_REWORK, TEMPLATE_MINOR_FIXES};
use crate::prompt::{Section, assemble_prompt};
use crate::store::db::{RunUpdate, TokenUsageEntry};
use crate::story::batch::TaskBatch;
use crate::story::{ConflictRules, StoryScope, analyze_story, plan_task_batches};
use crate::util::{dispatch_cost_usd, parse_rfc3339};
use crate::workflows::{
    CodeReviewInput, CodeReviewReport, CreateStoryInput, CreateStoryOutcome, DevStoryInput,
    ReviewIssue, ReviewVerdict, StepResult, WorkflowDeps, run_code_review, run_create_story,
    run_dev_story,
};

const FIX_PROMPT_TOKENS: usize = 24_000;

struct Inner {
    state: OrchestratorState,
    stories: BTreeMap<String, StoryState>,
    stall_warned: HashSet<(String, &'static str)>,
}

struct OrchCtx {
    deps: WorkflowDeps,
    bus: EventBus,
    config: OrchestratorConfig,
    gate: PauseGate,
    run_id: Option<String>,
    inner: Arc<Mutex<Inner>>,
}

pub struct ImplementationOrchestrator {
    deps: WorkflowDeps,
    bus: EventBus,
    config: OrchestratorConfig,
    gate: PauseGate,
    run_id: Option<String>,
    rules: Option<ConflictRules>,
    inner: Arc<Mutex<Inner>>,
}

impl ImplementationOrchestrator {
    pub fn new(deps: WorkflowDeps, bus: EventBus, config: OrchestratorConfig) -> Self {
        Self {
            deps,
            bus,
            config,
            gate: PauseGate::new(),
            run_id: None,
            rules: None,
            inner: Arc::new(Mutex::new(Inner {
                state: OrchestratorState::Idle,
                stories: BTreeMap::new(),
                stall_warned: HashSet::new(),
            })),
        }
    }

    pub fn with_run_id(mut self, run_id: String) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_conflict_rules(mut self, rules: ConflictRules) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Shared context handed to story workers. All fields are cheap
    /// clones over the same underlying state.
    fn ctx(&self) -> Arc<OrchCtx> {
        Arc::new(OrchCtx {
            deps: self.deps.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            gate: self.gate.clone(),
            run_id: self.run_id.clone(),
            inner: self.inner.clone(),
        })
    }

    pub fn status(&self) -> StatusSnapshot {
        self.ctx().snapshot()
    }

    /// Install the pause gate. Phases already in flight finish; every
    /// not-yet-started phase waits.
    pub fn pause(&self) {
        self.gate.pause();
        {
            let mut inner = self.inner.lock().expect("orchestrator lock");
            if inner.state == OrchestratorState::Running {
                inner.state = OrchestratorState::Paused;
            }
        }
        self.bus.publish(Event::Paused);
        self.ctx().persist();
    }

    pub fn resume(&self) {
        self.gate.resume();
        {
            let mut inner = self.inner.lock().expect("orchestrator lock");
            if inner.state == OrchestratorState::Paused {
                inner.state = OrchestratorState::Running;
            }
        }
        self.bus.publish(Event::Resumed);
        self.ctx().persist();
    }

    /// Run the pipeline over the given story keys. Calling while already
    /// running (or after completion) is a no-op returning current status.
    pub async fn run(&self, story_keys: Vec<String>) -> Result<StatusSnapshot> {
        let ctx = self.ctx();
        {
            let mut inner = self.inner.lock().expect("orchestrator lock");
            if inner.state != OrchestratorState::Idle {
                drop(inner);
                return Ok(ctx.snapshot());
            }
            inner.state = OrchestratorState::Running;
            for key in &story_keys {
                inner.stories.insert(key.clone(), StoryState::pending());
            }
        }
        ctx.persist();

        self.bus.publish(Event::PipelineStart {
            run_id: self.run_id.clone().unwrap_or_default(),
            stories: story_keys.clone(),
            concurrency: self.config.max_concurrency,
        });

        let groups = match &self.rules {
            Some(rules) => rules.partition(&story_keys),
            None => ConflictRules::by_epic(&story_keys).partition(&story_keys),
        };
        info!(
            stories = story_keys.len(),
            groups = groups.len(),
            concurrency = self.config.max_concurrency,
            "implementation run starting"
        );

        let heartbeat = spawn_heartbeat(ctx.clone());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut pool: JoinSet<Result<()>> = JoinSet::new();
        for group in groups {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            pool.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow::anyhow!("group pool semaphore closed"))?;
                for key in &group.keys {
                    run_story(&ctx, key).await?;
                }
                Ok(())
            });
        }

        let mut pool_error: Option<anyhow::Error> = None;
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "conflict group worker failed");
                    pool_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "conflict group worker panicked");
                    pool_error.get_or_insert(anyhow::anyhow!(e));
                }
            }
        }
        heartbeat.abort();

        let final_state = if pool_error.is_some() {
            OrchestratorState::Failed
        } else {
            OrchestratorState::Complete
        };
        ctx.set_state(final_state);
        ctx.persist();

        let snapshot = ctx.snapshot();
        let succeeded = snapshot.completed();
        let escalated = snapshot.escalated();
        let failed: Vec<String> = snapshot
            .stories
            .keys()
            .filter(|k| !succeeded.contains(k) && !escalated.contains(k))
            .cloned()
            .collect();
        info!(
            total = snapshot.stories.len(),
            completed = succeeded.len(),
            escalated = escalated.len(),
            failed = failed.len(),
            "implementation run settled"
        );
        self.bus.publish(Event::PipelineComplete {
            succeeded,
            failed,
            escalated,
        });

        Ok(snapshot)
    }
}

impl OrchCtx {
    fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.lock().expect("orchestrator lock");
        StatusSnapshot {
            state: inner.state,
            pipeline_run_id: self.run_id.clone(),
            stories: inner.stories.clone(),
            pid: std::process::id(),
            child_pids: Vec::new(),
        }
    }

    fn set_state(&self, state: OrchestratorState) {
        let mut inner = self.inner.lock().expect("orchestrator lock");
        // Pausing a finished run must not resurrect it.
        if inner.state == OrchestratorState::Complete || inner.state == OrchestratorState::Failed {
            return;
        }
        inner.state = state;
    }

    /// Serialize the snapshot into the run row. Failures here are warned,
    /// never fatal: the in-memory state machine keeps going.
    fn persist(&self) {
        let Some(run_id) = &self.run_id else { return };
        let snapshot = self.snapshot();
        if let Err(e) = self.deps.db.update_pipeline_run(
            run_id,
            RunUpdate {
                token_usage_json: Some(snapshot.to_json()),
                ..Default::default()
            },
        ) {
            warn!(error = %e, "failed to persist orchestrator snapshot");
        }
    }

    fn with_story(&self, key: &str, f: impl FnOnce(&mut StoryState)) {
        let mut inner = self.inner.lock().expect("orchestrator lock");
        if let Some(story) = inner.stories.get_mut(key) {
            f(story);
        }
    }

    /// Gate-aware phase transition; persists the snapshot afterwards.
    async fn transition(&self, key: &str, phase: StoryPhase) {
        self.gate.wait_ready().await;
        self.with_story(key, |story| story.transition(phase));
        self.persist();
    }

    fn record_usage(&self, agent: &str, usage: TokenEstimate, metadata: serde_json::Value) {
        let Some(run_id) = &self.run_id else { return };
        let entry = TokenUsageEntry {
            phase: "implementation".into(),
            agent: agent.into(),
            input_tokens: usage.input,
            output_tokens: usage.output,
            cost_usd: dispatch_cost_usd(usage.input, usage.output),
            metadata_json: Some(metadata.to_string()),
        };
        if let Err(e) = self.deps.db.add_token_usage(run_id, entry) {
            warn!(agent, error = %e, "failed to record token usage");
        }
    }

    fn story_counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().expect("orchestrator lock");
        let mut active = 0;
        let mut completed = 0;
        let mut queued = 0;
        for story in inner.stories.values() {
            if story.phase.is_terminal() {
                completed += 1;
            } else if story.phase.is_in_flight() {
                active += 1;
            } else {
                queued += 1;
            }
        }
        (active, completed, queued)
    }
}

fn spawn_heartbeat(ctx: Arc<OrchCtx>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.config.heartbeat_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let (active, completed, queued) = ctx.story_counts();
            ctx.bus.publish(Event::Heartbeat {
                run_id: ctx.run_id.clone().unwrap_or_default(),
                active,
                completed,
                queued,
            });

            // Stall detection: a phase without a transition past the
            // deadline is reported once per (story, phase).
            let stalled: Vec<(String, &'static str, u64)> = {
                let mut inner = ctx.inner.lock().expect("orchestrator lock");
                let now = chrono::Utc::now();
                let timeout = ctx.config.stall_timeout;
                let mut found = Vec::new();
                for (key, story) in &inner.stories {
                    if !story.phase.is_in_flight() {
                        continue;
                    }
                    let Some(updated) = parse_rfc3339(&story.updated_at) else {
                        continue;
                    };
                    let elapsed = (now - updated).to_std().unwrap_or_default();
                    if elapsed > timeout {
                        found.push((key.clone(), story.phase.as_str(), elapsed.as_millis() as u64));
                    }
                }
                found.retain(|(key, phase, _)| inner.stall_warned.insert((key.clone(), phase)));
                found
            };
            for (story_key, phase, elapsed_ms) in stalled {
                warn!(story = %story_key, phase, elapsed_ms, "story phase stalled");
                ctx.bus.publish(Event::StoryStall {
                    run_id: ctx.run_id.clone().unwrap_or_default(),
                    story_key,
                    phase: phase.to_string(),
                    elapsed_ms,
                });
            }
        }
    })
}

fn escalate(
    ctx: &OrchCtx,
    key: &str,
    last_verdict: &str,
    cycles: u32,
    issues: &[ReviewIssue],
    error: Option<String>,
) {
    ctx.with_story(key, |story| {
        story.transition(StoryPhase::Escalated);
        story.last_verdict = Some(last_verdict.to_string());
        story.review_cycles = cycles;
        story.error = error;
    });
    ctx.persist();
    warn!(story = %key, verdict = last_verdict, cycles, "story escalated");
    ctx.bus.publish(Event::StoryEscalation {
        key: key.to_string(),
        reason: last_verdict.to_string(),
        cycles,
        issues: issues
            .iter()
            .map(|i| IssueSummary {
                severity: i.severity.as_str().to_string(),
                file: i.file.clone(),
                desc: i.description.clone(),
            })
            .collect(),
    });
}

fn story_phase_event(
    ctx: &OrchCtx,
    key: &str,
    phase: StepKind,
    status: StepStatus,
    verdict: Option<String>,
    file: Option<String>,
) {
    ctx.bus.publish(Event::StoryPhase {
        key: key.to_string(),
        phase,
        status,
        verdict,
        file,
    });
}

fn resolve_story_path(ctx: &OrchCtx, story_file: &str) -> PathBuf {
    let path = PathBuf::from(story_file);
    if path.is_absolute() {
        path
    } else {
        ctx.deps.project_root.join(path)
    }
}

/// Outcome of the dev stage: accumulated files plus per-batch scoping for
/// the first review pass.
struct DevStageResult {
    files: Vec<String>,
    batch_files: Option<Vec<Vec<String>>>,
    batch_count: usize,
}

async fn run_story(ctx: &Arc<OrchCtx>, key: &str) -> Result<()> {
    // 1. Create the story file.
    ctx.transition(key, StoryPhase::InStoryCreation).await;
    story_phase_event(ctx, key, StepKind::CreateStory, StepStatus::InProgress, None, None);

    let epic = key.split('-').next().unwrap_or_default().to_string();
    let created = run_create_story(
        &ctx.deps,
        CreateStoryInput {
            epic_id: epic,
            story_key: key.to_string(),
            pipeline_run_id: ctx.run_id.clone(),
        },
    )
    .await;

    let story_file = match created {
        Ok(outcome) => {
            ctx.record_usage(
                "create-story",
                outcome.token_usage(),
                json!({"storyKey": key}),
            );
            match outcome {
                CreateStoryOutcome::Success { story_file, .. } => {
                    ctx.with_story(key, |story| story.story_file = Some(story_file.clone()));
                    story_phase_event(
                        ctx,
                        key,
                        StepKind::CreateStory,
                        StepStatus::Complete,
                        None,
                        Some(story_file.clone()),
                    );
                    story_file
                }
                CreateStoryOutcome::Failure { error, .. } => {
                    story_phase_event(ctx, key, StepKind::CreateStory, StepStatus::Failed, None, None);
                    escalate(ctx, key, "create-story-failed", 0, &[], Some(error));
                    return Ok(());
                }
            }
        }
        Err(e) => {
            story_phase_event(ctx, key, StepKind::CreateStory, StepStatus::Failed, None, None);
            escalate(ctx, key, "create-story-failed", 0, &[], Some(e.to_string()));
            return Ok(());
        }
    };

    // 2. Implement.
    ctx.transition(key, StoryPhase::InDev).await;
    let story_path = resolve_story_path(ctx, &story_file);
    let dev = run_dev_stage(ctx, key, &story_path).await;
    ctx.with_story(key, |story| story.files_modified = dev.files.clone());
    ctx.persist();

    // 3/4. Review loop.
    let mut previous_issues: Option<Vec<ReviewIssue>> = None;
    let mut cycles: u32 = 0;
    loop {
        ctx.transition(key, StoryPhase::InReview).await;
        story_phase_event(ctx, key, StepKind::CodeReview, StepStatus::InProgress, None, None);

        let review = run_review_pass(ctx, key, &story_path, &dev, cycles, previous_issues.clone()).await;
        let review = match review {
            Ok(review) if review.result == StepResult::Success => review,
            Ok(review) => {
                story_phase_event(ctx, key, StepKind::CodeReview, StepStatus::Failed, None, None);
                escalate(ctx, key, "code-review-failed", cycles, &[], review.error);
                return Ok(());
            }
            Err(e) => {
                story_phase_event(ctx, key, StepKind::CodeReview, StepStatus::Failed, None, None);
                escalate(ctx, key, "code-review-failed", cycles, &[], Some(e.to_string()));
                return Ok(());
            }
        };

        cycles += 1;
        let verdict = review.verdict;
        ctx.with_story(key, |story| {
            story.review_cycles = cycles;
            story.last_verdict = Some(verdict.as_str().to_string());
        });
        ctx.persist();
        story_phase_event(
            ctx,
            key,
            StepKind::CodeReview,
            StepStatus::Complete,
            Some(verdict.as_str().to_string()),
            None,
        );

        match verdict {
            ReviewVerdict::ShipIt => {
                ctx.transition(key, StoryPhase::Complete).await;
                info!(story = %key, cycles, "story complete");
                ctx.bus.publish(Event::StoryDone {
                    key: key.to_string(),
                    result: "success".into(),
                    review_cycles: cycles,
                });
                return Ok(());
            }
            _ if cycles >= ctx.config.max_review_cycles => {
                escalate(ctx, key, verdict.as_str(), cycles, &review.issue_list, None);
                return Ok(());
            }
            _ => {
                ctx.transition(key, StoryPhase::NeedsFixes).await;
                story_phase_event(ctx, key, StepKind::Fix, StepStatus::InProgress, None, None);
                dispatch_fixes(ctx, key, &story_path, &dev.files, &review).await;
                story_phase_event(ctx, key, StepKind::Fix, StepStatus::Complete, None, None);
                previous_issues = Some(review.issue_list);
            }
        }
    }
}

async fn run_dev_stage(ctx: &Arc<OrchCtx>, key: &str, story_path: &PathBuf) -> DevStageResult {
    // Best-effort analysis: an unreadable story file degrades to a single
    // dev dispatch, which fails fast on its own.
    let large_story = std::fs::read_to_string(story_path)
        .ok()
        .map(|content| analyze_story(&content))
        .filter(|a| a.estimated_scope == StoryScope::Large);

    match large_story {
        None => {
            story_phase_event(ctx, key, StepKind::DevStory, StepStatus::InProgress, None, None);
            let report = run_dev_story(
                &ctx.deps,
                DevStoryInput {
                    story_key: key.to_string(),
                    story_file_path: story_path.clone(),
                    pipeline_run_id: ctx.run_id.clone(),
                    task_scope: None,
                    prior_files: Vec::new(),
                    timeout: Some(ctx.config.dev_story_timeout),
                },
            )
            .await;

            let mut files = Vec::new();
            match report {
                Ok(report) => {
                    ctx.record_usage(
                        "dev-story",
                        report.token_usage,
                        json!({"storyKey": key, "result": report.result}),
                    );
                    let status = if report.result.is_success() {
                        StepStatus::Complete
                    } else {
                        StepStatus::Failed
                    };
                    story_phase_event(ctx, key, StepKind::DevStory, status, None, None);
                    files = report.files_modified;
                }
                Err(e) => {
                    story_phase_event(ctx, key, StepKind::DevStory, StepStatus::Failed, None, None);
                    ctx.bus.publish(Event::StoryWarn {
                        key: key.to_string(),
                        msg: format!("dev-story dispatch error: {e}"),
                    });
                }
            }
            DevStageResult {
                files,
                batch_files: None,
                batch_count: 1,
            }
        }
        Some(analysis) => {
            let batches: Vec<TaskBatch> = plan_task_batches(&analysis);
            let metrics = DecompositionMetrics {
                total_tasks: analysis.task_count,
                batch_count: batches.len(),
                batch_sizes: batches.iter().map(|b| b.task_ids.len()).collect(),
            };
            info!(
                story = %key,
                tasks = metrics.total_tasks,
                batches = metrics.batch_count,
                "large story decomposed into batches"
            );
            ctx.with_story(key, |story| story.decomposition = Some(metrics));

            let mut files: Vec<String> = Vec::new();
            let mut batch_files: Vec<Vec<String>> = Vec::new();
            let batch_count = batches.len();
            for batch in batches {
                story_phase_event(ctx, key, StepKind::DevStory, StepStatus::InProgress, None, None);
                let prior_files = if batch.batch_index > 0 {
                    files.clone()
                } else {
                    Vec::new()
                };
                let report = run_dev_story(
                    &ctx.deps,
                    DevStoryInput {
                        story_key: key.to_string(),
                        story_file_path: story_path.clone(),
                        pipeline_run_id: ctx.run_id.clone(),
                        task_scope: Some(batch.scope_lines()),
                        prior_files,
                        timeout: Some(ctx.config.dev_story_timeout),
                    },
                )
                .await;

                // A failing batch never aborts the story: files gathered so
                // far are preserved and later batches still run.
                match report {
                    Ok(report) => {
                        ctx.record_usage(
                            "dev-story",
                            report.token_usage,
                            json!({
                                "storyKey": key,
                                "batchIndex": batch.batch_index,
                                "taskIds": batch.task_ids,
                                "result": report.result,
                            }),
                        );
                        info!(
                            story = %key,
                            batch = batch.batch_index,
                            task_ids = ?batch.task_ids,
                            tokens = report.token_usage.input + report.token_usage.output,
                            files = report.files_modified.len(),
                            result = ?report.result,
                            "dev batch finished"
                        );
                        let status = if report.result.is_success() {
                            StepStatus::Complete
                        } else {
                            StepStatus::Failed
                        };
                        story_phase_event(ctx, key, StepKind::DevStory, status, None, None);
                        let mut new_files = Vec::new();
                        for file in report.files_modified {
                            if !files.contains(&file) {
                                files.push(file.clone());
                            }
                            new_files.push(file);
                        }
                        batch_files.push(new_files);
                    }
                    Err(e) => {
                        story_phase_event(ctx, key, StepKind::DevStory, StepStatus::Failed, None, None);
                        ctx.bus.publish(Event::StoryWarn {
                            key: key.to_string(),
                            msg: format!("batch {} failed: {e}", batch.batch_index),
                        });
                        batch_files.push(Vec::new());
                    }
                }
                ctx.with_story(key, |story| story.files_modified = files.clone());
                ctx.persist();
            }
            DevStageResult {
                files,
                batch_files: Some(batch_files),
                batch_count,
            }
        }
    }
}

/// One review pass. The first pass of a batched story reviews each batch's
/// own files; later passes (and unbatched stories) review the accumulated
/// set. Reports are merged under the verdict law.
async fn run_review_pass(
    ctx: &Arc<OrchCtx>,
    key: &str,
    story_path: &PathBuf,
    dev: &DevStageResult,
    cycle: u32,
    previous_issues: Option<Vec<ReviewIssue>>,
) -> Result<CodeReviewReport> {
    let scopes: Vec<Option<Vec<String>>> = match (&dev.batch_files, cycle) {
        (Some(batch_files), 0) => {
            let scoped: Vec<Option<Vec<String>>> = batch_files
                .iter()
                .filter(|files| !files.is_empty())
                .map(|files| Some(files.clone()))
                .collect();
            if scoped.is_empty() {
                vec![Some(dev.files.clone())]
            } else {
                scoped
            }
        }
        _ => vec![Some(dev.files.clone())],
    };

    let mut merged: Option<CodeReviewReport> = None;
    for files in scopes {
        let report = run_code_review(
            &ctx.deps,
            CodeReviewInput {
                story_key: key.to_string(),
                story_file_path: story_path.clone(),
                pipeline_run_id: ctx.run_id.clone(),
                working_directory: None,
                files_modified: files,
                previous_issues: previous_issues.clone(),
            },
        )
        .await?;
        ctx.record_usage(
            "code-review",
            report.token_usage,
            json!({"storyKey": key, "cycle": cycle}),
        );
        if report.result == StepResult::Failed {
            return Ok(report);
        }
        merged = Some(match merged {
            None => report,
            Some(mut acc) => {
                acc.issue_list.extend(report.issue_list);
                acc.issues = acc.issue_list.len();
                acc.verdict = ReviewVerdict::from_issues(&acc.issue_list);
                acc
            }
        });
    }

    let report = merged.expect("at least one review scope");
    if dev.batch_files.is_some() {
        info!(
            story = %key,
            verdict = report.verdict.as_str(),
            issues = report.issues,
            decomposed = format!("{} batches", dev.batch_count),
            "review summary"
        );
    } else {
        info!(story = %key, verdict = report.verdict.as_str(), issues = report.issues, "review summary");
    }
    Ok(report)
}

/// Dispatch a schema-free fix prompt. Output is ignored; the next review
/// judges the effect.
async fn dispatch_fixes(
    ctx: &Arc<OrchCtx>,
    key: &str,
    story_path: &PathBuf,
    files: &[String],
    review: &CodeReviewReport,
) {
    let (template_name, task_type) = match review.verdict {
        ReviewVerdict::NeedsMajorRework => (TEMPLATE_MAJOR_REWORK, "major-rework"),
        _ => (TEMPLATE_MINOR_FIXES, "minor-fixes"),
    };

    let template = match ctx.deps.pack.template(template_name) {
        Ok(t) => t,
        Err(e) => {
            ctx.bus.publish(Event::StoryWarn {
                key: key.to_string(),
                msg: format!("fix template unavailable: {e}"),
            });
            return;
        }
    };

    let story_content = std::fs::read_to_string(story_path).unwrap_or_default();
    let issues = review
        .issue_list
        .iter()
        .map(|i| {
            let location = i
                .file
                .as_ref()
                .map(|f| match i.line {
                    Some(line) => format!(" ({f}:{line})"),
                    None => format!(" ({f})"),
                })
                .unwrap_or_default();
            format!("- [{}] {}{}", i.severity.as_str(), i.description, location)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let assembled = assemble_prompt(
        &template,
        &[
            Section::required("issues", issues),
            Section::important("story_content", story_content),
            Section::optional("files", files.join("\n")),
        ],
        FIX_PROMPT_TOKENS,
    );

    let result = ctx
        .deps
        .dispatcher
        .dispatch(DispatchRequest {
            prompt: assembled.prompt,
            agent: "fix".into(),
            task_type: format!("{task_type}-{key}"),
            timeout: Some(ctx.config.dev_story_timeout),
            output_schema: None,
        })
        .await;

    match result {
        Ok(result) => {
            ctx.record_usage(
                "fix",
                result.token_estimate,
                json!({"storyKey": key, "taskType": task_type}),
            );
        }
        Err(e) => {
            ctx.bus.publish(Event::StoryWarn {
                key: key.to_string(),
                msg: format!("fix dispatch error: {e}"),
            });
        }
    }
}
