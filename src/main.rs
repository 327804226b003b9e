use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use conductor::dispatch::SubprocessDispatcher;
use conductor::errors::PipelineError;
use conductor::events::EventBus;
use conductor::health::check_health;
use conductor::orchestrator::{OrchestratorConfig, StatusSnapshot};
use conductor::pack::FilePack;
use conductor::phases::{
    ExecutionReport, Phase, PhaseDeps, PhaseOrchestrator, StartOptions,
};
use conductor::render::{NdjsonRenderer, ProgressRenderer};
use conductor::store::{DecisionStore, RunStatus};
use conductor::story::is_valid_story_key;
use conductor::workflows::WorkflowDeps;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Autonomous software-delivery pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scaffold methodology artifacts and initialize the store
    Init {
        /// Methodology pack name
        #[arg(long, default_value = "bmad")]
        pack: String,
        /// Overwrite existing prompt templates
        #[arg(long)]
        force: bool,
    },
    /// Execute the pipeline
    Run {
        /// First phase to execute
        #[arg(long, default_value = "analysis")]
        from: String,
        /// Stop after this phase completes
        #[arg(long)]
        stop_after: Option<String>,
        /// Product concept text
        #[arg(long)]
        concept: Option<String>,
        /// Read the concept from a file
        #[arg(long, conflicts_with = "concept")]
        concept_file: Option<PathBuf>,
        /// Restrict implementation to these story keys (comma-separated)
        #[arg(long)]
        stories: Option<String>,
        /// Conflict groups running at once
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        output_format: OutputFormat,
        /// Emit NDJSON events on stdout
        #[arg(long)]
        events: bool,
    },
    /// Continue the last-or-named run from its next pending phase
    Resume {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        stop_after: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        output_format: OutputFormat,
    },
    /// Report the orchestrator status snapshot
    Status {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        output_format: OutputFormat,
    },
    /// Report pipeline health
    Health {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        output_format: OutputFormat,
    },
    /// Run an amendment against a completed parent run
    Amend {
        #[arg(long)]
        concept: String,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long, default_value = "planning")]
        from: String,
        #[arg(long)]
        stop_after: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        output_format: OutputFormat,
    },
}

fn conductor_dir(project_root: &Path) -> PathBuf {
    project_root.join(".conductor")
}

fn db_path(project_root: &Path) -> PathBuf {
    conductor_dir(project_root).join("pipeline.db")
}

fn open_store(project_root: &Path) -> Result<DecisionStore> {
    let path = db_path(project_root);
    if !path.exists() {
        return Err(PipelineError::NotInitialized { path }.into());
    }
    DecisionStore::open(&path)
}

/// The agent command line: `CONDUCTOR_AGENT_CMD` (whitespace-split) or the
/// stock Claude CLI in print mode.
fn agent_command() -> (String, Vec<String>) {
    match std::env::var("CONDUCTOR_AGENT_CMD") {
        Ok(raw) if !raw.trim().is_empty() => {
            let mut parts = raw.split_whitespace().map(String::from);
            let command = parts.next().unwrap_or_else(|| "claude".into());
            (command, parts.collect())
        }
        _ => ("claude".into(), vec!["--print".into()]),
    }
}

fn build_deps(project_root: &Path, concurrency: Option<usize>) -> Result<PhaseDeps> {
    let pack_root = conductor_dir(project_root);
    let db = Arc::new(open_store(project_root)?);
    let (command, base_args) = agent_command();
    let dispatcher =
        SubprocessDispatcher::new(command, base_args).with_log_dir(pack_root.join("logs"));

    let mut orch_config = OrchestratorConfig::default();
    if let Some(n) = concurrency {
        orch_config = orch_config.with_max_concurrency(n);
    }

    Ok(PhaseDeps {
        wf: WorkflowDeps {
            db,
            pack: Arc::new(FilePack::new(pack_root.clone())),
            dispatcher: Arc::new(dispatcher),
            project_root: project_root.to_path_buf(),
        },
        bus: EventBus::new(),
        orch_config,
        pack_root,
    })
}

fn attach_renderers(deps: &PhaseDeps, format: OutputFormat, events: bool) {
    if format == OutputFormat::Json || events {
        NdjsonRenderer::stdout().attach(&deps.bus);
    } else {
        ProgressRenderer::new().attach(&deps.bus);
    }
}

fn emit_result(format: OutputFormat, result: std::result::Result<serde_json::Value, String>) -> i32 {
    match (format, result) {
        (OutputFormat::Json, Ok(data)) => {
            println!("{}", json!({"success": true, "data": data}));
            0
        }
        (OutputFormat::Json, Err(error)) => {
            println!("{}", json!({"success": false, "error": error}));
            1
        }
        (OutputFormat::Human, Ok(_)) => 0,
        (OutputFormat::Human, Err(error)) => {
            eprintln!("error: {error}");
            1
        }
    }
}

fn report_to_result(
    format: OutputFormat,
    report: &ExecutionReport,
) -> std::result::Result<serde_json::Value, String> {
    match report.status {
        RunStatus::Completed => {
            if format == OutputFormat::Human {
                println!("Pipeline run {} completed.", report.run_id);
            }
            Ok(json!({"run_id": report.run_id, "status": "completed"}))
        }
        RunStatus::Stopped => {
            if let Some(summary) = &report.stopped_after {
                if format == OutputFormat::Human {
                    println!(
                        "Phase {} complete ({} decisions, {} -> {}). Run {} stopped as requested.",
                        summary.phase,
                        summary.decisions_count,
                        summary.started_at,
                        summary.completed_at,
                        summary.run_id
                    );
                }
                return Ok(json!({
                    "run_id": report.run_id,
                    "status": "stopped",
                    "stopped_after": summary,
                }));
            }
            Ok(json!({"run_id": report.run_id, "status": "stopped"}))
        }
        _ => Err(format!(
            "phase {} failed: {}",
            report
                .failed_phase
                .map(|p| p.as_str())
                .unwrap_or("unknown"),
            report.error.as_deref().unwrap_or("unknown error")
        )),
    }
}

/// Output format of the invoked subcommand, for error reporting that
/// happens before the command body runs.
fn output_format_of(command: &Commands) -> OutputFormat {
    match command {
        Commands::Init { .. } => OutputFormat::Human,
        Commands::Run { output_format, .. }
        | Commands::Resume { output_format, .. }
        | Commands::Status { output_format, .. }
        | Commands::Health { output_format, .. }
        | Commands::Amend { output_format, .. } => *output_format,
    }
}

fn parse_stories(raw: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        if !is_valid_story_key(key) {
            return Err(PipelineError::MalformedStoryKey { key: key.into() }.into());
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_root = cli
        .project_root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let format = output_format_of(&cli.command);
    let code = match run_command(cli, &project_root).await {
        Ok(code) => code,
        Err(e) => emit_result(format, Err(format!("{e:#}"))),
    };
    std::process::exit(code);
}

async fn run_command(cli: Cli, project_root: &Path) -> Result<i32> {
    match cli.command {
        Commands::Init { pack, force } => cmd_init(project_root, &pack, force),
        Commands::Run {
            from,
            stop_after,
            concept,
            concept_file,
            stories,
            concurrency,
            output_format,
            events,
        } => {
            let concept = match (concept, concept_file) {
                (Some(text), _) => Some(text),
                (None, Some(path)) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                (None, None) => None,
            };
            let stories = stories.as_deref().map(parse_stories).transpose()?;
            cmd_run(
                project_root,
                &from,
                stop_after.as_deref(),
                concept,
                stories,
                concurrency,
                output_format,
                events,
            )
            .await
        }
        Commands::Resume {
            run_id,
            stop_after,
            concurrency,
            output_format,
        } => cmd_resume(project_root, run_id, stop_after.as_deref(), concurrency, output_format).await,
        Commands::Status {
            run_id,
            output_format,
        } => cmd_status(project_root, run_id.as_deref(), output_format),
        Commands::Health {
            run_id,
            output_format,
        } => cmd_health(project_root, run_id.as_deref(), output_format),
        Commands::Amend {
            concept,
            run_id,
            from,
            stop_after,
            output_format,
        } => cmd_amend(project_root, concept, run_id, &from, stop_after.as_deref(), output_format).await,
    }
}

fn cmd_init(project_root: &Path, pack_name: &str, force: bool) -> Result<i32> {
    let dir = conductor_dir(project_root);
    let existed = dir.exists();
    std::fs::create_dir_all(dir.join("logs"))
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let pack = FilePack::new(dir.clone());
    pack.scaffold(force)?;

    // Opening runs the migrations; they are idempotent by construction.
    DecisionStore::open(&db_path(project_root))?;

    if existed && !force {
        println!("Conductor already initialized at {}", dir.display());
        println!("Directory structure verified.");
    } else {
        println!("Initialized conductor ({pack_name} pack) at {}", dir.display());
        println!();
        println!("Created:");
        println!("  .conductor/");
        println!("  ├── pipeline.db   # decision store");
        println!("  ├── prompts/      # prompt templates (edit freely)");
        println!("  └── logs/         # per-dispatch prompt/output logs");
        println!();
        println!("Next: conductor run --concept \"your product idea\"");
    }
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    project_root: &Path,
    from: &str,
    stop_after: Option<&str>,
    concept: Option<String>,
    stories: Option<Vec<String>>,
    concurrency: Option<usize>,
    output_format: OutputFormat,
    events: bool,
) -> Result<i32> {
    let from = Phase::parse(from)?;
    let stop_after = stop_after.map(Phase::parse).transpose()?;

    let deps = build_deps(project_root, concurrency)?;
    attach_renderers(&deps, output_format, events);
    let orchestrator = PhaseOrchestrator::new(deps);

    let run = orchestrator.start_run(StartOptions {
        methodology: "bmad".into(),
        concept,
        from,
        stop_after,
        stories,
        concurrency,
    })?;
    let report = orchestrator.execute_run(&run.id).await?;
    log_usage_summary(project_root, &run.id);
    Ok(emit_result(output_format, report_to_result(output_format, &report)))
}

fn log_usage_summary(project_root: &Path, run_id: &str) {
    let Ok(db) = open_store(project_root) else { return };
    let Ok(usage) = db.get_token_usage_summary(run_id) else {
        return;
    };
    for row in &usage.by_phase_agent {
        tracing::info!(
            phase = %row.phase,
            agent = %row.agent,
            input = row.input_tokens,
            output = row.output_tokens,
            cost_usd = row.cost_usd,
            dispatches = row.dispatches,
            "token usage"
        );
    }
    tracing::info!(
        input = usage.input_tokens,
        output = usage.output_tokens,
        cost_usd = usage.cost_usd,
        "token usage total"
    );
}

async fn cmd_resume(
    project_root: &Path,
    run_id: Option<String>,
    stop_after: Option<&str>,
    concurrency: Option<usize>,
    output_format: OutputFormat,
) -> Result<i32> {
    let stop_after = stop_after.map(Phase::parse).transpose()?;
    let deps = build_deps(project_root, concurrency)?;
    attach_renderers(&deps, output_format, false);

    // A resume may tighten the stop-after boundary; persist it into the
    // run config before executing.
    if let Some(stop) = stop_after {
        let db = &deps.wf.db;
        let run = match &run_id {
            Some(id) => db
                .get_pipeline_run_by_id(id)?
                .ok_or_else(|| PipelineError::RunNotFound { id: id.clone() })?,
            None => db.get_latest_run()?.ok_or(PipelineError::NoRuns)?,
        };
        let mut config = conductor::phases::RunConfig::from_json(&run.config_json);
        config.stop_after = Some(stop.as_str().into());
        db.update_pipeline_run(
            &run.id,
            conductor::store::db::RunUpdate {
                config_json: Some(config.to_json()),
                ..Default::default()
            },
        )?;
    }

    let orchestrator = PhaseOrchestrator::new(deps);
    let report = orchestrator.resume_run(run_id).await?;
    Ok(emit_result(output_format, report_to_result(output_format, &report)))
}

fn cmd_status(
    project_root: &Path,
    run_id: Option<&str>,
    output_format: OutputFormat,
) -> Result<i32> {
    let db = open_store(project_root)?;
    let run = match run_id {
        Some(id) => db
            .get_pipeline_run_by_id(id)?
            .ok_or_else(|| PipelineError::RunNotFound { id: id.into() })?,
        None => db.get_latest_run()?.ok_or(PipelineError::NoRuns)?,
    };

    let snapshot = run
        .token_usage_json
        .as_deref()
        .and_then(StatusSnapshot::from_json)
        .unwrap_or_default();
    let usage = db.get_token_usage_summary(&run.id)?;

    if output_format == OutputFormat::Json {
        let data = json!({
            "run_id": run.id,
            "status": run.status,
            "current_phase": run.current_phase,
            "updated_at": run.updated_at,
            "orchestrator": snapshot,
            "token_usage": usage,
        });
        return Ok(emit_result(output_format, Ok(data)));
    }

    println!();
    println!("Pipeline run {}", run.id);
    println!("  status:  {}", run.status.as_str());
    println!("  phase:   {}", run.current_phase.as_deref().unwrap_or("-"));
    println!("  updated: {}", run.updated_at);
    if !snapshot.stories.is_empty() {
        println!();
        println!("  Stories:");
        for (key, story) in &snapshot.stories {
            let verdict = story
                .last_verdict
                .as_deref()
                .map(|v| format!(" [{v}]"))
                .unwrap_or_default();
            println!(
                "    {:<16} {:<18} cycles {}{}",
                key,
                story.phase.as_str(),
                story.review_cycles,
                verdict
            );
            if let Some(metrics) = &story.decomposition {
                println!(
                    "      decomposed: {} tasks in {} batches {:?}",
                    metrics.total_tasks, metrics.batch_count, metrics.batch_sizes
                );
            }
        }
    }
    if !usage.by_phase_agent.is_empty() {
        println!();
        println!("  Token usage:");
        println!(
            "    {:<16} {:<14} {:>10} {:>10} {:>9}",
            "phase", "agent", "input", "output", "cost"
        );
        for row in &usage.by_phase_agent {
            println!(
                "    {:<16} {:<14} {:>10} {:>10} {:>8.4}$",
                row.phase, row.agent, row.input_tokens, row.output_tokens, row.cost_usd
            );
        }
        println!(
            "    {:<31} {:>10} {:>10} {:>8.4}$",
            "total", usage.input_tokens, usage.output_tokens, usage.cost_usd
        );
    }
    println!();
    Ok(0)
}

fn cmd_health(
    project_root: &Path,
    run_id: Option<&str>,
    output_format: OutputFormat,
) -> Result<i32> {
    let db = open_store(project_root)?;
    let report = check_health(&db, run_id)?;

    if output_format == OutputFormat::Json {
        return Ok(emit_result(output_format, Ok(serde_json::to_value(&report)?)));
    }

    println!();
    println!("Health: {:?}", report.verdict);
    if let Some(run_id) = &report.run_id {
        println!("  run:       {run_id}");
        println!(
            "  status:    {}",
            report.status.map(|s| s.as_str()).unwrap_or("-")
        );
        println!(
            "  phase:     {}",
            report.current_phase.as_deref().unwrap_or("-")
        );
        println!(
            "  staleness: {}s",
            report.staleness_seconds.unwrap_or_default()
        );
        println!(
            "  stories:   {} active, {} completed, {} escalated",
            report.stories.active, report.stories.completed, report.stories.escalated
        );
        if let Some(pid) = report.process.orchestrator_pid {
            println!(
                "  process:   pid {pid}, {} children, {} zombies",
                report.process.child_pids.len(),
                report.process.zombies.len()
            );
        }
    }
    println!();
    Ok(0)
}

async fn cmd_amend(
    project_root: &Path,
    concept: String,
    run_id: Option<String>,
    from: &str,
    stop_after: Option<&str>,
    output_format: OutputFormat,
) -> Result<i32> {
    let from = Phase::parse(from)?;
    let stop_after = stop_after.map(Phase::parse).transpose()?;

    let deps = build_deps(project_root, None)?;
    attach_renderers(&deps, output_format, false);
    let orchestrator = PhaseOrchestrator::new(deps);

    let run = orchestrator.start_amendment(concept, run_id, from, stop_after)?;
    let report = orchestrator.execute_run(&run.id).await?;
    Ok(emit_result(output_format, report_to_result(output_format, &report)))
}
