use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;
use crate::util::now_rfc3339;

/// Fields of a pipeline run that `update_pipeline_run` may change.
/// `updated_at` is bumped on every call regardless of which fields are set;
/// staleness checks depend on that.
#[derive(Debug, Default, Clone)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub current_phase: Option<String>,
    pub config_json: Option<String>,
    pub token_usage_json: Option<String>,
}

/// Input for one token usage log append.
#[derive(Debug, Clone)]
pub struct TokenUsageEntry {
    pub phase: String,
    pub agent: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub metadata_json: Option<String>,
}

pub struct DecisionStore {
    conn: Mutex<Connection>,
}

impl DecisionStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init(true)?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init(false)?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("decision store lock poisoned"))
    }

    fn init(&self, file_backed: bool) -> Result<()> {
        let conn = self.lock()?;
        if file_backed {
            // WAL + synchronous COMMIT; in-memory databases reject WAL.
            // journal_mode reports the resulting mode, so it must be read
            // as a query.
            let _mode: String = conn
                .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
                .context("Failed to enable WAL journal")?;
            conn.pragma_update(None, "synchronous", "FULL")
                .context("Failed to set synchronous mode")?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        Self::run_migrations(&conn).context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id TEXT PRIMARY KEY,
                methodology TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                current_phase TEXT,
                config_json TEXT NOT NULL DEFAULT '{}',
                token_usage_json TEXT,
                parent_run_id TEXT REFERENCES pipeline_runs(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                pipeline_run_id TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                category TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                rationale TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                superseded_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(pipeline_run_id, phase, category, key)
            );

            CREATE TABLE IF NOT EXISTS requirements (
                id TEXT PRIMARY KEY,
                pipeline_run_id TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                source TEXT NOT NULL,
                type TEXT NOT NULL,
                description TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'should',
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                pipeline_run_id TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                type TEXT NOT NULL,
                path TEXT NOT NULL,
                summary TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS token_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline_run_id TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                agent TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                metadata_json TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_decisions_run_phase
                ON decisions(pipeline_run_id, phase);
            CREATE INDEX IF NOT EXISTS idx_requirements_run ON requirements(pipeline_run_id);
            CREATE INDEX IF NOT EXISTS idx_artifacts_run_type
                ON artifacts(pipeline_run_id, type);
            CREATE INDEX IF NOT EXISTS idx_token_usage_run ON token_usage(pipeline_run_id);
            ",
        )
        .context("Failed to create tables")?;
        Ok(())
    }

    // ── Pipeline runs ─────────────────────────────────────────────────

    pub fn create_pipeline_run(&self, methodology: &str, config_json: &str) -> Result<PipelineRun> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO pipeline_runs (id, methodology, status, config_json, created_at, updated_at)
                 VALUES (?1, ?2, 'running', ?3, ?4, ?4)",
                params![id, methodology, config_json, now],
            )
            .context("Failed to insert pipeline run")?;
        }
        self.get_pipeline_run_by_id(&id)?
            .context("Pipeline run not found after insert")
    }

    /// Create an amendment run referencing a completed parent, copying the
    /// parent's active decisions for every skipped phase so that executed
    /// phases see a coherent decision set.
    pub fn create_amendment_run(
        &self,
        parent_run_id: &str,
        methodology: &str,
        config_json: &str,
        skipped_phases: &[&str],
    ) -> Result<PipelineRun> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO pipeline_runs
                     (id, methodology, status, config_json, parent_run_id, created_at, updated_at)
                 VALUES (?1, ?2, 'running', ?3, ?4, ?5, ?5)",
                params![id, methodology, config_json, parent_run_id, now],
            )
            .context("Failed to insert amendment run")?;

            for phase in skipped_phases {
                let mut stmt = conn
                    .prepare(
                        "SELECT phase, category, key, value, rationale FROM decisions
                         WHERE pipeline_run_id = ?1 AND phase = ?2 AND status = 'active'",
                    )
                    .context("Failed to prepare parent decision copy")?;
                let rows: Vec<(String, String, String, String, Option<String>)> = stmt
                    .query_map(params![parent_run_id, phase], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    })
                    .context("Failed to query parent decisions")?
                    .collect::<std::result::Result<_, _>>()
                    .context("Failed to read parent decision rows")?;
                for (phase, category, key, value, rationale) in rows {
                    conn.execute(
                        "INSERT INTO decisions
                             (id, pipeline_run_id, phase, category, key, value, rationale,
                              status, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?8)",
                        params![
                            Uuid::new_v4().to_string(),
                            id,
                            phase,
                            category,
                            key,
                            value,
                            rationale,
                            now
                        ],
                    )
                    .context("Failed to copy parent decision")?;
                }
            }
        }
        self.get_pipeline_run_by_id(&id)?
            .context("Amendment run not found after insert")
    }

    pub fn update_pipeline_run(&self, id: &str, update: RunUpdate) -> Result<PipelineRun> {
        let now = now_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE pipeline_runs SET
                     status = COALESCE(?1, status),
                     current_phase = COALESCE(?2, current_phase),
                     config_json = COALESCE(?3, config_json),
                     token_usage_json = COALESCE(?4, token_usage_json),
                     updated_at = ?5
                 WHERE id = ?6",
                params![
                    update.status.map(|s| s.as_str()),
                    update.current_phase,
                    update.config_json,
                    update.token_usage_json,
                    now,
                    id
                ],
            )
            .context("Failed to update pipeline run")?;
        }
        self.get_pipeline_run_by_id(id)?
            .context("Pipeline run not found after update")
    }

    pub fn get_pipeline_run_by_id(&self, id: &str) -> Result<Option<PipelineRun>> {
        let conn = self.lock()?;
        Self::query_run(
            &conn,
            "SELECT id, methodology, status, current_phase, config_json, token_usage_json,
                    parent_run_id, created_at, updated_at
             FROM pipeline_runs WHERE id = ?1",
            params![id],
        )
    }

    pub fn get_latest_run(&self) -> Result<Option<PipelineRun>> {
        let conn = self.lock()?;
        Self::query_run(
            &conn,
            "SELECT id, methodology, status, current_phase, config_json, token_usage_json,
                    parent_run_id, created_at, updated_at
             FROM pipeline_runs ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![],
        )
    }

    pub fn get_latest_completed_run(&self) -> Result<Option<PipelineRun>> {
        let conn = self.lock()?;
        Self::query_run(
            &conn,
            "SELECT id, methodology, status, current_phase, config_json, token_usage_json,
                    parent_run_id, created_at, updated_at
             FROM pipeline_runs WHERE status = 'completed'
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![],
        )
    }

    fn query_run(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<PipelineRun>> {
        let row = conn
            .query_row(sql, args, |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    methodology: row.get(1)?,
                    status: row.get(2)?,
                    current_phase: row.get(3)?,
                    config_json: row.get(4)?,
                    token_usage_json: row.get(5)?,
                    parent_run_id: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            })
            .optional()
            .context("Failed to query pipeline run")?;
        match row {
            Some(r) => Ok(Some(r.into_run()?)),
            None => Ok(None),
        }
    }

    // ── Decisions ─────────────────────────────────────────────────────

    pub fn create_decision(
        &self,
        run_id: &str,
        phase: &str,
        category: &str,
        key: &str,
        value: &str,
        rationale: Option<&str>,
    ) -> Result<Decision> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO decisions
                     (id, pipeline_run_id, phase, category, key, value, rationale,
                      status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?8)",
                params![id, run_id, phase, category, key, value, rationale, now],
            )
            .context("Failed to insert decision")?;
        }
        self.find_decision(run_id, phase, category, key)?
            .context("Decision not found after insert")
    }

    /// Insert or update in place. Retrying a phase writes the same
    /// `(run, phase, category, key)` keys again; this must never grow the
    /// decision count.
    pub fn upsert_decision(
        &self,
        run_id: &str,
        phase: &str,
        category: &str,
        key: &str,
        value: &str,
        rationale: Option<&str>,
    ) -> Result<Decision> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO decisions
                     (id, pipeline_run_id, phase, category, key, value, rationale,
                      status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?8)
                 ON CONFLICT(pipeline_run_id, phase, category, key) DO UPDATE SET
                     value = ?5,
                     rationale = COALESCE(?6, decisions.rationale),
                     updated_at = ?8",
                params![id, run_id, phase, category, key, value, rationale, now],
            )
            .context("Failed to upsert decision")?;
        }
        self.find_decision(run_id, phase, category, key)?
            .context("Decision not found after upsert")
    }

    /// Mark `old_id` as superseded by `new_id`.
    pub fn supersede_decision(&self, old_id: &str, new_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE decisions SET status = 'superseded', superseded_by = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![new_id, now, old_id],
            )
            .context("Failed to supersede decision")?;
        if changed == 0 {
            anyhow::bail!("decision {old_id} not found for supersession");
        }
        Ok(())
    }

    pub fn find_decision(
        &self,
        run_id: &str,
        phase: &str,
        category: &str,
        key: &str,
    ) -> Result<Option<Decision>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("{DECISION_SELECT} WHERE pipeline_run_id = ?1 AND phase = ?2 AND category = ?3 AND key = ?4"),
                params![run_id, phase, category, key],
                Self::map_decision_row,
            )
            .optional()
            .context("Failed to query decision")?;
        match row {
            Some(r) => Ok(Some(r.into_decision()?)),
            None => Ok(None),
        }
    }

    /// Decisions of the latest run for a phase.
    pub fn get_decisions_by_phase(&self, phase: &str) -> Result<Vec<Decision>> {
        let latest = match self.get_latest_run()? {
            Some(run) => run,
            None => return Ok(Vec::new()),
        };
        self.get_decisions_by_phase_for_run(&latest.id, phase)
    }

    pub fn get_decisions_by_phase_for_run(&self, run_id: &str, phase: &str) -> Result<Vec<Decision>> {
        let conn = self.lock()?;
        Self::query_decisions(
            &conn,
            &format!("{DECISION_SELECT} WHERE pipeline_run_id = ?1 AND phase = ?2 ORDER BY created_at, rowid"),
            params![run_id, phase],
        )
    }

    pub fn get_active_decisions(&self, run_id: &str, phase: Option<&str>) -> Result<Vec<Decision>> {
        let conn = self.lock()?;
        match phase {
            Some(phase) => Self::query_decisions(
                &conn,
                &format!(
                    "{DECISION_SELECT} WHERE pipeline_run_id = ?1 AND phase = ?2 AND status = 'active'
                     ORDER BY created_at, rowid"
                ),
                params![run_id, phase],
            ),
            None => Self::query_decisions(
                &conn,
                &format!(
                    "{DECISION_SELECT} WHERE pipeline_run_id = ?1 AND status = 'active'
                     ORDER BY created_at, rowid"
                ),
                params![run_id],
            ),
        }
    }

    fn query_decisions(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Decision>> {
        let mut stmt = conn.prepare(sql).context("Failed to prepare decision query")?;
        let rows = stmt
            .query_map(args, Self::map_decision_row)
            .context("Failed to query decisions")?;
        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(row.context("Failed to read decision row")?.into_decision()?);
        }
        Ok(decisions)
    }

    fn map_decision_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRow> {
        Ok(DecisionRow {
            id: row.get(0)?,
            pipeline_run_id: row.get(1)?,
            phase: row.get(2)?,
            category: row.get(3)?,
            key: row.get(4)?,
            value: row.get(5)?,
            rationale: row.get(6)?,
            status: row.get(7)?,
            superseded_by: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    // ── Requirements ──────────────────────────────────────────────────

    pub fn create_requirement(
        &self,
        run_id: &str,
        source: &str,
        requirement_type: RequirementType,
        description: &str,
        priority: &str,
    ) -> Result<Requirement> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO requirements
                 (id, pipeline_run_id, source, type, description, priority, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7)",
            params![
                id,
                run_id,
                source,
                requirement_type.as_str(),
                description,
                priority,
                now
            ],
        )
        .context("Failed to insert requirement")?;
        Ok(Requirement {
            id,
            pipeline_run_id: run_id.to_string(),
            source: source.to_string(),
            requirement_type,
            description: description.to_string(),
            priority: priority.to_string(),
            status: "active".to_string(),
            created_at: now,
        })
    }

    pub fn get_requirements_for_run(&self, run_id: &str) -> Result<Vec<Requirement>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, pipeline_run_id, source, type, description, priority, status, created_at
                 FROM requirements WHERE pipeline_run_id = ?1 ORDER BY created_at, rowid",
            )
            .context("Failed to prepare requirements query")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query requirements")?;
        let mut requirements = Vec::new();
        for row in rows {
            let (id, pipeline_run_id, source, ty, description, priority, status, created_at) =
                row.context("Failed to read requirement row")?;
            requirements.push(Requirement {
                id,
                pipeline_run_id,
                source,
                requirement_type: RequirementType::from_str(&ty)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse requirement type")?,
                description,
                priority,
                status,
                created_at,
            });
        }
        Ok(requirements)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn register_artifact(
        &self,
        run_id: &str,
        phase: &str,
        artifact_type: &str,
        path: &str,
        summary: Option<&str>,
    ) -> Result<Artifact> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO artifacts (id, pipeline_run_id, phase, type, path, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, run_id, phase, artifact_type, path, summary, now],
        )
        .context("Failed to insert artifact")?;
        Ok(Artifact {
            id,
            pipeline_run_id: run_id.to_string(),
            phase: phase.to_string(),
            artifact_type: artifact_type.to_string(),
            path: path.to_string(),
            summary: summary.map(String::from),
            created_at: now,
        })
    }

    pub fn get_artifact_by_type_for_run(
        &self,
        run_id: &str,
        artifact_type: &str,
    ) -> Result<Option<Artifact>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, pipeline_run_id, phase, type, path, summary, created_at
                 FROM artifacts WHERE pipeline_run_id = ?1 AND type = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![run_id, artifact_type],
                |row| {
                    Ok(Artifact {
                        id: row.get(0)?,
                        pipeline_run_id: row.get(1)?,
                        phase: row.get(2)?,
                        artifact_type: row.get(3)?,
                        path: row.get(4)?,
                        summary: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query artifact")?;
        Ok(row)
    }

    // ── Token usage ───────────────────────────────────────────────────

    pub fn add_token_usage(&self, run_id: &str, entry: TokenUsageEntry) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO token_usage
                 (pipeline_run_id, phase, agent, input_tokens, output_tokens, cost_usd,
                  metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                entry.phase,
                entry.agent,
                entry.input_tokens as i64,
                entry.output_tokens as i64,
                entry.cost_usd,
                entry.metadata_json,
                now
            ],
        )
        .context("Failed to insert token usage")?;
        Ok(())
    }

    pub fn get_token_usage_summary(&self, run_id: &str) -> Result<TokenUsageTotals> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT phase, agent, SUM(input_tokens), SUM(output_tokens), SUM(cost_usd), COUNT(*)
                 FROM token_usage WHERE pipeline_run_id = ?1
                 GROUP BY phase, agent ORDER BY phase, agent",
            )
            .context("Failed to prepare token usage summary")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(TokenUsageSummary {
                    phase: row.get(0)?,
                    agent: row.get(1)?,
                    input_tokens: row.get::<_, i64>(2)? as u64,
                    output_tokens: row.get::<_, i64>(3)? as u64,
                    cost_usd: row.get(4)?,
                    dispatches: row.get::<_, i64>(5)? as u64,
                })
            })
            .context("Failed to query token usage summary")?;

        let mut totals = TokenUsageTotals::default();
        for row in rows {
            let summary = row.context("Failed to read token usage row")?;
            totals.input_tokens += summary.input_tokens;
            totals.output_tokens += summary.output_tokens;
            totals.cost_usd += summary.cost_usd;
            totals.by_phase_agent.push(summary);
        }
        Ok(totals)
    }
}

const DECISION_SELECT: &str = "SELECT id, pipeline_run_id, phase, category, key, value, rationale,
        status, superseded_by, created_at, updated_at FROM decisions";

// ── Internal row helpers ──────────────────────────────────────────────

struct RunRow {
    id: String,
    methodology: String,
    status: String,
    current_phase: Option<String>,
    config_json: String,
    token_usage_json: Option<String>,
    parent_run_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn into_run(self) -> Result<PipelineRun> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        Ok(PipelineRun {
            id: self.id,
            methodology: self.methodology,
            status,
            current_phase: self.current_phase,
            config_json: self.config_json,
            token_usage_json: self.token_usage_json,
            parent_run_id: self.parent_run_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct DecisionRow {
    id: String,
    pipeline_run_id: String,
    phase: String,
    category: String,
    key: String,
    value: String,
    rationale: Option<String>,
    status: String,
    superseded_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DecisionRow {
    fn into_decision(self) -> Result<Decision> {
        let status = DecisionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse decision status")?;
        Ok(Decision {
            id: self.id,
            pipeline_run_id: self.pipeline_run_id,
            phase: self.phase,
            category: self.category,
            key: self.key,
            value: self.value,
            rationale: self.rationale,
            status,
            superseded_by: self.superseded_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DecisionStore {
        DecisionStore::open_in_memory().expect("in-memory store")
    }

    #[test]
    fn test_migrations_create_all_tables() -> Result<()> {
        let store = store();
        let conn = store.lock()?;
        let table_count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('pipeline_runs', 'decisions', 'requirements', 'artifacts', 'token_usage')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5, "Expected 5 tables to exist");
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let store = store();
        let conn = store.lock()?;
        DecisionStore::run_migrations(&conn)?;
        DecisionStore::run_migrations(&conn)?;
        Ok(())
    }

    #[test]
    fn test_create_and_fetch_pipeline_run() -> Result<()> {
        let store = store();
        let run = store.create_pipeline_run("bmad", r#"{"concept":"a thing"}"#)?;
        assert_eq!(run.methodology, "bmad");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.parent_run_id.is_none());
        assert!(!run.created_at.is_empty());

        let fetched = store.get_pipeline_run_by_id(&run.id)?.expect("run exists");
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.config_json, r#"{"concept":"a thing"}"#);
        Ok(())
    }

    #[test]
    fn test_get_latest_run_orders_by_creation() -> Result<()> {
        let store = store();
        let _first = store.create_pipeline_run("bmad", "{}")?;
        let second = store.create_pipeline_run("bmad", "{}")?;
        let latest = store.get_latest_run()?.expect("latest exists");
        assert_eq!(latest.id, second.id);
        Ok(())
    }

    #[test]
    fn test_get_latest_completed_run_skips_non_completed() -> Result<()> {
        let store = store();
        let done = store.create_pipeline_run("bmad", "{}")?;
        store.update_pipeline_run(
            &done.id,
            RunUpdate {
                status: Some(RunStatus::Completed),
                ..Default::default()
            },
        )?;
        let _running = store.create_pipeline_run("bmad", "{}")?;

        let latest_completed = store.get_latest_completed_run()?.expect("completed exists");
        assert_eq!(latest_completed.id, done.id);
        Ok(())
    }

    #[test]
    fn test_update_pipeline_run_bumps_updated_at() -> Result<()> {
        let store = store();
        let run = store.create_pipeline_run("bmad", "{}")?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let updated = store.update_pipeline_run(
            &run.id,
            RunUpdate {
                current_phase: Some("planning".into()),
                ..Default::default()
            },
        )?;
        assert_eq!(updated.current_phase.as_deref(), Some("planning"));
        assert!(updated.updated_at > run.updated_at, "updated_at must move");
        // Untouched fields survive COALESCE.
        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(updated.config_json, "{}");
        Ok(())
    }

    #[test]
    fn test_upsert_decision_is_idempotent_across_retries() -> Result<()> {
        let store = store();
        let run = store.create_pipeline_run("bmad", "{}")?;

        let first = store.upsert_decision(&run.id, "planning", "functional-requirements", "FR-1", "old", None)?;
        let second = store.upsert_decision(
            &run.id,
            "planning",
            "functional-requirements",
            "FR-1",
            "new",
            Some("retry"),
        )?;

        assert_eq!(first.id, second.id, "upsert must update in place");
        assert_eq!(second.value, "new");
        assert_eq!(second.rationale.as_deref(), Some("retry"));

        let decisions = store.get_decisions_by_phase_for_run(&run.id, "planning")?;
        assert_eq!(decisions.len(), 1, "retries must not accumulate duplicates");
        Ok(())
    }

    #[test]
    fn test_upsert_distinguishes_runs_and_keys() -> Result<()> {
        let store = store();
        let run_a = store.create_pipeline_run("bmad", "{}")?;
        let run_b = store.create_pipeline_run("bmad", "{}")?;

        store.upsert_decision(&run_a.id, "planning", "tech-stack", "language", "rust", None)?;
        store.upsert_decision(&run_b.id, "planning", "tech-stack", "language", "go", None)?;
        store.upsert_decision(&run_a.id, "planning", "tech-stack", "database", "sqlite", None)?;

        assert_eq!(store.get_decisions_by_phase_for_run(&run_a.id, "planning")?.len(), 2);
        assert_eq!(store.get_decisions_by_phase_for_run(&run_b.id, "planning")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_supersede_decision_links_replacement() -> Result<()> {
        let store = store();
        let parent = store.create_pipeline_run("bmad", "{}")?;
        let amendment = store.create_pipeline_run("bmad", "{}")?;

        let old = store.create_decision(&parent.id, "planning", "functional-requirements", "FR-1", "old", None)?;
        let new = store.create_decision(&amendment.id, "planning", "functional-requirements", "FR-1", "new", None)?;

        store.supersede_decision(&old.id, &new.id)?;

        let reread = store
            .find_decision(&parent.id, "planning", "functional-requirements", "FR-1")?
            .expect("decision exists");
        assert_eq!(reread.status, DecisionStatus::Superseded);
        assert_eq!(reread.superseded_by.as_deref(), Some(new.id.as_str()));
        Ok(())
    }

    #[test]
    fn test_supersede_unknown_decision_fails() {
        let store = store();
        assert!(store.supersede_decision("nope", "also-nope").is_err());
    }

    #[test]
    fn test_get_active_decisions_excludes_superseded() -> Result<()> {
        let store = store();
        let run = store.create_pipeline_run("bmad", "{}")?;
        let kept = store.create_decision(&run.id, "solutioning", "architecture", "storage", "sqlite", None)?;
        let dropped = store.create_decision(&run.id, "solutioning", "architecture", "transport", "http", None)?;
        store.supersede_decision(&dropped.id, &kept.id)?;

        let active = store.get_active_decisions(&run.id, Some("solutioning"))?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "storage");

        let all_active = store.get_active_decisions(&run.id, None)?;
        assert_eq!(all_active.len(), 1);
        Ok(())
    }

    #[test]
    fn test_amendment_copies_skipped_phase_decisions() -> Result<()> {
        let store = store();
        let parent = store.create_pipeline_run("bmad", "{}")?;
        store.create_decision(&parent.id, "analysis", "product-brief", "problem_statement", "p", None)?;
        store.create_decision(&parent.id, "planning", "functional-requirements", "FR-1", "fr", None)?;
        // Superseded parent decisions are not carried forward.
        let stale = store.create_decision(&parent.id, "analysis", "product-brief", "constraints", "c", None)?;
        let newer = store.create_decision(&parent.id, "planning", "functional-requirements", "FR-2", "fr2", None)?;
        store.supersede_decision(&stale.id, &newer.id)?;

        let amendment = store.create_amendment_run(&parent.id, "bmad", "{}", &["analysis"])?;
        assert_eq!(amendment.parent_run_id.as_deref(), Some(parent.id.as_str()));

        let copied = store.get_decisions_by_phase_for_run(&amendment.id, "analysis")?;
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].key, "problem_statement");
        // Planning was not skipped, so nothing was copied for it.
        assert!(store.get_decisions_by_phase_for_run(&amendment.id, "planning")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_requirements_round_trip() -> Result<()> {
        let store = store();
        let run = store.create_pipeline_run("bmad", "{}")?;
        store.create_requirement(&run.id, "planning-phase", RequirementType::Functional, "Users can log in", "must")?;
        store.create_requirement(&run.id, "solutioning-phase", RequirementType::Story, "Story 1-1", "should")?;

        let requirements = store.get_requirements_for_run(&run.id)?;
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].requirement_type, RequirementType::Functional);
        assert_eq!(requirements[1].source, "solutioning-phase");
        Ok(())
    }

    #[test]
    fn test_artifact_lookup_by_type() -> Result<()> {
        let store = store();
        let run = store.create_pipeline_run("bmad", "{}")?;
        assert!(store.get_artifact_by_type_for_run(&run.id, "prd")?.is_none());

        store.register_artifact(&run.id, "planning", "prd", "decision-store://planning/prd", Some("12 FRs"))?;
        let artifact = store
            .get_artifact_by_type_for_run(&run.id, "prd")?
            .expect("artifact exists");
        assert_eq!(artifact.phase, "planning");
        assert_eq!(artifact.summary.as_deref(), Some("12 FRs"));
        Ok(())
    }

    #[test]
    fn test_token_usage_summary_groups_by_phase_agent() -> Result<()> {
        let store = store();
        let run = store.create_pipeline_run("bmad", "{}")?;
        for (phase, agent, input, output) in [
            ("implementation", "dev-story", 1000u64, 500u64),
            ("implementation", "dev-story", 2000, 700),
            ("implementation", "code-review", 800, 100),
            ("planning", "planner", 300, 50),
        ] {
            store.add_token_usage(
                &run.id,
                TokenUsageEntry {
                    phase: phase.into(),
                    agent: agent.into(),
                    input_tokens: input,
                    output_tokens: output,
                    cost_usd: crate::util::dispatch_cost_usd(input, output),
                    metadata_json: None,
                },
            )?;
        }

        let totals = store.get_token_usage_summary(&run.id)?;
        assert_eq!(totals.by_phase_agent.len(), 3);
        assert_eq!(totals.input_tokens, 4100);
        assert_eq!(totals.output_tokens, 1350);

        let dev = totals
            .by_phase_agent
            .iter()
            .find(|s| s.agent == "dev-story")
            .expect("dev-story summary");
        assert_eq!(dev.input_tokens, 3000);
        assert_eq!(dev.output_tokens, 1200);
        assert_eq!(dev.dispatches, 2);
        Ok(())
    }

    #[test]
    fn test_reads_of_absent_rows_return_none() -> Result<()> {
        let store = store();
        assert!(store.get_pipeline_run_by_id("missing")?.is_none());
        assert!(store.get_latest_run()?.is_none());
        assert!(store.get_latest_completed_run()?.is_none());
        assert!(store.find_decision("r", "p", "c", "k")?.is_none());
        assert!(store.get_decisions_by_phase("planning")?.is_empty());
        Ok(())
    }
}
