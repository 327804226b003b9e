//! Pipeline health: staleness + process-tree inspection → verdict.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::orchestrator::StatusSnapshot;
use crate::store::{DecisionStore, RunStatus};
use crate::util::parse_rfc3339;

/// A run whose `updated_at` is older than this while `running` is stalled.
pub const STALENESS_THRESHOLD_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthVerdict {
    Healthy,
    Stalled,
    NoPipelineRunning,
}

/// What became of an inspected pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    Alive,
    Zombie,
    Missing,
    /// Process inspection unavailable on this platform.
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_pid: Option<u32>,
    #[serde(default)]
    pub child_pids: Vec<u32>,
    #[serde(default)]
    pub zombies: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoriesReport {
    pub active: usize,
    pub completed: usize,
    pub escalated: usize,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub verdict: HealthVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staleness_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    pub process: ProcessReport,
    pub stories: StoriesReport,
}

/// Inspect `/proc/<pid>/stat` for liveness and zombie state.
#[cfg(target_os = "linux")]
pub fn inspect_pid(pid: u32) -> PidState {
    let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat,
        Err(_) => return PidState::Missing,
    };
    // State is the first field after the parenthesized comm.
    match stat.rsplit(')').next().and_then(|rest| {
        rest.trim_start().chars().next()
    }) {
        Some('Z') => PidState::Zombie,
        Some(_) => PidState::Alive,
        None => PidState::Missing,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn inspect_pid(_pid: u32) -> PidState {
    PidState::Unknown
}

/// Children of `pid`, found by scanning `/proc` for matching ppids.
#[cfg(target_os = "linux")]
pub fn child_pids_of(pid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children = Vec::new();
    for entry in entries.flatten() {
        let Some(candidate) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{candidate}/stat")) else {
            continue;
        };
        let ppid = stat
            .rsplit(')')
            .next()
            .map(|rest| rest.split_whitespace().collect::<Vec<_>>())
            .and_then(|fields| fields.get(1).and_then(|f| f.parse::<u32>().ok()));
        if ppid == Some(pid) {
            children.push(candidate);
        }
    }
    children.sort_unstable();
    children
}

#[cfg(not(target_os = "linux"))]
pub fn child_pids_of(_pid: u32) -> Vec<u32> {
    Vec::new()
}

/// The verdict rule, pure for testing: a running pipeline is stalled when
/// its children are zombies, its heartbeat is stale, its orchestrator is
/// gone, or it claims active stories with no children doing the work.
pub fn verdict_for(
    status: RunStatus,
    staleness_seconds: u64,
    active_stories: usize,
    orchestrator: PidState,
    live_children: usize,
    zombie_children: usize,
) -> HealthVerdict {
    if status != RunStatus::Running {
        return HealthVerdict::NoPipelineRunning;
    }
    if zombie_children > 0 {
        return HealthVerdict::Stalled;
    }
    if staleness_seconds > STALENESS_THRESHOLD_SECS {
        return HealthVerdict::Stalled;
    }
    match orchestrator {
        PidState::Missing => HealthVerdict::Stalled,
        PidState::Unknown => HealthVerdict::Healthy,
        PidState::Alive | PidState::Zombie => {
            if live_children == 0 && active_stories > 0 {
                HealthVerdict::Stalled
            } else {
                HealthVerdict::Healthy
            }
        }
    }
}

/// Build the health report for the named (or latest) run.
pub fn check_health(db: &DecisionStore, run_id: Option<&str>) -> Result<HealthReport> {
    let run = match run_id {
        Some(id) => db.get_pipeline_run_by_id(id)?,
        None => db.get_latest_run()?,
    };
    let Some(run) = run else {
        return Ok(HealthReport {
            verdict: HealthVerdict::NoPipelineRunning,
            run_id: None,
            status: None,
            current_phase: None,
            staleness_seconds: None,
            last_activity: None,
            process: ProcessReport::default(),
            stories: StoriesReport::default(),
        });
    };

    let staleness_seconds = parse_rfc3339(&run.updated_at)
        .map(|updated| (Utc::now() - updated).num_seconds().max(0) as u64)
        .unwrap_or(u64::MAX);

    let snapshot = run
        .token_usage_json
        .as_deref()
        .and_then(StatusSnapshot::from_json)
        .unwrap_or_default();

    let orchestrator_pid = (snapshot.pid != 0).then_some(snapshot.pid);
    let orchestrator_state = orchestrator_pid.map(inspect_pid).unwrap_or(PidState::Unknown);
    let mut children = snapshot.child_pids.clone();
    if let Some(pid) = orchestrator_pid {
        for child in child_pids_of(pid) {
            if !children.contains(&child) {
                children.push(child);
            }
        }
    }
    let zombies: Vec<u32> = children
        .iter()
        .copied()
        .filter(|pid| inspect_pid(*pid) == PidState::Zombie)
        .collect();
    let live = children
        .iter()
        .filter(|pid| inspect_pid(**pid) == PidState::Alive)
        .count();

    let active = snapshot.active();
    let stories = StoriesReport {
        active: active.len(),
        completed: snapshot.completed().len(),
        escalated: snapshot.escalated().len(),
        details: snapshot
            .stories
            .iter()
            .map(|(key, story)| (key.clone(), story.phase.as_str().to_string()))
            .collect(),
    };

    let verdict = verdict_for(
        run.status,
        staleness_seconds,
        stories.active,
        orchestrator_state,
        live,
        zombies.len(),
    );

    Ok(HealthReport {
        verdict,
        run_id: Some(run.id),
        status: Some(run.status),
        current_phase: run.current_phase,
        staleness_seconds: Some(staleness_seconds),
        last_activity: Some(run.updated_at),
        process: ProcessReport {
            orchestrator_pid,
            child_pids: children,
            zombies,
        },
        stories,
    })
}
