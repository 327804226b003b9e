//! Typed in-process pipeline events.
//!
//! Events are delivered synchronously to subscribers in subscription
//! order; publishing never blocks on a consumer's own I/O beyond the call
//! itself. Each variant knows its wire name, and `to_json` produces the
//! NDJSON object with the timestamp stamped at emission.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::util::now_rfc3339;

/// The per-story pipeline step an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    CreateStory,
    DevStory,
    CodeReview,
    Fix,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateStory => "create-story",
            Self::DevStory => "dev-story",
            Self::CodeReview => "code-review",
            Self::Fix => "fix",
        }
    }
}

/// Status of a step event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Complete,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// A review issue carried on escalation events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub desc: String,
}

/// Every event the pipeline publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PipelineStart {
        run_id: String,
        stories: Vec<String>,
        concurrency: usize,
    },
    PhaseStart {
        run_id: String,
        phase: String,
    },
    PhaseComplete {
        run_id: String,
        phase: String,
        decisions: usize,
    },
    StoryPhase {
        key: String,
        phase: StepKind,
        status: StepStatus,
        verdict: Option<String>,
        file: Option<String>,
    },
    StoryDone {
        key: String,
        result: String,
        review_cycles: u32,
    },
    StoryEscalation {
        key: String,
        reason: String,
        cycles: u32,
        issues: Vec<IssueSummary>,
    },
    StoryWarn {
        key: String,
        msg: String,
    },
    StoryStall {
        run_id: String,
        story_key: String,
        phase: String,
        elapsed_ms: u64,
    },
    Heartbeat {
        run_id: String,
        active: usize,
        completed: usize,
        queued: usize,
    },
    Paused,
    Resumed,
    PipelineComplete {
        succeeded: Vec<String>,
        failed: Vec<String>,
        escalated: Vec<String>,
    },
}

impl Event {
    /// Wire name on the NDJSON stream.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PipelineStart { .. } => "pipeline:start",
            Self::PhaseStart { .. } => "phase:start",
            Self::PhaseComplete { .. } => "phase:complete",
            Self::StoryPhase { .. } => "story:phase",
            Self::StoryDone { .. } => "story:done",
            Self::StoryEscalation { .. } => "story:escalation",
            Self::StoryWarn { .. } => "story:warn",
            Self::StoryStall { .. } => "story:stall",
            Self::Heartbeat { .. } => "pipeline:heartbeat",
            Self::Paused => "orchestrator:paused",
            Self::Resumed => "orchestrator:resumed",
            Self::PipelineComplete { .. } => "pipeline:complete",
        }
    }

    /// The NDJSON object for this event, timestamped now.
    pub fn to_json(&self) -> Value {
        let mut object = match self {
            Self::PipelineStart {
                run_id,
                stories,
                concurrency,
            } => json!({"run_id": run_id, "stories": stories, "concurrency": concurrency}),
            Self::PhaseStart { run_id, phase } => json!({"run_id": run_id, "phase": phase}),
            Self::PhaseComplete {
                run_id,
                phase,
                decisions,
            } => json!({"run_id": run_id, "phase": phase, "decisions": decisions}),
            Self::StoryPhase {
                key,
                phase,
                status,
                verdict,
                file,
            } => {
                let mut v = json!({"key": key, "phase": phase.as_str(), "status": status.as_str()});
                if let Some(verdict) = verdict {
                    v["verdict"] = json!(verdict);
                }
                if let Some(file) = file {
                    v["file"] = json!(file);
                }
                v
            }
            Self::StoryDone {
                key,
                result,
                review_cycles,
            } => json!({"key": key, "result": result, "review_cycles": review_cycles}),
            Self::StoryEscalation {
                key,
                reason,
                cycles,
                issues,
            } => json!({"key": key, "reason": reason, "cycles": cycles, "issues": issues}),
            Self::StoryWarn { key, msg } => json!({"key": key, "msg": msg}),
            Self::StoryStall {
                run_id,
                story_key,
                phase,
                elapsed_ms,
            } => json!({
                "run_id": run_id, "story_key": story_key,
                "phase": phase, "elapsed_ms": elapsed_ms
            }),
            Self::Heartbeat {
                run_id,
                active,
                completed,
                queued,
            } => json!({
                "run_id": run_id, "active_dispatches": active,
                "completed_dispatches": completed, "queued_dispatches": queued
            }),
            Self::Paused | Self::Resumed => json!({}),
            Self::PipelineComplete {
                succeeded,
                failed,
                escalated,
            } => json!({"succeeded": succeeded, "failed": failed, "escalated": escalated}),
        };
        object["event"] = json!(self.kind());
        object["ts"] = json!(now_rfc3339());
        object
    }
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// Synchronous in-process pub/sub.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: impl Fn(&Event) + Send + Sync + 'static) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Box::new(subscriber));
        }
    }

    /// Deliver to every subscriber in subscription order.
    pub fn publish(&self, event: Event) {
        if let Ok(subs) = self.subscribers.lock() {
            for subscriber in subs.iter() {
                subscriber(&event);
            }
        }
    }
}

/// Test helper: collects every published event.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventCollector {
    pub fn attach(bus: &EventBus) -> Self {
        let collector = Self::default();
        let events = collector.events.clone();
        bus.subscribe(move |event| {
            if let Ok(mut list) = events.lock() {
                list.push(event.clone());
            }
        });
        collector
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind()).collect()
    }
}
