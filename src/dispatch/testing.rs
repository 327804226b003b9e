//! Scripted dispatcher for tests.
//!
//! Scenario tests drive the orchestrator and workflows by scripting what
//! each agent "replies" with, per agent name and in FIFO order. No
//! subprocess is spawned.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::{
    AgentDispatcher, DispatchRequest, DispatchResult, DispatchStatus, TokenEstimate, parse_output,
};
use crate::util::estimate_tokens;

#[derive(Debug, Clone)]
enum Scripted {
    Reply { status: DispatchStatus, output: String },
    Error(String),
}

/// An [`AgentDispatcher`] that replays scripted replies.
#[derive(Default)]
pub struct ScriptedDispatcher {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    default_reply: Mutex<Option<Scripted>>,
    requests: Arc<Mutex<Vec<DispatchRequest>>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher that answers every dispatch with the same completed
    /// output.
    pub fn completing(output: &str) -> Self {
        let dispatcher = Self::new();
        *dispatcher.default_reply.lock().unwrap() = Some(Scripted::Reply {
            status: DispatchStatus::Completed,
            output: output.to_string(),
        });
        dispatcher
    }

    /// Queue a completed reply for the named agent.
    pub fn script(self, agent: &str, output: &str) -> Self {
        self.push(
            agent,
            Scripted::Reply {
                status: DispatchStatus::Completed,
                output: output.to_string(),
            },
        );
        self
    }

    /// Queue a reply with an explicit terminal status.
    pub fn script_status(self, agent: &str, status: DispatchStatus, output: &str) -> Self {
        self.push(
            agent,
            Scripted::Reply {
                status,
                output: output.to_string(),
            },
        );
        self
    }

    /// Queue a dispatch-level error (the `dispatch` call itself fails).
    pub fn script_error(self, agent: &str, message: &str) -> Self {
        self.push(agent, Scripted::Error(message.to_string()));
        self
    }

    fn push(&self, agent: &str, scripted: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(scripted);
    }

    /// Every request seen so far, in dispatch order.
    pub fn requests(&self) -> Arc<Mutex<Vec<DispatchRequest>>> {
        self.requests.clone()
    }

    pub fn dispatch_count(&self, agent: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.agent == agent)
            .count()
    }
}

#[async_trait]
impl AgentDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResult> {
        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&request.agent).and_then(|q| q.pop_front()) {
                Some(s) => Some(s),
                None => self.default_reply.lock().unwrap().clone(),
            }
        };
        self.requests.lock().unwrap().push(request.clone());

        let scripted = scripted
            .ok_or_else(|| anyhow::anyhow!("unscripted dispatch for agent '{}'", request.agent))?;

        match scripted {
            Scripted::Error(message) => Err(anyhow::anyhow!(message)),
            Scripted::Reply { status, output } => {
                let (parsed, parse_error) = match (&status, &request.output_schema) {
                    (DispatchStatus::Completed, Some(schema)) => parse_output(&output, schema),
                    _ => (None, None),
                };
                Ok(DispatchResult {
                    id: Uuid::new_v4().to_string(),
                    status,
                    exit_code: if status == DispatchStatus::Completed { 0 } else { 1 },
                    token_estimate: TokenEstimate {
                        input: estimate_tokens(&request.prompt) as u64,
                        output: estimate_tokens(&output) as u64,
                    },
                    output,
                    parsed,
                    parse_error,
                    duration_ms: 1,
                })
            }
        }
    }
}
