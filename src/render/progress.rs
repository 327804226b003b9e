//! Human progress renderer.
//!
//! On a TTY the renderer overwrites its last block with cursor-up and
//! erase-below; elsewhere it appends one line per event. Styling goes
//! through `console`, which honors `NO_COLOR`. Rendering stops after
//! `pipeline:complete`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use console::{Term, style};

use crate::events::{Event, EventBus, StepStatus};

#[derive(Debug, Clone, Default)]
struct StoryLine {
    step: String,
    status: String,
    verdict: Option<String>,
}

struct State {
    term: Term,
    tty: bool,
    phase: Option<String>,
    stories: BTreeMap<String, StoryLine>,
    last_block_lines: usize,
    done: bool,
}

/// Renders pipeline progress for a human watching the terminal.
pub struct ProgressRenderer {
    state: Arc<Mutex<State>>,
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressRenderer {
    pub fn new() -> Self {
        let term = Term::stdout();
        let tty = term.is_term();
        Self {
            state: Arc::new(Mutex::new(State {
                term,
                tty,
                phase: None,
                stories: BTreeMap::new(),
                last_block_lines: 0,
                done: false,
            })),
        }
    }

    pub fn attach(self, bus: &EventBus) {
        let state = self.state;
        bus.subscribe(move |event: &Event| {
            if let Ok(mut state) = state.lock() {
                if state.done {
                    return;
                }
                handle(&mut state, event);
            }
        });
    }
}

fn handle(state: &mut State, event: &Event) {
    match event {
        Event::PipelineStart {
            stories,
            concurrency,
            ..
        } => {
            append(
                state,
                format!(
                    "pipeline started: {} stories, concurrency {}",
                    stories.len(),
                    concurrency
                ),
            );
        }
        Event::PhaseStart { phase, .. } => {
            state.phase = Some(phase.clone());
            append(state, format!("phase {} started", style(phase).cyan()));
        }
        Event::PhaseComplete {
            phase, decisions, ..
        } => {
            append(
                state,
                format!(
                    "phase {} complete ({decisions} decisions)",
                    style(phase).cyan()
                ),
            );
        }
        Event::StoryPhase {
            key,
            phase,
            status,
            verdict,
            ..
        } => {
            let line = state.stories.entry(key.clone()).or_default();
            line.step = phase.as_str().to_string();
            line.status = status.as_str().to_string();
            line.verdict = verdict.clone();
            if state.tty {
                redraw(state);
            } else if *status != StepStatus::InProgress {
                let verdict = verdict
                    .as_ref()
                    .map(|v| format!(" [{v}]"))
                    .unwrap_or_default();
                append(
                    state,
                    format!("{key}: {} {}{verdict}", phase.as_str(), status.as_str()),
                );
            }
        }
        Event::StoryDone {
            key,
            result,
            review_cycles,
        } => {
            state.stories.remove(key);
            let mark = if result == "success" {
                style("done").green()
            } else {
                style("failed").red()
            };
            append(
                state,
                format!("{key}: {mark} after {review_cycles} review cycle(s)"),
            );
        }
        Event::StoryEscalation {
            key,
            reason,
            cycles,
            issues,
        } => {
            state.stories.remove(key);
            append(
                state,
                format!(
                    "{key}: {} ({reason}, {cycles} cycles, {} issues)",
                    style("escalated").red().bold(),
                    issues.len()
                ),
            );
        }
        Event::StoryWarn { key, msg } => {
            append(state, format!("{key}: {} {msg}", style("warn").yellow()));
        }
        Event::StoryStall {
            story_key,
            phase,
            elapsed_ms,
            ..
        } => {
            append(
                state,
                format!(
                    "{story_key}: {} in {phase} for {}s",
                    style("stalled").yellow().bold(),
                    elapsed_ms / 1000
                ),
            );
        }
        Event::Paused => append(state, format!("{}", style("paused").yellow())),
        Event::Resumed => append(state, "resumed".to_string()),
        Event::Heartbeat { .. } => {
            if state.tty {
                redraw(state);
            }
        }
        Event::PipelineComplete {
            succeeded,
            failed,
            escalated,
        } => {
            clear_block(state);
            append(
                state,
                format!(
                    "pipeline complete: {} succeeded, {} failed, {} escalated",
                    style(succeeded.len()).green(),
                    style(failed.len()).red(),
                    style(escalated.len()).yellow()
                ),
            );
            state.done = true;
        }
    }
}

fn clear_block(state: &mut State) {
    if state.tty && state.last_block_lines > 0 {
        let _ = state.term.move_cursor_up(state.last_block_lines);
        let _ = state.term.clear_to_end_of_screen();
        state.last_block_lines = 0;
    }
}

fn append(state: &mut State, line: String) {
    clear_block(state);
    let _ = state.term.write_line(&line);
    if state.tty {
        redraw(state);
    }
}

fn redraw(state: &mut State) {
    clear_block(state);
    let mut lines = 0;
    for (key, story) in &state.stories {
        let verdict = story
            .verdict
            .as_ref()
            .map(|v| format!(" [{v}]"))
            .unwrap_or_default();
        let _ = state.term.write_line(&format!(
            "  {} {} {}{verdict}",
            style(key).bold(),
            story.step,
            style(&story.status).dim()
        ));
        lines += 1;
    }
    state.last_block_lines = lines;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StepKind;

    // The renderer writes to the process terminal, so tests exercise the
    // state transitions rather than captured bytes.

    fn renderer_state(renderer: &ProgressRenderer) -> Arc<Mutex<State>> {
        renderer.state.clone()
    }

    #[test]
    fn test_rendering_stops_after_pipeline_complete() {
        let bus = EventBus::new();
        let renderer = ProgressRenderer::new();
        let state = renderer_state(&renderer);
        renderer.attach(&bus);

        bus.publish(Event::PipelineComplete {
            succeeded: vec![],
            failed: vec![],
            escalated: vec![],
        });
        assert!(state.lock().unwrap().done);

        // Later events must not disturb the final state.
        bus.publish(Event::StoryWarn {
            key: "5-1".into(),
            msg: "late".into(),
        });
        assert!(state.lock().unwrap().stories.is_empty());
    }

    #[test]
    fn test_story_lines_track_latest_step() {
        let bus = EventBus::new();
        let renderer = ProgressRenderer::new();
        let state = renderer_state(&renderer);
        renderer.attach(&bus);

        bus.publish(Event::StoryPhase {
            key: "5-1".into(),
            phase: StepKind::DevStory,
            status: StepStatus::InProgress,
            verdict: None,
            file: None,
        });
        bus.publish(Event::StoryPhase {
            key: "5-1".into(),
            phase: StepKind::CodeReview,
            status: StepStatus::Complete,
            verdict: Some("SHIP_IT".into()),
            file: None,
        });

        let state = state.lock().unwrap();
        let line = state.stories.get("5-1").unwrap();
        assert_eq!(line.step, "code-review");
        assert_eq!(line.status, "complete");
        assert_eq!(line.verdict.as_deref(), Some("SHIP_IT"));
    }

    #[test]
    fn test_story_done_clears_the_story_line() {
        let bus = EventBus::new();
        let renderer = ProgressRenderer::new();
        let state = renderer_state(&renderer);
        renderer.attach(&bus);

        bus.publish(Event::StoryPhase {
            key: "5-1".into(),
            phase: StepKind::DevStory,
            status: StepStatus::InProgress,
            verdict: None,
            file: None,
        });
        bus.publish(Event::StoryDone {
            key: "5-1".into(),
            result: "success".into(),
            review_cycles: 1,
        });

        assert!(state.lock().unwrap().stories.is_empty());
    }
}
