//! NDJSON event emitter: one JSON object per line.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::events::{Event, EventBus};

/// Writes every bus event as a single JSON line. The first line of a run
/// is `pipeline:start` and the last is `pipeline:complete`; this renderer
/// simply preserves bus order, which the orchestrator guarantees.
pub struct NdjsonRenderer {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl NdjsonRenderer {
    pub fn stdout() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn attach(self, bus: &EventBus) {
        let sink = self.sink;
        bus.subscribe(move |event: &Event| {
            if let Ok(mut out) = sink.lock() {
                let line = event.to_json().to_string();
                let _ = writeln!(out, "{line}");
                let _ = out.flush();
            }
        });
    }
}
