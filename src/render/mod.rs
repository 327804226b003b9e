//! Event renderers: structured NDJSON for machine consumers and a
//! progress view for humans.

pub mod ndjson;
pub mod progress;

pub use ndjson::NdjsonRenderer;
pub use progress::ProgressRenderer;
