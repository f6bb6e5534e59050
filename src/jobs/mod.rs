//! Job Tracker (C1) — durable registry of async operations with
//! retry/correlation semantics (spec §4.1).

mod tracker;

pub use tracker::{CorrelationOutcome, JobTracker};
