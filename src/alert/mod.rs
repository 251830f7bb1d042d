//! Heavy-traffic detection and notification decisions.
//!
//! Submodules:
//! - `thresholds`: distance-bracketed detection parameters.
//! - `evaluator`: per-route verdicts and history updates.
//! - `policy`: which verdicts reach the chat and push channels.

pub mod evaluator;
pub mod policy;
pub mod thresholds;
