//! Shared constants for deduplicated log entries.

/// Component tag attached to every deduplicated log line, so they can be
/// told apart from ordinary `tracing` output in aggregated log views.
pub const COMPONENT: &str = "dedlog";
