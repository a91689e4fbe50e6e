// SPDX-License-Identifier: MIT
//! Observability utilities: tracing subscriber setup and latency tracking.

use std::time::Instant;
use tracing::{debug, info};

/// Initialize the tracing subscriber for an embedding host that doesn't set
/// one up itself. `log_level` is an EnvFilter directive, e.g. `"info"` or
/// `"taskstack=debug"`. Safe to call more than once — later calls are no-ops.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .try_init();
}

/// Track latency of an async operation and emit a structured log event.
pub struct LatencyTracker {
    operation: String,
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency for an operation.
    ///
    /// Examples:
    ///   let tracker = LatencyTracker::start("task.batchDelete");
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    /// Finish tracking and emit a log event with the elapsed time.
    pub fn finish(self) {
        let elapsed_ms = self.start.elapsed().as_millis();
        if elapsed_ms > 1000 {
            // Slow operation — log at info level
            info!(
                operation = %self.operation,
                elapsed_ms = elapsed_ms,
                "slow operation"
            );
        } else {
            debug!(
                operation = %self.operation,
                elapsed_ms = elapsed_ms,
                "operation complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_finish_does_not_panic() {
        let tracker = LatencyTracker::start("test.op");
        tracker.finish();
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("info");
        init_tracing("debug");
    }
}
