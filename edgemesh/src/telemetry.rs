//! Tracing span helpers for scheduler operations.
//!
//! Transports wrap their handlers in these spans so every log line under
//! a request carries the task/node fields.

use tracing::{info_span, Span};

/// Span for a task submission.
#[must_use]
pub fn submit_span(kind: impl AsRef<str>, priority: i32) -> Span {
    info_span!(
        "edgemesh.submit",
        task_kind = %kind.as_ref(),
        priority,
    )
}

/// Span for a claim attempt.
#[must_use]
pub fn claim_span(node_id: impl AsRef<str>) -> Span {
    info_span!(
        "edgemesh.claim",
        node_id = %node_id.as_ref(),
    )
}

/// Span for a posted result.
#[must_use]
pub fn result_span(task_id: impl AsRef<str>, node_id: impl AsRef<str>, ok: bool) -> Span {
    info_span!(
        "edgemesh.result",
        task_id = %task_id.as_ref(),
        node_id = %node_id.as_ref(),
        ok,
    )
}

/// Span for one reaper pass.
#[must_use]
pub fn reap_span() -> Span {
    info_span!("edgemesh.reap")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_construct_without_a_subscriber() {
        let _ = submit_span("render", 5);
        let _ = claim_span("n1");
        let _ = result_span("t1", "n1", true);
        let _ = reap_span();
    }
}
