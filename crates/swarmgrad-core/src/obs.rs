//! Structured lifecycle events for rounds, gathers, scoring and catch-up.
//!
//! Every event carries an `event = "..."` field so log pipelines can filter
//! on it. Verbosity follows `SWARMGRAD_LOG` (see [`crate::telemetry`]).

use swarmgrad_store::PublishRecord;
use tracing::{info, warn};

use crate::gather::SkipReason;
use crate::peers::PeerId;

/// Span covering one window's round for one role.
///
/// Async code should attach it with `tracing::Instrument` rather than
/// holding [`WindowSpan`] across `.await`.
pub fn window_span(window: u64, role: &str) -> tracing::Span {
    tracing::info_span!("swarmgrad.window", window, role = %role)
}

/// RAII guard that enters a window-scoped span for synchronous sections.
///
/// ```ignore
/// let _span = WindowSpan::enter(4821, "evaluator");
/// // tracing calls here carry window = 4821, role = evaluator
/// ```
pub struct WindowSpan {
    _span: tracing::span::EnteredSpan,
}

impl WindowSpan {
    pub fn enter(window: u64, role: &str) -> Self {
        Self {
            _span: window_span(window, role).entered(),
        }
    }
}

pub fn emit_gather_completed(window: u64, contributing: usize, skipped: usize, success_rate: f64) {
    info!(
        event = "gather.completed",
        window,
        contributing,
        skipped,
        success_rate,
    );
}

pub fn emit_gather_failed(window: u64, candidates: usize) {
    warn!(event = "gather.failed", window, candidates);
}

pub fn emit_peer_skipped(window: u64, peer: PeerId, reason: &SkipReason) {
    info!(event = "peer.skipped", window, peer = %peer, reason = %reason);
}

pub fn emit_peer_scored(window: u64, peer: PeerId, own: f64, random: f64, final_score_ma: f64) {
    info!(
        event = "peer.scored",
        window,
        peer = %peer,
        own,
        random,
        final_score_ma,
    );
}

pub fn emit_weights_committed(window: u64, peers: usize, nonzero: usize) {
    info!(event = "weights.committed", window, peers, nonzero);
}

pub fn emit_artifact_published(record: &PublishRecord) {
    info!(
        event = "artifact.published",
        window = record.window,
        kind = %record.kind,
        role = %record.role_id,
        bytes = record.payload_len,
        digest = %record.digest,
    );
}

/// Publishing failed; the round continues.
pub fn emit_publish_failed(window: u64, kind: &str, error: &dyn std::fmt::Display) {
    warn!(event = "artifact.publish_failed", window, kind = %kind, error = %error);
}

pub fn emit_catchup_step(window: u64, step: u64, learning_rate: f64, source: &str) {
    info!(event = "catchup.step", window, step, learning_rate, source = %source);
}

/// Drift at or below the threshold is informational; above it is a warning.
pub fn emit_catchup_drift(window: u64, l2_distance: f64, threshold: f64) {
    if l2_distance > threshold {
        warn!(event = "catchup.drift", window, l2_distance, threshold);
    } else {
        info!(event = "catchup.drift", window, l2_distance, threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_span_enter() {
        let _span = WindowSpan::enter(7, "evaluator");
    }
}
