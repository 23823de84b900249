//! Gather protocol: fetch, gate, validate and merge peers' gradients.
//!
//! `OPEN -> COLLECTING -> VALIDATING -> AGGREGATED | FAILED`
//!
//! - OPEN: the accepted publish window is derived from the anchor block.
//! - COLLECTING: one task per candidate, all bounded by a single shared
//!   deadline. Anything other than a timely payload skips the peer for this
//!   window; there is no retry within the window.
//! - VALIDATING: structural checks; one bad parameter skips the whole peer.
//! - AGGREGATED / FAILED: at least one / zero contributors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use swarmgrad_store::{retry, ArtifactKind, FetchOutcome, RetryPolicy, TimeWindow};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::artifact::{ArtifactValidator, GradientArtifact};
use crate::codec::{SparseParam, Tensor, TransformDct};
use crate::collaborators::Ledger;
use crate::error::{Result, SwarmError, ValidationError};
use crate::metrics::METRICS;
use crate::obs;
use crate::peers::{PeerDirectory, PeerId};

/// Lifecycle of one gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherPhase {
    Open,
    Collecting,
    Validating,
    Aggregated,
    Failed,
}

/// Why a candidate did not contribute.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    TooEarly,
    TooLate,
    Absent,
    /// No registered store for the peer.
    Unreachable,
    /// The shared deadline passed first.
    TimedOut,
    Invalid(ValidationError),
    /// Fetch task panicked or was cancelled.
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooEarly => f.write_str("too_early"),
            SkipReason::TooLate => f.write_str("too_late"),
            SkipReason::Absent => f.write_str("absent"),
            SkipReason::Unreachable => f.write_str("unreachable"),
            SkipReason::TimedOut => f.write_str("timed_out"),
            SkipReason::Invalid(e) => write!(f, "invalid: {e}"),
            SkipReason::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPeer {
    pub peer: PeerId,
    pub reason: SkipReason,
}

/// Everything learned from one gather.
#[derive(Debug, Clone)]
pub struct GatherResult {
    pub window: u64,
    pub candidates: usize,
    /// Contributors in id order.
    pub contributing: Vec<PeerId>,
    pub skipped: Vec<SkippedPeer>,
    pub artifacts: BTreeMap<PeerId, GradientArtifact>,
    /// `contributing / candidates`, 0 with no candidates.
    pub success_rate: f64,
}

impl GatherResult {
    pub fn skipped_ids(&self) -> Vec<PeerId> {
        self.skipped.iter().map(|s| s.peer).collect()
    }

    /// Sum every contributor's payload per parameter and invert once.
    pub fn merge(
        &self,
        dct: &mut TransformDct,
        validator: &ArtifactValidator,
    ) -> Result<BTreeMap<String, Tensor>> {
        merge_artifacts(dct, validator, self.artifacts.values())
    }
}

/// Merge any set of validated artifacts into dense per-parameter updates.
pub fn merge_artifacts<'a>(
    dct: &mut TransformDct,
    validator: &ArtifactValidator,
    artifacts: impl IntoIterator<Item = &'a GradientArtifact>,
) -> Result<BTreeMap<String, Tensor>> {
    let artifacts: Vec<&GradientArtifact> = artifacts.into_iter().collect();
    let mut merged = BTreeMap::new();
    for (name, geometry) in validator.geometries() {
        let parts: Vec<&SparseParam> = artifacts.iter().filter_map(|a| a.get(name)).collect();
        merged.insert(name.clone(), dct.merge(geometry, &parts)?);
    }
    Ok(merged)
}

/// Terminal state of a gather.
#[derive(Debug, Clone)]
pub enum GatherOutcome {
    Aggregated(GatherResult),
    /// Zero contributors: the caller must not apply anything this window.
    Failed(GatherResult),
}

impl GatherOutcome {
    pub fn phase(&self) -> GatherPhase {
        match self {
            GatherOutcome::Aggregated(_) => GatherPhase::Aggregated,
            GatherOutcome::Failed(_) => GatherPhase::Failed,
        }
    }

    pub fn result(&self) -> &GatherResult {
        match self {
            GatherOutcome::Aggregated(r) | GatherOutcome::Failed(r) => r,
        }
    }

    pub fn into_result(self) -> GatherResult {
        match self {
            GatherOutcome::Aggregated(r) | GatherOutcome::Failed(r) => r,
        }
    }

    /// The result if aggregated, otherwise a `ProtocolFailure`.
    pub fn aggregated(self) -> Result<GatherResult> {
        match self {
            GatherOutcome::Aggregated(r) => Ok(r),
            GatherOutcome::Failed(r) => Err(SwarmError::ProtocolFailure {
                window: r.window,
                reason: format!("no valid contributions from {} candidates", r.candidates),
            }),
        }
    }
}

/// Inputs of one gather.
#[derive(Debug, Clone)]
pub struct GatherRequest {
    pub window: u64,
    /// Publish-time gate; `None` disables gating.
    pub time_window: Option<TimeWindow>,
    pub timeout: Duration,
}

/// OPEN: resolve the anchor timestamp of `window`, retrying while the ledger
/// has not seen the block yet or is unreachable.
pub async fn resolve_time_window(
    ledger: &dyn Ledger,
    window: u64,
    delta_seconds: i64,
    policy: &RetryPolicy,
) -> Result<TimeWindow> {
    let operation = format!("anchor timestamp for window {window}");
    let anchor: DateTime<Utc> = retry(policy, &operation, || async move {
        ledger
            .anchor_timestamp(window)
            .await?
            .ok_or_else(|| SwarmError::Collaborator(format!("no anchor block yet for window {window}")))
    })
    .await
    .map_err(|e| SwarmError::Timing(format!("window {window} cannot be placed in time: {e}")))?;
    Ok(TimeWindow::from_anchor(anchor, delta_seconds))
}

/// COLLECTING through AGGREGATED/FAILED for `peers`.
pub async fn gather(
    directory: &PeerDirectory,
    peers: &[PeerId],
    request: &GatherRequest,
    validator: &ArtifactValidator,
) -> GatherOutcome {
    let deadline = Instant::now() + request.timeout;
    debug!(window = request.window, candidates = peers.len(), phase = ?GatherPhase::Collecting);

    let mut skipped = Vec::new();
    let mut tasks = Vec::with_capacity(peers.len());
    for &peer in peers {
        let Some(store) = directory.endpoint(peer) else {
            skipped.push(SkippedPeer {
                peer,
                reason: SkipReason::Unreachable,
            });
            continue;
        };
        let window = request.window;
        let time_window = request.time_window;
        let handle = tokio::spawn(async move {
            let role = peer.role_id();
            let fetch = store.fetch(&role, window, ArtifactKind::Gradient, time_window.as_ref());
            tokio::time::timeout_at(deadline, fetch).await
        });
        tasks.push((peer, handle));
    }

    let (peer_ids, handles): (Vec<PeerId>, Vec<_>) = tasks.into_iter().unzip();
    let fetched = join_all(handles).await;

    debug!(window = request.window, phase = ?GatherPhase::Validating);
    let mut artifacts = BTreeMap::new();
    for (peer, joined) in peer_ids.into_iter().zip(fetched) {
        let reason = match joined {
            Ok(Ok(FetchOutcome::Found(bytes))) => {
                match validator
                    .check_size(bytes.len())
                    .and_then(|()| GradientArtifact::from_bytes(&bytes))
                    .and_then(|a| validator.validate(&a).map(|()| a))
                {
                    Ok(artifact) => {
                        artifacts.insert(peer, artifact);
                        continue;
                    }
                    Err(e) => SkipReason::Invalid(e),
                }
            }
            Ok(Ok(FetchOutcome::TooEarly)) => SkipReason::TooEarly,
            Ok(Ok(FetchOutcome::TooLate)) => SkipReason::TooLate,
            Ok(Ok(FetchOutcome::Absent)) => SkipReason::Absent,
            Ok(Err(_elapsed)) => SkipReason::TimedOut,
            Err(e) => {
                warn!(peer = %peer, error = %e, "fetch task failed");
                SkipReason::Aborted
            }
        };
        skipped.push(SkippedPeer { peer, reason });
    }

    skipped.sort_by_key(|s| s.peer);
    for s in &skipped {
        obs::emit_peer_skipped(request.window, s.peer, &s.reason);
        METRICS.inc_peers_skipped();
    }

    let contributing: Vec<PeerId> = artifacts.keys().copied().collect();
    let success_rate = if peers.is_empty() {
        0.0
    } else {
        contributing.len() as f64 / peers.len() as f64
    };
    let result = GatherResult {
        window: request.window,
        candidates: peers.len(),
        contributing,
        skipped,
        artifacts,
        success_rate,
    };

    if result.contributing.is_empty() {
        obs::emit_gather_failed(request.window, result.candidates);
        GatherOutcome::Failed(result)
    } else {
        obs::emit_gather_completed(
            request.window,
            result.contributing.len(),
            result.skipped.len(),
            result.success_rate,
        );
        GatherOutcome::Aggregated(result)
    }
}
