//! Per-window drivers for the two roles.
//!
//! [`Node`] holds what both roles share: the trainer, stores, peer
//! directory, codec and schedule. [`Evaluator`] and [`Miner`] add the
//! role-specific steps on top.

mod evaluator;
mod miner;

pub use evaluator::Evaluator;
pub use miner::Miner;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use swarmgrad_store::{ArtifactKind, ObjectStore, PublishRecord, RetryPolicy};
use tracing::{info, warn};

use crate::artifact::{ArtifactValidator, DebugSnapshot};
use crate::catchup::{apply_with_weight_decay, CatchUp, CatchUpReport};
use crate::checkpoint::{CheckpointManager, CheckpointState};
use crate::clock::WindowClock;
use crate::codec::{ChunkGeometry, Tensor, TransformDct};
use crate::collaborators::{snapshot_parameters, DataSource, Ledger, Trainer};
use crate::config::HParams;
use crate::error::Result;
use crate::gather::{gather, resolve_time_window, GatherOutcome, GatherPhase, GatherRequest, GatherResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::peers::{PeerDirectory, PeerId};
use crate::schedule::LrSchedule;
use crate::scoring::{ScoreBoard, WeightVector};

/// Seed of `peer`'s data slice for `window`. Miners train on it and
/// evaluators probe with it, so both sides must agree.
pub fn data_seed(window: u64, peer: PeerId) -> u64 {
    (window << 16) | u64::from(peer.0)
}

/// Chunk geometry of every trainer parameter.
pub fn parameter_geometries(
    trainer: &dyn Trainer,
    dct: &TransformDct,
) -> BTreeMap<String, ChunkGeometry> {
    trainer
        .named_parameters()
        .into_iter()
        .map(|p| (p.name.to_string(), dct.geometry(p.value.shape())))
        .collect()
}

/// Ledger anchor lookups: a block may land a few seconds late.
fn anchor_retry() -> RetryPolicy {
    RetryPolicy::exponential(4, Duration::from_secs(1), Duration::from_secs(8))
}

/// What one window's round did.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub window: u64,
    pub phase: GatherPhase,
    pub contributing: Vec<PeerId>,
    pub skipped: Vec<PeerId>,
    pub success_rate: f64,
    /// Peers scored this window (evaluator only).
    pub evaluated: Vec<PeerId>,
    /// Weights committed to the ledger (evaluator only).
    pub weights: Option<WeightVector>,
    pub checkpoint: Option<PublishRecord>,
}

impl RoundReport {
    fn from_outcome(outcome: &GatherOutcome) -> Self {
        let result = outcome.result();
        Self {
            window: result.window,
            phase: outcome.phase(),
            contributing: result.contributing.clone(),
            skipped: result.skipped_ids(),
            success_rate: result.success_rate,
            evaluated: Vec::new(),
            weights: None,
            checkpoint: None,
        }
    }

    /// No contributors: nothing was applied.
    pub fn deferred(&self) -> bool {
        self.phase == GatherPhase::Failed
    }
}

/// Result of [`Node::resume`].
#[derive(Debug, Clone, Default)]
pub struct ResumeOutcome {
    pub checkpoint_window: Option<u64>,
    pub momentum: BTreeMap<String, Tensor>,
    /// Reputations saved by an evaluator.
    pub scores: Option<ScoreBoard>,
    pub catch_up: CatchUpReport,
}

/// State shared by both roles.
pub struct Node {
    pub hparams: HParams,
    pub uid: PeerId,
    pub store: Arc<ObjectStore>,
    pub directory: PeerDirectory,
    pub ledger: Arc<dyn Ledger>,
    pub data: Arc<dyn DataSource>,
    pub trainer: Box<dyn Trainer>,
    pub dct: TransformDct,
    pub validator: ArtifactValidator,
    pub schedule: LrSchedule,
    pub checkpoints: CheckpointManager,
    /// Window training started at; step `n` is window `start_window + n`.
    pub start_window: u64,
}

impl Node {
    /// Builds the codec and validator from the trainer's parameter shapes
    /// and registers `store` as this peer's own endpoint.
    pub fn new(
        hparams: HParams,
        uid: PeerId,
        store: Arc<ObjectStore>,
        ledger: Arc<dyn Ledger>,
        data: Arc<dyn DataSource>,
        trainer: Box<dyn Trainer>,
        start_window: u64,
    ) -> Self {
        let dct = TransformDct::new(hparams.target_chunk);
        let validator = ArtifactValidator::new(
            parameter_geometries(trainer.as_ref(), &dct),
            hparams.allowed_topk,
        );
        let mut directory = PeerDirectory::new();
        directory.register(uid, Arc::clone(&store));
        Self {
            schedule: LrSchedule::from_hparams(&hparams),
            checkpoints: CheckpointManager::new(Arc::clone(&store), None, uid.role_id()),
            hparams,
            uid,
            store,
            directory,
            ledger,
            data,
            trainer,
            dct,
            validator,
            start_window,
        }
    }

    /// Mirror checkpoints to `remote` and prefer it when newer.
    pub fn with_remote_checkpoints(mut self, remote: Arc<ObjectStore>) -> Self {
        self.checkpoints = CheckpointManager::new(Arc::clone(&self.store), Some(remote), self.uid.role_id());
        self
    }

    pub fn step_of(&self, window: u64) -> u64 {
        window.saturating_sub(self.start_window)
    }

    /// Load the newest checkpoint and replay every window up to the clock.
    ///
    /// Without a checkpoint training starts fresh at the current window.
    pub async fn resume(&mut self, clock: &WindowClock, aggregator: Option<PeerId>) -> Result<ResumeOutcome> {
        let Some((state, _source)) = self.checkpoints.load().await else {
            return Ok(ResumeOutcome {
                catch_up: CatchUpReport {
                    next_window: clock.current(),
                    ..CatchUpReport::default()
                },
                ..ResumeOutcome::default()
            });
        };
        state.restore_into(self.trainer.as_mut())?;
        self.start_window = state.start_window;

        let catch_up = CatchUp {
            hparams: &self.hparams,
            schedule: &self.schedule,
            directory: &self.directory,
            ledger: self.ledger.as_ref(),
            validator: &self.validator,
            clock,
            aggregator,
        };
        let report = catch_up
            .run(
                self.trainer.as_mut(),
                &mut self.dct,
                self.start_window,
                state.window + 1,
                clock.current(),
            )
            .await?;
        info!(
            checkpoint = state.window,
            replayed = report.replayed.len(),
            missing = report.missing.len(),
            next = report.next_window,
            "resumed"
        );
        Ok(ResumeOutcome {
            checkpoint_window: Some(state.window),
            momentum: state.momentum,
            scores: state.scores,
            catch_up: report,
        })
    }

    /// OPEN through AGGREGATED/FAILED for `peers`, gated on the window's
    /// anchor timestamp.
    pub async fn gather_window(&self, window: u64, peers: &[PeerId]) -> Result<GatherOutcome> {
        let time_window = resolve_time_window(
            self.ledger.as_ref(),
            window,
            self.hparams.time_window_delta_seconds,
            &anchor_retry(),
        )
        .await?;
        let request = GatherRequest {
            window,
            time_window: Some(time_window),
            timeout: Duration::from_secs(self.hparams.gather_timeout_seconds),
        };
        Ok(gather(&self.directory, peers, &request, &self.validator).await)
    }

    /// Merge `result`, apply it with this window's learning rate and
    /// weight decay, and return exactly what was applied.
    pub fn apply_merged(&mut self, window: u64, result: &GatherResult) -> Result<BTreeMap<String, Tensor>> {
        let merged = result.merge(&mut self.dct, &self.validator)?;
        let updates: BTreeMap<String, Tensor> = if self.hparams.sign_updates {
            merged.into_iter().map(|(n, t)| (n, t.signum())).collect()
        } else {
            merged
        };
        let learning_rate = self.schedule.lr_at(self.step_of(window));
        apply_with_weight_decay(
            self.trainer.as_mut(),
            &updates,
            learning_rate,
            self.hparams.weight_decay,
        )?;
        info!(window, learning_rate, contributors = result.contributing.len(), "update applied");
        Ok(updates)
    }

    /// Publish under this peer's role. Failures are logged; the round goes on.
    pub async fn publish(&self, window: u64, kind: ArtifactKind, payload: &[u8]) -> Option<PublishRecord> {
        match self
            .store
            .publish(&self.uid.role_id(), window, kind, payload)
            .await
        {
            Ok(record) => {
                obs::emit_artifact_published(&record);
                METRICS.inc_artifacts_published();
                Some(record)
            }
            Err(e) => {
                obs::emit_publish_failed(window, kind.as_str(), &e);
                None
            }
        }
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        window: u64,
        kind: ArtifactKind,
        value: &T,
    ) -> Result<Option<PublishRecord>> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.publish(window, kind, &bytes).await)
    }

    /// Sample of the parameters after applying `result`.
    pub async fn publish_debug(&self, window: u64, result: &GatherResult) -> Result<Option<PublishRecord>> {
        let params = snapshot_parameters(self.trainer.as_ref());
        let snapshot = DebugSnapshot::capture(
            window,
            params.iter(),
            &result.contributing,
            &result.skipped_ids(),
        );
        self.publish_json(window, ArtifactKind::Debug, &snapshot).await
    }

    /// Save a checkpoint every `checkpoint_frequency_windows` windows.
    pub async fn maybe_checkpoint(
        &self,
        window: u64,
        momentum: &BTreeMap<String, Tensor>,
        scores: Option<&ScoreBoard>,
    ) -> Option<PublishRecord> {
        if window % self.hparams.checkpoint_frequency_windows.max(1) != 0 {
            return None;
        }
        let mut state = CheckpointState::capture(self.trainer.as_ref(), momentum, window, self.start_window);
        if let Some(scores) = scores {
            state = state.with_scores(scores);
        }
        match self.checkpoints.save(&state).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(window, error = %e, "checkpoint failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_seeds_are_distinct_per_peer_and_window() {
        assert_ne!(data_seed(1, PeerId(2)), data_seed(2, PeerId(1)));
        assert_ne!(data_seed(5, PeerId(0)), data_seed(5, PeerId(1)));
        assert_eq!(data_seed(3, PeerId(7)), data_seed(3, PeerId(7)));
    }
}
