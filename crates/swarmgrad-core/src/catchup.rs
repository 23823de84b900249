//! Replaying missed windows after a restart.
//!
//! For each window after the checkpoint the aggregated update is taken from
//! the aggregator's published sign artifact, or recomputed by gathering the
//! peers' gradients for that window. It is applied with the learning rate
//! the schedule gives for that window's step, then compared against the
//! aggregator's debug snapshot. Drift is reported, never fatal.

use std::collections::BTreeMap;
use std::time::Duration;

use swarmgrad_store::{ArtifactKind, FetchOutcome};
use tracing::{debug, info, warn};

use crate::artifact::{AggregationArtifact, ArtifactValidator, DebugSnapshot};
use crate::clock::WindowClock;
use crate::codec::{Tensor, TransformDct};
use crate::collaborators::{snapshot_parameters, Ledger, Trainer};
use crate::config::HParams;
use crate::error::{Result, SwarmError};
use crate::gather::{gather, GatherOutcome, GatherRequest};
use crate::metrics::METRICS;
use crate::obs;
use crate::peers::{PeerDirectory, PeerId};
use crate::schedule::LrSchedule;

/// `p -= lr * (update + weight_decay * p)` for every updated parameter.
pub fn apply_with_weight_decay(
    trainer: &mut dyn Trainer,
    updates: &BTreeMap<String, Tensor>,
    learning_rate: f64,
    weight_decay: f64,
) -> Result<()> {
    let current = snapshot_parameters(trainer);
    for (name, update) in updates {
        let param = current.get(name).ok_or_else(|| {
            SwarmError::InvariantViolation(format!("update for unknown parameter {name}"))
        })?;
        let mut step = update.clone();
        if weight_decay > 0.0 {
            step.add_scaled(param, weight_decay as f32)?;
        }
        trainer.apply_update(name, &step, learning_rate)?;
    }
    Ok(())
}

/// Where a replayed update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySource {
    Aggregation,
    Gather,
}

impl ReplaySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplaySource::Aggregation => "aggregation",
            ReplaySource::Gather => "gather",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatchUpReport {
    /// Windows whose update was applied, with its source.
    pub replayed: Vec<(u64, ReplaySource)>,
    /// Windows with no recoverable update.
    pub missing: Vec<u64>,
    /// First window not replayed; live rounds resume here.
    pub next_window: u64,
    /// Largest L2 drift against a debug snapshot, if any was available.
    pub max_drift: Option<f64>,
}

/// Everything catch-up reads from. Borrowed from the round driver.
pub struct CatchUp<'a> {
    pub hparams: &'a HParams,
    pub schedule: &'a LrSchedule,
    pub directory: &'a PeerDirectory,
    pub ledger: &'a dyn Ledger,
    pub validator: &'a ArtifactValidator,
    pub clock: &'a WindowClock,
    /// Peer whose aggregation and debug artifacts are trusted for replay.
    pub aggregator: Option<PeerId>,
}

impl CatchUp<'_> {
    /// Replay `[from_window, to_window)`, extending the end while the clock
    /// moves on during the replay.
    pub async fn run(
        &self,
        trainer: &mut dyn Trainer,
        dct: &mut TransformDct,
        start_window: u64,
        from_window: u64,
        to_window: u64,
    ) -> Result<CatchUpReport> {
        let mut report = CatchUpReport::default();
        let mut target = to_window;
        let mut window = from_window;
        if window < target {
            info!(from = from_window, to = target, "catching up");
        }

        while window < target {
            match self.replay_window(trainer, dct, start_window, window).await? {
                Some((source, drift)) => {
                    report.replayed.push((window, source));
                    if let Some(d) = drift {
                        report.max_drift = Some(report.max_drift.map_or(d, |m: f64| m.max(d)));
                    }
                }
                None => {
                    warn!(window, "no aggregated update recoverable; window skipped");
                    report.missing.push(window);
                }
            }
            window += 1;
            if window >= target {
                target = target.max(self.clock.current());
            }
        }

        report.next_window = window;
        Ok(report)
    }

    async fn replay_window(
        &self,
        trainer: &mut dyn Trainer,
        dct: &mut TransformDct,
        start_window: u64,
        window: u64,
    ) -> Result<Option<(ReplaySource, Option<f64>)>> {
        let (updates, source) = match self.aggregated_update(window).await {
            Some(updates) => (updates, ReplaySource::Aggregation),
            None => match self.gathered_update(window, dct).await? {
                Some(updates) => (updates, ReplaySource::Gather),
                None => return Ok(None),
            },
        };

        let step = window.saturating_sub(start_window);
        let learning_rate = self.schedule.lr_at(step);
        apply_with_weight_decay(trainer, &updates, learning_rate, self.hparams.weight_decay)?;
        METRICS.inc_catchup_steps();
        obs::emit_catchup_step(window, step, learning_rate, source.as_str());

        let params = snapshot_parameters(trainer);
        let drift = self.drift(&params, window).await;
        Ok(Some((source, drift)))
    }

    /// The aggregator's sign artifact, if it exists and fits the model.
    ///
    /// Only exact when updates are applied as signs; otherwise the raw
    /// merge is recomputed from gradients.
    async fn aggregated_update(&self, window: u64) -> Option<BTreeMap<String, Tensor>> {
        if !self.hparams.sign_updates {
            return None;
        }
        let aggregator = self.aggregator?;
        let store = self.directory.endpoint(aggregator)?;
        let FetchOutcome::Found(bytes) = store
            .fetch(&aggregator.role_id(), window, ArtifactKind::Aggregation, None)
            .await
        else {
            debug!(window, "no aggregation artifact");
            return None;
        };

        let unpacked = serde_json::from_slice::<AggregationArtifact>(&bytes)
            .map_err(|e| e.to_string())
            .and_then(|a| a.unpack().map_err(|e| e.to_string()));
        match unpacked {
            Ok(updates) if conforms(&updates, self.validator) => Some(updates),
            Ok(_) => {
                warn!(window, "aggregation artifact does not match the model");
                None
            }
            Err(e) => {
                warn!(window, error = %e, "aggregation artifact unreadable");
                None
            }
        }
    }

    async fn gathered_update(
        &self,
        window: u64,
        dct: &mut TransformDct,
    ) -> Result<Option<BTreeMap<String, Tensor>>> {
        let candidates = self.ledger.candidate_peer_ids().await?;
        let peers = self.directory.gather_peers(&candidates, None);
        let request = GatherRequest {
            window,
            time_window: None,
            timeout: Duration::from_secs(self.hparams.gather_timeout_seconds),
        };
        match gather(self.directory, &peers, &request, self.validator).await {
            GatherOutcome::Aggregated(result) => {
                let merged = result.merge(dct, self.validator)?;
                Ok(Some(if self.hparams.sign_updates {
                    merged.into_iter().map(|(n, t)| (n, t.signum())).collect()
                } else {
                    merged
                }))
            }
            GatherOutcome::Failed(_) => Ok(None),
        }
    }

    async fn drift(&self, params: &BTreeMap<String, Tensor>, window: u64) -> Option<f64> {
        let aggregator = self.aggregator?;
        let store = self.directory.endpoint(aggregator)?;
        let FetchOutcome::Found(bytes) = store
            .fetch(&aggregator.role_id(), window, ArtifactKind::Debug, None)
            .await
        else {
            return None;
        };
        let snapshot: DebugSnapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!(window, error = %e, "debug snapshot unreadable");
                return None;
            }
        };
        let distance = snapshot.l2_distance(params.iter());
        obs::emit_catchup_drift(window, distance, self.hparams.debug_drift_threshold);
        Some(distance)
    }
}

/// Same parameter names and shapes as the validator expects.
fn conforms(updates: &BTreeMap<String, Tensor>, validator: &ArtifactValidator) -> bool {
    updates.len() == validator.geometries().len()
        && updates.iter().all(|(name, t)| {
            validator
                .geometry(name)
                .is_some_and(|g| g.shape.as_slice() == t.shape())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::QuadraticTrainer;

    #[test]
    fn weight_decay_shrinks_toward_zero() {
        let mut trainer = QuadraticTrainer::new([("w", vec![2.0, -2.0])]);
        let mut updates = BTreeMap::new();
        updates.insert("w".to_string(), Tensor::vector(vec![0.0, 0.0]));
        apply_with_weight_decay(&mut trainer, &updates, 0.5, 0.1).unwrap();
        // p - 0.5 * 0.1 * p = 0.95 p
        let w = trainer.parameter("w").unwrap();
        assert!((w.data()[0] - 1.9).abs() < 1e-6);
        assert!((w.data()[1] + 1.9).abs() < 1e-6);
    }

    #[test]
    fn unknown_parameter_is_an_invariant_violation() {
        let mut trainer = QuadraticTrainer::new([("w", vec![1.0])]);
        let mut updates = BTreeMap::new();
        updates.insert("missing".to_string(), Tensor::vector(vec![1.0]));
        let err = apply_with_weight_decay(&mut trainer, &updates, 0.1, 0.0).unwrap_err();
        assert!(matches!(err, SwarmError::InvariantViolation(_)));
    }
}
