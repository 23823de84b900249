use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use swarmgrad_store::ArtifactKind;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use super::{data_seed, Node, RoundReport};
use crate::artifact::AggregationArtifact;
use crate::clock::WindowClock;
use crate::error::Result;
use crate::gather::{merge_artifacts, GatherOutcome, GatherResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::peers::PeerId;
use crate::scoring::{evaluate_peer, ProbeConfig, ScoreBoard, ScoringConfig};

/// Gathers every peer, scores a sample of them, applies the merged update
/// and commits weights.
pub struct Evaluator {
    node: Node,
    scores: ScoreBoard,
    rng: StdRng,
}

impl Evaluator {
    /// `seed` drives evaluation-peer sampling and random-slice seeds.
    pub fn new(node: Node, seed: u64) -> Self {
        Self {
            scores: ScoreBoard::new(ScoringConfig::from(&node.hparams)),
            node,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn scores(&self) -> &ScoreBoard {
        &self.scores
    }

    /// Resume from the newest checkpoint, replaying this evaluator's own
    /// aggregation artifacts. Returns the first window to run live.
    pub async fn resume(&mut self, clock: &WindowClock) -> Result<u64> {
        let uid = self.node.uid;
        let outcome = self.node.resume(clock, Some(uid)).await?;
        if let Some(scores) = outcome.scores {
            info!(peers = scores.len(), "reputations restored");
            self.scores = scores.with_config(ScoringConfig::from(&self.node.hparams));
        }
        Ok(outcome.catch_up.next_window)
    }

    /// Run one round per window until `shutdown` flips.
    pub async fn run(&mut self, clock: &WindowClock, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut next = self.resume(clock).await?;
        loop {
            let window = tokio::select! {
                w = clock.wait_until(next) => w,
                _ = shutdown.changed() => break,
            };
            if let Err(e) = self.run_window(window).await {
                error!(window, error = %e, "evaluator round aborted");
            }
            next = window + 1;
        }
        Ok(())
    }

    pub async fn run_window(&mut self, window: u64) -> Result<RoundReport> {
        self.round(window)
            .instrument(obs::window_span(window, "evaluator"))
            .await
    }

    async fn round(&mut self, window: u64) -> Result<RoundReport> {
        let candidates = self.node.ledger.candidate_peer_ids().await?;
        let eligible = self.node.ledger.eligible_evaluation_peer_ids().await?;
        self.node
            .directory
            .refresh_activity(window, eligible.iter().copied());

        let peers = self
            .node
            .directory
            .gather_peers(&candidates, Some(self.node.uid));
        let outcome = self.node.gather_window(window, &peers).await?;

        let decayed = self.scores.apply_inactivity(window, &eligible);
        if !decayed.is_empty() {
            debug!(window, decayed = decayed.len(), "inactivity decay applied");
        }

        let penalized = self.penalize_skipped(window, &eligible, outcome.result());
        if !penalized.is_empty() {
            debug!(window, penalized = penalized.len(), "failed contributions scored");
        }

        let mut report = RoundReport::from_outcome(&outcome);
        let result = match outcome {
            GatherOutcome::Aggregated(result) => result,
            GatherOutcome::Failed(_) => {
                METRICS.inc_rounds_deferred();
                warn!(window, "no contributions; round deferred");
                return Ok(report);
            }
        };

        let evaluable: Vec<PeerId> = eligible
            .iter()
            .copied()
            .filter(|p| result.artifacts.contains_key(p))
            .collect();
        let sample = self.node.directory.sample_evaluation_peers(
            &evaluable,
            self.node.hparams.eval_peer_sample,
            &mut self.rng,
        );
        for peer in sample {
            if self.score_peer(window, peer, &result).await {
                report.evaluated.push(peer);
            }
        }

        let applied = self.node.apply_merged(window, &result)?;
        let aggregation = AggregationArtifact::from_updates(window, &applied);
        self.node
            .publish_json(window, ArtifactKind::Aggregation, &aggregation)
            .await?;
        self.node.publish_debug(window, &result).await?;
        report.checkpoint = self
            .node
            .maybe_checkpoint(window, &BTreeMap::new(), Some(&self.scores))
            .await;

        let weights = self.scores.compute_weights();
        self.node
            .ledger
            .commit_weights(&weights.peer_ids, &weights.weights)
            .await?;
        let nonzero = weights.weights.iter().filter(|w| **w > 0.0).count();
        obs::emit_weights_committed(window, weights.peer_ids.len(), nonzero);
        report.weights = Some(weights);

        METRICS.inc_windows_processed();
        METRICS.flush();
        Ok(report)
    }

    /// Score every eligible peer the gather skipped as a failed contribution.
    fn penalize_skipped(&mut self, window: u64, eligible: &[PeerId], result: &GatherResult) -> Vec<PeerId> {
        let mut penalized = Vec::new();
        for skipped in &result.skipped {
            if !eligible.contains(&skipped.peer) {
                continue;
            }
            match self.scores.record_failure(skipped.peer, window) {
                Ok(_) => penalized.push(skipped.peer),
                Err(e) => warn!(peer = %skipped.peer, error = %e, "failure not recorded"),
            }
        }
        penalized
    }

    /// Probe one contributor's gradient. A failed probe leaves the peer
    /// unscored for this window.
    async fn score_peer(&mut self, window: u64, peer: PeerId, result: &GatherResult) -> bool {
        let Some(artifact) = result.artifacts.get(&peer) else {
            return false;
        };
        let updates = match merge_artifacts(&mut self.node.dct, &self.node.validator, [artifact]) {
            Ok(updates) => updates,
            Err(e) => {
                warn!(peer = %peer, error = %e, "cannot decompress gradient");
                return false;
            }
        };

        let hp = &self.node.hparams;
        let cfg = ProbeConfig {
            eval_batches: hp.eval_batches,
            step: hp.eval_step_fraction * self.node.schedule.lr_at(self.node.step_of(window)),
            sign_updates: hp.sign_updates,
        };
        let random_seed: u64 = self.rng.gen();
        let evaluation = match evaluate_peer(
            self.node.trainer.as_mut(),
            self.node.data.as_ref(),
            &updates,
            data_seed(window, peer),
            random_seed,
            &cfg,
        )
        .await
        {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(peer = %peer, error = %e, "evaluation failed");
                return false;
            }
        };

        match self.scores.record_evaluation(peer, window, evaluation) {
            Ok(state) => {
                obs::emit_peer_scored(
                    window,
                    peer,
                    evaluation.own_improvement,
                    evaluation.random_improvement,
                    state.final_score_ma,
                );
                true
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "score not recorded");
                false
            }
        }
    }
}
