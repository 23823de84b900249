//! Peer scoring: loss probes, moving averages, inactivity decay, weights.
//!
//! Per evaluated peer and window the evaluator measures the relative loss
//! improvement from applying the peer's gradient on the peer's own data
//! slice (`own`) and on a random slice (`random`). `own` feeds the score
//! magnitude; the comparison with `random` only decides the sign.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Tensor;
use crate::collaborators::{restore_parameters, snapshot_parameters, Batch, DataSource, Trainer};
use crate::config::HParams;
use crate::error::{Result, SwarmError};
use crate::peers::PeerId;

/// Moving-average and normalization constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub ma_alpha_gradient: f64,
    pub ma_alpha_binary: f64,
    pub ma_alpha_final: f64,
    pub power_normalization_exponent: f64,
    pub inactivity_decay: f64,
}

impl From<&HParams> for ScoringConfig {
    fn from(h: &HParams) -> Self {
        Self {
            ma_alpha_gradient: h.ma_alpha_gradient,
            ma_alpha_binary: h.ma_alpha_binary,
            ma_alpha_final: h.ma_alpha_final,
            power_normalization_exponent: h.power_normalization_exponent,
            inactivity_decay: h.inactivity_decay,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self::from(&HParams::default())
    }
}

/// Reputation of one peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerScoreState {
    pub gradient_score: f64,
    /// `+1` or `-1`; `0` until the first evaluation.
    pub binary_indicator: i8,
    pub gradient_score_ma: f64,
    pub binary_score_ma: f64,
    pub normalized_binary_ma: f64,
    /// Never negative.
    pub final_score_ma: f64,
    pub weight: f64,
    pub inactive_since: Option<u64>,
    pub evaluations: u64,
    pub last_evaluated_window: Option<u64>,
    pub last_decayed_window: Option<u64>,
}

/// Relative loss improvements measured for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub own_improvement: f64,
    pub random_improvement: f64,
}

/// Normalized weights in peer id order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    pub peer_ids: Vec<PeerId>,
    pub weights: Vec<f64>,
}

impl WeightVector {
    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn weight_of(&self, peer: PeerId) -> Option<f64> {
        self.peer_ids
            .iter()
            .position(|p| *p == peer)
            .map(|i| self.weights[i])
    }
}

/// All peer reputations held by one evaluator. Saved with its checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBoard {
    config: ScoringConfig,
    states: BTreeMap<PeerId, PeerScoreState>,
}

impl ScoreBoard {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
        }
    }

    /// Keep the restored reputations but score with `config` from now on.
    pub fn with_config(mut self, config: ScoringConfig) -> Self {
        self.config = config;
        self
    }

    pub fn get(&self, peer: PeerId) -> Option<&PeerScoreState> {
        self.states.get(&peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &PeerScoreState)> {
        self.states.iter().map(|(p, s)| (*p, s))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Fold one evaluation into the peer's moving averages.
    ///
    /// A peer can be evaluated at most once per window.
    pub fn record_evaluation(
        &mut self,
        peer: PeerId,
        window: u64,
        evaluation: Evaluation,
    ) -> Result<&PeerScoreState> {
        let cfg = self.config;
        let state = self.states.entry(peer).or_default();
        if state.last_evaluated_window == Some(window) {
            return Err(SwarmError::DuplicateEvaluation { peer: peer.0, window });
        }

        let own = evaluation.own_improvement;
        let binary: i8 = if own > evaluation.random_improvement { 1 } else { -1 };

        state.gradient_score = own;
        state.binary_indicator = binary;
        state.gradient_score_ma =
            (1.0 - cfg.ma_alpha_gradient) * state.gradient_score_ma + cfg.ma_alpha_gradient * own;
        state.binary_score_ma = (1.0 - cfg.ma_alpha_binary) * state.binary_score_ma
            + cfg.ma_alpha_binary * f64::from(binary);
        state.normalized_binary_ma = state.binary_score_ma / 2.0;

        let final_score = state.gradient_score * state.normalized_binary_ma;
        state.final_score_ma = (cfg.ma_alpha_final * state.final_score_ma
            + (1.0 - cfg.ma_alpha_final) * final_score)
            .max(0.0);

        state.evaluations += 1;
        state.last_evaluated_window = Some(window);
        state.inactive_since = None;

        debug!(
            peer = %peer,
            window,
            own,
            random = evaluation.random_improvement,
            binary,
            final_score_ma = state.final_score_ma,
            "score updated"
        );
        Ok(state)
    }

    /// Count a failed contribution (invalid, late, early, missing or timed
    /// out) as this window's score for `peer`: gradient score 0, binary -1.
    ///
    /// `final_score_ma` shrinks by `ma_alpha_final` and drops to zero once
    /// the binary average is no longer positive, so a peer that keeps
    /// failing ends up with zero weight. Good evaluations raise it again.
    pub fn record_failure(&mut self, peer: PeerId, window: u64) -> Result<&PeerScoreState> {
        let cfg = self.config;
        let state = self.states.entry(peer).or_default();
        if state.last_evaluated_window == Some(window) {
            return Err(SwarmError::DuplicateEvaluation { peer: peer.0, window });
        }

        state.gradient_score = 0.0;
        state.binary_indicator = -1;
        state.gradient_score_ma *= 1.0 - cfg.ma_alpha_gradient;
        state.binary_score_ma = (1.0 - cfg.ma_alpha_binary) * state.binary_score_ma - cfg.ma_alpha_binary;
        state.normalized_binary_ma = state.binary_score_ma / 2.0;
        state.final_score_ma = if state.binary_score_ma > 0.0 {
            cfg.ma_alpha_final * state.final_score_ma
        } else {
            0.0
        };
        state.last_evaluated_window = Some(window);

        debug!(
            peer = %peer,
            window,
            binary_score_ma = state.binary_score_ma,
            final_score_ma = state.final_score_ma,
            "failed contribution scored"
        );
        Ok(state)
    }

    /// Decay every known peer outside `eligible`, once per window.
    ///
    /// Peers back in the eligible set stop decaying but keep their reduced
    /// score. Returns the peers decayed by this call.
    pub fn apply_inactivity(&mut self, window: u64, eligible: &[PeerId]) -> Vec<PeerId> {
        let eligible: BTreeSet<PeerId> = eligible.iter().copied().collect();
        let decay = self.config.inactivity_decay;
        let mut decayed = Vec::new();
        for (peer, state) in self.states.iter_mut() {
            if eligible.contains(peer) {
                state.inactive_since = None;
                continue;
            }
            state.inactive_since.get_or_insert(window);
            if state.last_decayed_window != Some(window) {
                state.final_score_ma *= decay;
                state.last_decayed_window = Some(window);
                decayed.push(*peer);
            }
        }
        decayed
    }

    /// Power-normalized weights over every known peer.
    ///
    /// Only peers evaluated at least once with a positive `final_score_ma`
    /// qualify; everyone else gets exactly zero. All zero when none qualify.
    pub fn compute_weights(&mut self) -> WeightVector {
        let p = self.config.power_normalization_exponent;
        let powered: Vec<(PeerId, f64)> = self
            .states
            .iter()
            .map(|(peer, s)| {
                let qualifies = s.evaluations > 0 && s.final_score_ma > 0.0;
                (*peer, if qualifies { s.final_score_ma.powf(p) } else { 0.0 })
            })
            .collect();
        let total: f64 = powered.iter().map(|(_, v)| v).sum();

        let mut out = WeightVector::default();
        for (peer, value) in powered {
            let weight = if total > 0.0 { value / total } else { 0.0 };
            if let Some(state) = self.states.get_mut(&peer) {
                state.weight = weight;
            }
            out.peer_ids.push(peer);
            out.weights.push(weight);
        }
        out
    }
}

/// How a scoring probe perturbs the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub eval_batches: usize,
    /// Absolute step size: `eval_step_fraction * lr`.
    pub step: f64,
    pub sign_updates: bool,
}

fn mean_loss(trainer: &mut dyn Trainer, batches: &[Batch]) -> Result<f64> {
    if batches.is_empty() {
        return Ok(0.0);
    }
    let mut total = 0.0;
    for batch in batches {
        total += trainer.loss(batch)?;
    }
    Ok(total / batches.len() as f64)
}

/// `1 - after / before` for one step of `updates`, parameters restored after.
fn probe_improvement(
    trainer: &mut dyn Trainer,
    snapshot: &BTreeMap<String, Tensor>,
    updates: &BTreeMap<String, Tensor>,
    batches: &[Batch],
    cfg: &ProbeConfig,
) -> Result<f64> {
    let measured = (|| {
        let before = mean_loss(trainer, batches)?;
        for (name, update) in updates {
            if cfg.sign_updates {
                trainer.apply_update(name, &update.signum(), cfg.step)?;
            } else {
                trainer.apply_update(name, update, cfg.step)?;
            }
        }
        let after = mean_loss(trainer, batches)?;
        Ok::<_, SwarmError>((before, after))
    })();
    restore_parameters(trainer, snapshot)?;

    let (before, after) = measured?;
    if before == 0.0 || !before.is_finite() || !after.is_finite() {
        return Ok(0.0);
    }
    Ok(1.0 - after / before)
}

/// Measure a peer's decompressed gradient on its own data and on random data.
///
/// Parameters are snapshotted first and restored after each probe, so the
/// trainer is unchanged on return (including on error).
pub async fn evaluate_peer(
    trainer: &mut dyn Trainer,
    data: &dyn DataSource,
    updates: &BTreeMap<String, Tensor>,
    own_seed: u64,
    random_seed: u64,
    cfg: &ProbeConfig,
) -> Result<Evaluation> {
    let own_batches = data.batches(own_seed, cfg.eval_batches).await?;
    let random_batches = data.batches(random_seed, cfg.eval_batches).await?;

    let snapshot = snapshot_parameters(trainer);
    let own_improvement = probe_improvement(trainer, &snapshot, updates, &own_batches, cfg)?;
    let random_improvement = probe_improvement(trainer, &snapshot, updates, &random_batches, cfg)?;

    Ok(Evaluation {
        own_improvement,
        random_improvement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(own: f64, random: f64) -> Evaluation {
        Evaluation {
            own_improvement: own,
            random_improvement: random,
        }
    }

    #[test]
    fn first_evaluation_follows_formulas() {
        let mut board = ScoreBoard::new(ScoringConfig {
            ma_alpha_gradient: 0.5,
            ma_alpha_binary: 0.5,
            ma_alpha_final: 0.5,
            power_normalization_exponent: 2.0,
            inactivity_decay: 0.9,
        });
        let s = board.record_evaluation(PeerId(1), 1, eval(0.4, 0.1)).unwrap();
        assert_eq!(s.binary_indicator, 1);
        assert!((s.gradient_score_ma - 0.2).abs() < 1e-12);
        assert!((s.binary_score_ma - 0.5).abs() < 1e-12);
        assert!((s.normalized_binary_ma - 0.25).abs() < 1e-12);
        // final = 0.4 * 0.25 = 0.1; ma = 0.5 * 0 + 0.5 * 0.1
        assert!((s.final_score_ma - 0.05).abs() < 1e-12);
    }

    #[test]
    fn negative_final_clamps_to_zero() {
        let mut board = ScoreBoard::default();
        let s = board.record_evaluation(PeerId(1), 1, eval(0.3, 0.5)).unwrap();
        assert_eq!(s.binary_indicator, -1);
        assert_eq!(s.final_score_ma, 0.0);
    }

    #[test]
    fn duplicate_evaluation_in_window_is_rejected() {
        let mut board = ScoreBoard::default();
        board.record_evaluation(PeerId(1), 4, eval(0.3, 0.1)).unwrap();
        let err = board.record_evaluation(PeerId(1), 4, eval(0.3, 0.1)).unwrap_err();
        assert!(matches!(err, SwarmError::DuplicateEvaluation { peer: 1, window: 4 }));
        board.record_evaluation(PeerId(1), 5, eval(0.3, 0.1)).unwrap();
    }

    #[test]
    fn repeated_failures_reach_zero_and_recover() {
        let mut board = ScoreBoard::default();
        for w in 1..=5 {
            board.record_evaluation(PeerId(1), w, eval(0.3, 0.05)).unwrap();
        }
        let good = board.get(PeerId(1)).unwrap().final_score_ma;
        assert!(good > 0.0);

        let s = board.record_failure(PeerId(1), 6).unwrap();
        assert_eq!(s.binary_indicator, -1);
        assert!(s.final_score_ma < good);
        assert!(board.record_failure(PeerId(1), 6).is_err());

        let mut window = 7;
        while board.get(PeerId(1)).unwrap().final_score_ma > 0.0 {
            board.record_failure(PeerId(1), window).unwrap();
            window += 1;
            assert!(window < 50, "score never reached zero");
        }
        assert_eq!(board.compute_weights().weight_of(PeerId(1)), Some(0.0));

        // Reputation is recoverable.
        let mut recovered = false;
        for w in window..window + 200 {
            let s = board.record_evaluation(PeerId(1), w, eval(0.3, 0.05)).unwrap();
            if s.final_score_ma > 0.0 {
                recovered = true;
                break;
            }
        }
        assert!(recovered);
    }

    #[test]
    fn inactivity_decays_once_per_window() {
        let mut board = ScoreBoard::default();
        for w in 1..=5 {
            board.record_evaluation(PeerId(1), w, eval(0.3, 0.05)).unwrap();
        }
        let before = board.get(PeerId(1)).unwrap().final_score_ma;
        assert_eq!(board.apply_inactivity(6, &[]), vec![PeerId(1)]);
        assert!(board.apply_inactivity(6, &[]).is_empty());
        let after = board.get(PeerId(1)).unwrap().final_score_ma;
        assert!((after - before * 0.9).abs() < 1e-12);
        assert_eq!(board.get(PeerId(1)).unwrap().inactive_since, Some(6));

        // Reactivation stops decay without restoring.
        board.apply_inactivity(7, &[PeerId(1)]);
        let s = board.get(PeerId(1)).unwrap();
        assert_eq!(s.inactive_since, None);
        assert!((s.final_score_ma - after).abs() < 1e-12);
    }

    #[test]
    fn weights_are_power_normalized() {
        let mut board = ScoreBoard::default();
        board.states.insert(
            PeerId(1),
            PeerScoreState {
                final_score_ma: 1.0,
                evaluations: 1,
                ..Default::default()
            },
        );
        board.states.insert(
            PeerId(2),
            PeerScoreState {
                final_score_ma: 2.0,
                evaluations: 1,
                ..Default::default()
            },
        );
        board.states.insert(
            PeerId(3),
            PeerScoreState {
                final_score_ma: 5.0,
                evaluations: 0,
                ..Default::default()
            },
        );
        let w = board.compute_weights();
        assert!((w.weight_of(PeerId(1)).unwrap() - 0.2).abs() < 1e-12);
        assert!((w.weight_of(PeerId(2)).unwrap() - 0.8).abs() < 1e-12);
        assert_eq!(w.weight_of(PeerId(3)), Some(0.0));
        assert!((board.get(PeerId(2)).unwrap().weight - 0.8).abs() < 1e-12);
    }

    #[test]
    fn weights_all_zero_when_nobody_qualifies() {
        let mut board = ScoreBoard::default();
        board.record_evaluation(PeerId(1), 1, eval(0.1, 0.2)).unwrap();
        let w = board.compute_weights();
        assert_eq!(w.weights, vec![0.0]);
    }
}
