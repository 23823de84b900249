//! In-memory collaborators for tests and local simulation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::Tensor;
use crate::collaborators::{Batch, DataSource, Ledger, NamedParameter, Trainer, TrainerState};
use crate::error::{Result, SwarmError};
use crate::peers::PeerId;

// ---------------------------------------------------------------------------
// QuadraticTrainer
// ---------------------------------------------------------------------------

/// Trainer whose loss is the mean squared distance of every parameter
/// element to a batch-dependent target: the mean token id divided by 10.
#[derive(Debug, Clone, Default)]
pub struct QuadraticTrainer {
    params: BTreeMap<String, Tensor>,
    grads: BTreeMap<String, Tensor>,
    state: TrainerState,
}

impl QuadraticTrainer {
    /// One vector parameter per `(name, values)` pair.
    pub fn new<'a>(params: impl IntoIterator<Item = (&'a str, Vec<f32>)>) -> Self {
        Self {
            params: params
                .into_iter()
                .map(|(name, values)| (name.to_string(), Tensor::vector(values)))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_tensor(mut self, name: &str, value: Tensor) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    /// Overwrite the accumulated gradient of `name`.
    pub fn set_gradient(&mut self, name: &str, grad: Tensor) {
        self.grads.insert(name.to_string(), grad);
    }

    pub fn target(batch: &Batch) -> f32 {
        let (sum, n) = batch
            .tokens
            .iter()
            .flatten()
            .fold((0u64, 0u64), |(s, n), &t| (s + u64::from(t), n + 1));
        if n == 0 {
            return 0.0;
        }
        (sum as f64 / n as f64 / 10.0) as f32
    }

    fn numel(&self) -> usize {
        self.params.values().map(Tensor::numel).sum()
    }

    fn unknown(name: &str) -> SwarmError {
        SwarmError::Collaborator(format!("unknown parameter {name}"))
    }
}

impl Trainer for QuadraticTrainer {
    fn named_parameters(&self) -> Vec<NamedParameter<'_>> {
        self.params
            .iter()
            .map(|(name, value)| NamedParameter {
                name,
                value,
                grad: self.grads.get(name),
            })
            .collect()
    }

    fn apply_update(&mut self, name: &str, update: &Tensor, learning_rate: f64) -> Result<()> {
        let param = self.params.get_mut(name).ok_or_else(|| Self::unknown(name))?;
        param.add_scaled(update, -(learning_rate as f32))?;
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: Tensor) -> Result<()> {
        let param = self.params.get_mut(name).ok_or_else(|| Self::unknown(name))?;
        *param = value;
        Ok(())
    }

    fn loss(&mut self, batch: &Batch) -> Result<f64> {
        let n = self.numel();
        if n == 0 {
            return Ok(0.0);
        }
        let c = f64::from(Self::target(batch));
        let total: f64 = self
            .params
            .values()
            .flat_map(|t| t.data().iter())
            .map(|&v| (f64::from(v) - c).powi(2))
            .sum();
        Ok(total / n as f64)
    }

    fn compute_gradients(&mut self, batch: &Batch) -> Result<f64> {
        let loss = self.loss(batch)?;
        let n = self.numel().max(1) as f32;
        let c = Self::target(batch);
        for (name, value) in &self.params {
            let grad = self
                .grads
                .entry(name.clone())
                .or_insert_with(|| Tensor::zeros(value.shape()));
            for (g, &v) in grad.data_mut().iter_mut().zip(value.data()) {
                *g += 2.0 * (v - c) / n;
            }
        }
        Ok(loss)
    }

    fn zero_grad(&mut self) {
        self.grads.clear();
    }

    fn export_state(&self) -> TrainerState {
        self.state.clone()
    }

    fn import_state(&mut self, state: TrainerState) -> Result<()> {
        self.state = state;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SeededData
// ---------------------------------------------------------------------------

/// Deterministic token batches drawn from a seeded RNG.
#[derive(Debug, Clone)]
pub struct SeededData {
    rows: usize,
    row_len: usize,
    vocab: u32,
    fixed: BTreeMap<u64, u32>,
}

impl SeededData {
    pub fn new(rows: usize, row_len: usize, vocab: u32) -> Self {
        Self {
            rows,
            row_len,
            vocab: vocab.max(1),
            fixed: BTreeMap::new(),
        }
    }

    /// Every token of every batch for `seed` becomes `token`.
    pub fn fix_seed(mut self, seed: u64, token: u32) -> Self {
        self.fixed.insert(seed, token);
        self
    }
}

impl Default for SeededData {
    fn default() -> Self {
        Self::new(2, 8, 100)
    }
}

#[async_trait]
impl DataSource for SeededData {
    async fn batches(&self, seed: u64, count: usize) -> Result<Vec<Batch>> {
        if let Some(&token) = self.fixed.get(&seed) {
            let batch = Batch {
                tokens: vec![vec![token; self.row_len]; self.rows],
            };
            return Ok(vec![batch; count]);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        Ok((0..count)
            .map(|_| Batch {
                tokens: (0..self.rows)
                    .map(|_| (0..self.row_len).map(|_| rng.gen_range(0..self.vocab)).collect())
                    .collect(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FixedLedger
// ---------------------------------------------------------------------------

/// Ledger with settable peer sets and anchors that records weight commits.
#[derive(Debug, Default)]
pub struct FixedLedger {
    candidates: Mutex<Vec<PeerId>>,
    eligible: Mutex<Vec<PeerId>>,
    anchors: Mutex<HashMap<u64, DateTime<Utc>>>,
    anchor_failures: Mutex<u32>,
    commits: Mutex<Vec<(Vec<PeerId>, Vec<f64>)>>,
}

impl FixedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_candidates(&self, peers: &[PeerId]) {
        *self.candidates.lock().unwrap() = peers.to_vec();
    }

    pub fn set_eligible(&self, peers: &[PeerId]) {
        *self.eligible.lock().unwrap() = peers.to_vec();
    }

    pub fn set_anchor(&self, window: u64, at: DateTime<Utc>) {
        self.anchors.lock().unwrap().insert(window, at);
    }

    /// The next `n` anchor lookups fail with a collaborator error.
    pub fn fail_anchor_lookups(&self, n: u32) {
        *self.anchor_failures.lock().unwrap() = n;
    }

    pub fn commits(&self) -> Vec<(Vec<PeerId>, Vec<f64>)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for FixedLedger {
    async fn candidate_peer_ids(&self) -> Result<Vec<PeerId>> {
        Ok(self.candidates.lock().unwrap().clone())
    }

    async fn eligible_evaluation_peer_ids(&self) -> Result<Vec<PeerId>> {
        Ok(self.eligible.lock().unwrap().clone())
    }

    async fn anchor_timestamp(&self, window: u64) -> Result<Option<DateTime<Utc>>> {
        {
            let mut failures = self.anchor_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SwarmError::Collaborator("ledger unreachable".into()));
            }
        }
        Ok(self.anchors.lock().unwrap().get(&window).copied())
    }

    async fn commit_weights(&self, peer_ids: &[PeerId], weights: &[f64]) -> Result<()> {
        self.commits
            .lock()
            .unwrap()
            .push((peer_ids.to_vec(), weights.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_gradient_points_to_target() {
        let mut trainer = QuadraticTrainer::new([("w", vec![1.0, -1.0])]);
        let batch = Batch {
            tokens: vec![vec![0, 0]],
        };
        let before = trainer.loss(&batch).unwrap();
        assert!((before - 1.0).abs() < 1e-12);

        trainer.compute_gradients(&batch).unwrap();
        let grad = trainer.named_parameters()[0].grad.unwrap().clone();
        assert_eq!(grad.data(), &[1.0, -1.0]);

        trainer.apply_update("w", &grad, 0.5).unwrap();
        assert!(trainer.loss(&batch).unwrap() < before);
    }

    #[tokio::test]
    async fn seeded_data_is_deterministic() {
        let data = SeededData::default();
        let a = data.batches(42, 3).await.unwrap();
        let b = data.batches(42, 3).await.unwrap();
        let c = data.batches(43, 3).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn ledger_fails_then_answers() {
        let ledger = FixedLedger::new();
        ledger.set_anchor(3, Utc::now());
        ledger.fail_anchor_lookups(1);
        assert!(ledger.anchor_timestamp(3).await.is_err());
        assert!(ledger.anchor_timestamp(3).await.unwrap().is_some());
        assert!(ledger.anchor_timestamp(4).await.unwrap().is_none());
    }
}
