//! Seams to the systems this crate drives but does not implement.
//!
//! - [`Trainer`]: owns the model parameters and their gradients.
//! - [`DataSource`]: deterministic batches for a seed.
//! - [`Ledger`]: peer identity, activity, block timestamps, weight commits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Tensor;
use crate::error::Result;
use crate::peers::PeerId;

/// One batch of token rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub tokens: Vec<Vec<u32>>,
}

/// A parameter together with its current gradient, if one was computed.
#[derive(Debug, Clone, Copy)]
pub struct NamedParameter<'a> {
    pub name: &'a str,
    pub value: &'a Tensor,
    pub grad: Option<&'a Tensor>,
}

/// Opaque optimizer and scheduler state carried through checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub optimizer: serde_json::Value,
    pub scheduler: serde_json::Value,
}

/// Model owner. Calls are single-writer: the round driver holds the only
/// mutable reference while a window is being applied or scored.
pub trait Trainer: Send {
    /// Parameters in a stable order.
    fn named_parameters(&self) -> Vec<NamedParameter<'_>>;

    /// `p -= learning_rate * update`.
    fn apply_update(&mut self, name: &str, update: &Tensor, learning_rate: f64) -> Result<()>;

    /// Replace a parameter wholesale (used to restore snapshots).
    fn set_parameter(&mut self, name: &str, value: Tensor) -> Result<()>;

    /// Mean loss over one batch without touching gradients.
    fn loss(&mut self, batch: &Batch) -> Result<f64>;

    /// Forward and backward over `batch`, accumulating gradients. Returns the loss.
    fn compute_gradients(&mut self, batch: &Batch) -> Result<f64>;

    fn zero_grad(&mut self);

    fn export_state(&self) -> TrainerState;

    fn import_state(&mut self, state: TrainerState) -> Result<()>;
}

/// Copy every parameter out of the trainer.
pub fn snapshot_parameters(trainer: &dyn Trainer) -> BTreeMap<String, Tensor> {
    trainer
        .named_parameters()
        .into_iter()
        .map(|p| (p.name.to_string(), p.value.clone()))
        .collect()
}

/// Write a snapshot back.
pub fn restore_parameters(
    trainer: &mut dyn Trainer,
    snapshot: &BTreeMap<String, Tensor>,
) -> Result<()> {
    for (name, value) in snapshot {
        trainer.set_parameter(name, value.clone())?;
    }
    Ok(())
}

/// Dataset access. The same `(seed, count)` must always yield the same batches.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn batches(&self, seed: u64, count: usize) -> Result<Vec<Batch>>;
}

/// Incentive-network client.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Peers whose gradients should be gathered this window.
    async fn candidate_peer_ids(&self) -> Result<Vec<PeerId>>;

    /// Peers that may be scored this window.
    async fn eligible_evaluation_peer_ids(&self) -> Result<Vec<PeerId>>;

    /// Timestamp of the first block of `window`, once that block exists.
    async fn anchor_timestamp(&self, window: u64) -> Result<Option<DateTime<Utc>>>;

    async fn commit_weights(&self, peer_ids: &[PeerId], weights: &[f64]) -> Result<()>;
}
