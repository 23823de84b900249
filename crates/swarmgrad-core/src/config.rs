//! Protocol hyperparameters.
//!
//! Loaded from a JSON file, then overridden by `SWARMGRAD_*` environment
//! variables, then validated. Every field has a default so a partial file is
//! enough.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use swarmgrad_store::{ArtifactKind, Backend, ObjectStore};

use crate::error::{Result, SwarmError};

/// Every tunable constant of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    /// Tag baked into every storage key; peers on other versions are invisible.
    pub protocol_version: String,
    pub blocks_per_window: u64,
    /// Length of the accepted publish window after the anchor block.
    pub time_window_delta_seconds: i64,

    // Codec
    pub target_chunk: usize,
    pub allowed_topk: usize,

    // Gather
    pub gather_timeout_seconds: u64,

    // Storage
    pub retention_count: usize,
    pub stale_retention: usize,
    pub checkpoint_retention: usize,
    pub checkpoint_frequency_windows: u64,

    // Scoring
    pub ma_alpha_gradient: f64,
    pub ma_alpha_binary: f64,
    pub ma_alpha_final: f64,
    pub power_normalization_exponent: f64,
    pub inactivity_decay: f64,
    pub eval_batches: usize,
    pub eval_step_fraction: f64,
    pub eval_peer_sample: usize,

    // Optimization
    /// Batches a miner accumulates gradients over per window.
    pub train_batches: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub momentum_decay: f64,
    pub warmup_steps: u64,
    pub cosine_t0: u64,
    pub cosine_t_mult: u64,
    pub eta_min_factor: f64,
    /// Apply `sign(update)` instead of the raw merged update.
    pub sign_updates: bool,

    /// L2 distance above which catch-up drift is reported at `warn`.
    pub debug_drift_threshold: f64,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            protocol_version: "3".to_string(),
            blocks_per_window: 7,
            time_window_delta_seconds: 30,
            target_chunk: 64,
            allowed_topk: 32,
            gather_timeout_seconds: 30,
            retention_count: 10,
            stale_retention: 10,
            checkpoint_retention: 3,
            checkpoint_frequency_windows: 100,
            ma_alpha_gradient: 0.05,
            ma_alpha_binary: 0.05,
            ma_alpha_final: 0.95,
            power_normalization_exponent: 2.0,
            inactivity_decay: 0.9,
            eval_batches: 2,
            eval_step_fraction: 0.25,
            eval_peer_sample: 4,
            train_batches: 4,
            learning_rate: 4e-4,
            weight_decay: 0.1,
            momentum_decay: 0.999,
            warmup_steps: 250,
            cosine_t0: 10_000,
            cosine_t_mult: 2,
            eta_min_factor: 0.1,
            sign_updates: true,
            debug_drift_threshold: 0.1,
        }
    }
}

/// Look up and parse one variable, if set.
fn env_value<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SwarmError::Config(format!("{name}={raw} is not a valid value"))),
        None => Ok(None),
    }
}

macro_rules! override_from_env {
    ($params:expr, $lookup:expr, $( $field:ident => $var:literal ),+ $(,)?) => {
        $(
            if let Some(value) = env_value($lookup, $var)? {
                $params.$field = value;
            }
        )+
    };
}

impl HParams {
    /// Parse a (possibly partial) JSON file; missing fields keep defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Defaults, then `SWARMGRAD_*` overrides, then validation.
    pub fn from_env() -> Result<Self> {
        let mut params = Self::default();
        params.apply_env_overrides()?;
        params.validate()?;
        Ok(params)
    }

    /// Override fields from `SWARMGRAD_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|name| std::env::var(name).ok())
    }

    /// Override fields from any `SWARMGRAD_*` name lookup.
    pub fn apply_overrides_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        override_from_env!(self, &lookup,
            protocol_version => "SWARMGRAD_PROTOCOL_VERSION",
            blocks_per_window => "SWARMGRAD_BLOCKS_PER_WINDOW",
            time_window_delta_seconds => "SWARMGRAD_TIME_WINDOW_DELTA_SECONDS",
            target_chunk => "SWARMGRAD_TARGET_CHUNK",
            allowed_topk => "SWARMGRAD_ALLOWED_TOPK",
            gather_timeout_seconds => "SWARMGRAD_GATHER_TIMEOUT_SECONDS",
            retention_count => "SWARMGRAD_RETENTION_COUNT",
            stale_retention => "SWARMGRAD_STALE_RETENTION",
            checkpoint_retention => "SWARMGRAD_CHECKPOINT_RETENTION",
            checkpoint_frequency_windows => "SWARMGRAD_CHECKPOINT_FREQUENCY_WINDOWS",
            ma_alpha_gradient => "SWARMGRAD_MA_ALPHA_GRADIENT",
            ma_alpha_binary => "SWARMGRAD_MA_ALPHA_BINARY",
            ma_alpha_final => "SWARMGRAD_MA_ALPHA_FINAL",
            power_normalization_exponent => "SWARMGRAD_POWER_NORMALIZATION_EXPONENT",
            inactivity_decay => "SWARMGRAD_INACTIVITY_DECAY",
            eval_batches => "SWARMGRAD_EVAL_BATCHES",
            eval_step_fraction => "SWARMGRAD_EVAL_STEP_FRACTION",
            eval_peer_sample => "SWARMGRAD_EVAL_PEER_SAMPLE",
            train_batches => "SWARMGRAD_TRAIN_BATCHES",
            learning_rate => "SWARMGRAD_LEARNING_RATE",
            weight_decay => "SWARMGRAD_WEIGHT_DECAY",
            momentum_decay => "SWARMGRAD_MOMENTUM_DECAY",
            warmup_steps => "SWARMGRAD_WARMUP_STEPS",
            cosine_t0 => "SWARMGRAD_COSINE_T0",
            cosine_t_mult => "SWARMGRAD_COSINE_T_MULT",
            eta_min_factor => "SWARMGRAD_ETA_MIN_FACTOR",
            sign_updates => "SWARMGRAD_SIGN_UPDATES",
            debug_drift_threshold => "SWARMGRAD_DEBUG_DRIFT_THRESHOLD",
        );
        Ok(())
    }

    /// Store tagged with this protocol version and wired to its retention
    /// counts: `stale_retention` windows of gradients, `checkpoint_retention`
    /// checkpoints, `retention_count` for everything else.
    pub fn object_store(&self, backend: Arc<dyn Backend>) -> ObjectStore {
        ObjectStore::new(backend, self.protocol_version.clone(), self.retention_count)
            .with_retention(ArtifactKind::Gradient, self.stale_retention)
            .with_retention(ArtifactKind::Checkpoint, self.checkpoint_retention)
    }

    /// Reject constants that would break an invariant downstream.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SwarmError::Config(msg.to_string()));
        let unit = |v: f64| v > 0.0 && v <= 1.0;

        if self.protocol_version.is_empty() || self.protocol_version.contains('-') {
            return fail("protocol_version must be non-empty and free of '-'");
        }
        if self.blocks_per_window == 0 {
            return fail("blocks_per_window must be at least 1");
        }
        if self.time_window_delta_seconds <= 0 {
            return fail("time_window_delta_seconds must be positive");
        }
        if self.target_chunk == 0 || self.allowed_topk == 0 {
            return fail("target_chunk and allowed_topk must be at least 1");
        }
        if self.retention_count == 0 || self.stale_retention == 0 || self.checkpoint_retention == 0 {
            return fail("retention counts must be at least 1");
        }
        if self.checkpoint_frequency_windows == 0 {
            return fail("checkpoint_frequency_windows must be at least 1");
        }
        if !unit(self.ma_alpha_gradient) || !unit(self.ma_alpha_binary) {
            return fail("ma_alpha_gradient and ma_alpha_binary must be in (0, 1]");
        }
        if !(0.0..1.0).contains(&self.ma_alpha_final) {
            return fail("ma_alpha_final must be in [0, 1)");
        }
        if !(self.power_normalization_exponent > 0.0) {
            return fail("power_normalization_exponent must be positive");
        }
        if !(0.0..=1.0).contains(&self.inactivity_decay) {
            return fail("inactivity_decay must be in [0, 1]");
        }
        if self.train_batches == 0 {
            return fail("train_batches must be at least 1");
        }
        if self.eval_batches == 0 || !(self.eval_step_fraction > 0.0) {
            return fail("eval_batches and eval_step_fraction must be positive");
        }
        if !(self.learning_rate > 0.0) || self.weight_decay < 0.0 {
            return fail("learning_rate must be positive and weight_decay non-negative");
        }
        if !(0.0..1.0).contains(&self.momentum_decay) {
            return fail("momentum_decay must be in [0, 1)");
        }
        if self.cosine_t0 == 0 || self.cosine_t_mult == 0 {
            return fail("cosine_t0 and cosine_t_mult must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.eta_min_factor) {
            return fail("eta_min_factor must be in [0, 1]");
        }
        Ok(())
    }

    /// Window a block belongs to.
    pub fn window_of_block(&self, block: u64) -> u64 {
        block / self.blocks_per_window.max(1)
    }
}
