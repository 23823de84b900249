//! Full training-state checkpoints on a local and an optional remote store.
//!
//! Load prefers whichever source holds the newer window; a checkpoint that
//! cannot be decoded is reported as state corruption and the other source
//! (or a fresh start) is used instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use swarmgrad_store::{ArtifactKind, FetchOutcome, ObjectStore, PublishRecord};
use tracing::{error, info, warn};

use crate::codec::Tensor;
use crate::collaborators::{restore_parameters, snapshot_parameters, Trainer, TrainerState};
use crate::error::{Result, SwarmError};
use crate::metrics::METRICS;
use crate::obs;
use crate::scoring::ScoreBoard;

/// Everything needed to resume training at `window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub parameters: BTreeMap<String, Tensor>,
    pub trainer_state: TrainerState,
    pub momentum: BTreeMap<String, Tensor>,
    /// Last window whose update is included.
    pub window: u64,
    /// Window training started at; `global_step = window - start_window`.
    pub start_window: u64,
    pub global_step: u64,
    /// Peer reputations, present on evaluator checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<ScoreBoard>,
}

impl CheckpointState {
    pub fn capture(
        trainer: &dyn Trainer,
        momentum: &BTreeMap<String, Tensor>,
        window: u64,
        start_window: u64,
    ) -> Self {
        Self {
            parameters: snapshot_parameters(trainer),
            trainer_state: trainer.export_state(),
            momentum: momentum.clone(),
            window,
            start_window,
            global_step: window.saturating_sub(start_window),
            scores: None,
        }
    }

    pub fn with_scores(mut self, scores: &ScoreBoard) -> Self {
        self.scores = Some(scores.clone());
        self
    }

    /// Write parameters and optimizer/scheduler state back into `trainer`.
    pub fn restore_into(&self, trainer: &mut dyn Trainer) -> Result<()> {
        restore_parameters(trainer, &self.parameters)?;
        trainer.import_state(self.trainer_state.clone())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SwarmError::StateCorruption(e.to_string()))
    }
}

/// Which store a checkpoint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSource {
    Local,
    Remote,
}

impl CheckpointSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointSource::Local => "local",
            CheckpointSource::Remote => "remote",
        }
    }
}

pub struct CheckpointManager {
    local: Arc<ObjectStore>,
    remote: Option<Arc<ObjectStore>>,
    role_id: String,
}

impl CheckpointManager {
    pub fn new(local: Arc<ObjectStore>, remote: Option<Arc<ObjectStore>>, role_id: impl Into<String>) -> Self {
        Self {
            local,
            remote,
            role_id: role_id.into(),
        }
    }

    /// Persist locally, then mirror to the remote store.
    ///
    /// The local write must succeed; a failed remote mirror is only logged.
    pub async fn save(&self, state: &CheckpointState) -> Result<PublishRecord> {
        let bytes = state.to_bytes()?;
        let record = self
            .local
            .publish(&self.role_id, state.window, ArtifactKind::Checkpoint, &bytes)
            .await?;
        obs::emit_artifact_published(&record);
        METRICS.inc_artifacts_published();

        if let Some(remote) = &self.remote {
            match remote
                .publish(&self.role_id, state.window, ArtifactKind::Checkpoint, &bytes)
                .await
            {
                Ok(mirrored) => obs::emit_artifact_published(&mirrored),
                Err(e) => obs::emit_publish_failed(state.window, ArtifactKind::Checkpoint.as_str(), &e),
            }
        }
        Ok(record)
    }

    async fn latest(&self, store: &ObjectStore, source: CheckpointSource) -> Option<u64> {
        match store.latest_window(&self.role_id, ArtifactKind::Checkpoint).await {
            Ok(window) => window,
            Err(e) => {
                warn!(source = source.as_str(), error = %e, "cannot list checkpoints");
                None
            }
        }
    }

    async fn read(&self, store: &ObjectStore, window: u64, source: CheckpointSource) -> Option<CheckpointState> {
        match store
            .fetch(&self.role_id, window, ArtifactKind::Checkpoint, None)
            .await
        {
            FetchOutcome::Found(bytes) => match CheckpointState::from_bytes(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    error!(source = source.as_str(), window, error = %e, "checkpoint unreadable");
                    None
                }
            },
            other => {
                warn!(source = source.as_str(), window, outcome = other.label(), "checkpoint missing");
                None
            }
        }
    }

    /// Newest readable checkpoint, or `None` to start from scratch.
    pub async fn load(&self) -> Option<(CheckpointState, CheckpointSource)> {
        let local = self
            .latest(&self.local, CheckpointSource::Local)
            .await
            .map(|w| (w, CheckpointSource::Local, self.local.as_ref()));
        let remote = match &self.remote {
            Some(store) => self
                .latest(store, CheckpointSource::Remote)
                .await
                .map(|w| (w, CheckpointSource::Remote, store.as_ref())),
            None => None,
        };

        // Remote first only when it is strictly newer or local has nothing.
        let ordered = match (local, remote) {
            (Some(l), Some(r)) if r.0 > l.0 => vec![r, l],
            (Some(l), Some(r)) => vec![l, r],
            (Some(l), None) => vec![l],
            (None, Some(r)) => vec![r],
            (None, None) => Vec::new(),
        };

        for (window, source, store) in ordered {
            if let Some(state) = self.read(store, window, source).await {
                info!(source = source.as_str(), window, step = state.global_step, "checkpoint loaded");
                return Some((state, source));
            }
        }
        warn!(role = %self.role_id, "no usable checkpoint; starting from scratch");
        None
    }
}
