//! swarmgrad-core: gradient exchange protocol for decentralized training
//!
//! Re-exports the codec, gather protocol, scoring engine, checkpoint
//! catch-up and the per-window round drivers.

pub mod artifact;
pub mod catchup;
pub mod checkpoint;
pub mod clock;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fakes;
pub mod gather;
pub mod metrics;
pub mod obs;
pub mod peers;
pub mod prepare;
pub mod rounds;
pub mod schedule;
pub mod scoring;
pub mod telemetry;

pub use artifact::{
    AggregationArtifact, ArtifactValidator, DebugSnapshot, GradientArtifact, PackedSigns,
};
pub use catchup::{apply_with_weight_decay, CatchUp, CatchUpReport, ReplaySource};
pub use checkpoint::{CheckpointManager, CheckpointSource, CheckpointState};
pub use clock::{listener_backoff, spawn_block_listener, BlockSource, WindowClock};
pub use codec::{chunk_size, compress, ChunkGeometry, CodecError, Encoded, SparseParam, Tensor, TransformDct};
pub use collaborators::{Batch, DataSource, Ledger, NamedParameter, Trainer, TrainerState};
pub use config::HParams;
pub use error::{Result, SwarmError, ValidationError};
pub use gather::{
    gather, merge_artifacts, resolve_time_window, GatherOutcome, GatherPhase, GatherRequest,
    GatherResult, SkipReason, SkippedPeer,
};
pub use peers::{PeerDirectory, PeerId};
pub use prepare::GradientPreparer;
pub use rounds::{data_seed, parameter_geometries, Evaluator, Miner, Node, ResumeOutcome, RoundReport};
pub use schedule::LrSchedule;
pub use scoring::{
    evaluate_peer, Evaluation, PeerScoreState, ProbeConfig, ScoreBoard, ScoringConfig,
    WeightVector,
};

pub use swarmgrad_store::{ArtifactKind, FetchOutcome, ObjectStore, PublishRecord, TimeWindow};
