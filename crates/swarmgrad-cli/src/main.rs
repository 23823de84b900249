//! swarmgrad - operator tooling for gradient exchange stores
//!
//! ## Commands
//!
//! - `inspect`: summarize a stored artifact file
//! - `list`: show stored windows for a role and kind in a local store
//! - `cleanup`: apply retention to a role and kind in a local store
//! - `lr`: print the scheduled learning rate at a step

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use swarmgrad_core::{
    AggregationArtifact, CheckpointState, DebugSnapshot, GradientArtifact, HParams, LrSchedule,
};
use swarmgrad_store::{ArtifactKind, LocalBackend, ObjectStore, RetentionResult};

#[derive(Parser)]
#[command(name = "swarmgrad")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and maintain swarmgrad artifact stores", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize an artifact file (gradient, aggregation, debug or checkpoint)
    Inspect {
        /// Path to the artifact (JSON)
        path: PathBuf,
    },

    /// List stored windows for a role and kind
    List {
        /// Local store root
        #[arg(long)]
        root: PathBuf,

        /// Role id (peer uid)
        #[arg(long)]
        role: String,

        /// Artifact kind: gradient, debug, checkpoint or aggregation
        #[arg(long, default_value = "gradient")]
        kind: ArtifactKind,

        /// Protocol version tag of the keys to list
        #[arg(long, env = "SWARMGRAD_PROTOCOL_VERSION", default_value = "3")]
        protocol_version: String,
    },

    /// Delete all but the newest N windows for a role and kind
    Cleanup {
        /// Local store root
        #[arg(long)]
        root: PathBuf,

        /// Role id (peer uid)
        #[arg(long)]
        role: String,

        /// Artifact kind: gradient, debug, checkpoint or aggregation
        #[arg(long)]
        kind: ArtifactKind,

        /// Windows to keep
        #[arg(long)]
        retain: usize,
    },

    /// Print the learning rate the schedule gives at a step
    Lr {
        /// Global step (windows since training started)
        #[arg(long)]
        step: u64,

        /// Hyperparameter file (JSON); defaults plus env overrides otherwise
        #[arg(long)]
        hparams: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    swarmgrad_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Inspect { path } => cmd_inspect(&path),
        Commands::List {
            root,
            role,
            kind,
            protocol_version,
        } => cmd_list(&root, &role, kind, &protocol_version).await,
        Commands::Cleanup {
            root,
            role,
            kind,
            retain,
        } => cmd_cleanup(&root, &role, kind, retain).await.map(|_| ()),
        Commands::Lr { step, hparams } => cmd_lr(step, hparams.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, PartialEq)]
struct ParamSummary {
    name: String,
    entries: usize,
    min_index: Option<u32>,
    max_index: Option<u32>,
    value_norm: f64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Summary {
    Gradient {
        params: Vec<ParamSummary>,
    },
    Aggregation {
        window: u64,
        params: Vec<(String, Vec<usize>)>,
    },
    Debug {
        window: u64,
        successful_peers: usize,
        skipped_peers: usize,
    },
    Checkpoint {
        window: u64,
        start_window: u64,
        global_step: u64,
        params: usize,
    },
}

fn summarize(bytes: &[u8]) -> Result<Summary> {
    if let Ok(state) = serde_json::from_slice::<CheckpointState>(bytes) {
        return Ok(Summary::Checkpoint {
            window: state.window,
            start_window: state.start_window,
            global_step: state.global_step,
            params: state.parameters.len(),
        });
    }
    if let Ok(aggregation) = serde_json::from_slice::<AggregationArtifact>(bytes) {
        return Ok(Summary::Aggregation {
            window: aggregation.window,
            params: aggregation
                .params
                .into_iter()
                .map(|(name, packed)| (name, packed.shape))
                .collect(),
        });
    }
    if let Ok(snapshot) = serde_json::from_slice::<DebugSnapshot>(bytes) {
        return Ok(Summary::Debug {
            window: snapshot.window,
            successful_peers: snapshot.successful_peers.len(),
            skipped_peers: snapshot.skipped_peers.len(),
        });
    }

    let artifact = GradientArtifact::from_bytes(bytes).context("Unrecognized artifact")?;
    let params = artifact
        .params
        .iter()
        .map(|(name, p)| ParamSummary {
            name: name.clone(),
            entries: p.len(),
            min_index: p.idxs.iter().min().copied(),
            max_index: p.idxs.iter().max().copied(),
            value_norm: p
                .vals
                .iter()
                .map(|v| f64::from(*v).powi(2))
                .sum::<f64>()
                .sqrt(),
        })
        .collect();
    Ok(Summary::Gradient { params })
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path).context(format!("Failed to read {}", path.display()))?;
    let summary = summarize(&bytes)?;

    match &summary {
        Summary::Gradient { params } => {
            println!("gradient artifact, {} parameters", params.len());
            for p in params {
                let range = match (p.min_index, p.max_index) {
                    (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
                    _ => "-".to_string(),
                };
                println!(
                    "  {:<24} entries={:<6} idx={:<12} |vals|={:.6}",
                    p.name, p.entries, range, p.value_norm
                );
            }
        }
        Summary::Aggregation { window, params } => {
            println!("aggregation artifact, window {window}");
            for (name, shape) in params {
                println!("  {name:<24} shape={shape:?}");
            }
        }
        Summary::Debug {
            window,
            successful_peers,
            skipped_peers,
        } => {
            println!("debug snapshot, window {window}");
            println!("  successful peers: {successful_peers}");
            println!("  skipped peers:    {skipped_peers}");
        }
        Summary::Checkpoint {
            window,
            start_window,
            global_step,
            params,
        } => {
            println!("checkpoint, window {window}");
            println!("  start window: {start_window}");
            println!("  global step:  {global_step}");
            println!("  parameters:   {params}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list / cleanup
// ---------------------------------------------------------------------------

fn local_store(root: &Path, version: &str) -> Result<ObjectStore> {
    let backend = LocalBackend::new(root)
        .context(format!("Failed to open local store at {}", root.display()))?;
    Ok(ObjectStore::new(Arc::new(backend), version, usize::MAX))
}

async fn cmd_list(root: &Path, role: &str, kind: ArtifactKind, version: &str) -> Result<()> {
    let store = local_store(root, version)?;
    let windows = store.list_windows(role, kind).await?;

    if windows.is_empty() {
        println!("No {kind} artifacts for role {role}");
        return Ok(());
    }
    for window in windows {
        println!("{kind}-{window}-{role}-v{version}");
    }
    Ok(())
}

/// Retention spans every version of the series, so the version tag does
/// not matter here.
async fn cmd_cleanup(root: &Path, role: &str, kind: ArtifactKind, retain: usize) -> Result<RetentionResult> {
    let store = local_store(root, "cli")?;
    let result = store.cleanup(role, kind, retain).await?;
    info!(
        role = %role,
        kind = %kind,
        removed = result.removed_count,
        remaining = result.remaining_count,
        "retention applied"
    );
    for key in &result.removed_keys {
        println!("removed {key}");
    }
    println!(
        "{} removed, {} remaining",
        result.removed_count, result.remaining_count
    );
    Ok(result)
}

// ---------------------------------------------------------------------------
// lr
// ---------------------------------------------------------------------------

fn load_hparams(path: Option<&Path>) -> Result<HParams> {
    let mut hparams = match path {
        Some(p) => HParams::from_json_file(p)
            .context(format!("Failed to load hyperparameters from {}", p.display()))?,
        None => HParams::default(),
    };
    hparams.apply_env_overrides()?;
    hparams.validate()?;
    Ok(hparams)
}

fn cmd_lr(step: u64, hparams: Option<&Path>) -> Result<()> {
    let hparams = load_hparams(hparams)?;
    let lr = LrSchedule::from_hparams(&hparams).lr_at(step);
    println!("{lr:.8e}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use swarmgrad_core::{SparseParam, Tensor};

    #[test]
    fn summarize_gradient() {
        let mut params = BTreeMap::new();
        params.insert(
            "w".to_string(),
            SparseParam {
                idxs: vec![3, 0, 7],
                vals: vec![3.0, 0.0, 4.0],
            },
        );
        let bytes = GradientArtifact { params }.to_bytes().unwrap();
        let Summary::Gradient { params } = summarize(&bytes).unwrap() else {
            panic!("expected gradient summary");
        };
        assert_eq!(
            params,
            vec![ParamSummary {
                name: "w".to_string(),
                entries: 3,
                min_index: Some(0),
                max_index: Some(7),
                value_norm: 5.0,
            }]
        );
    }

    #[test]
    fn summarize_aggregation() {
        let mut updates = BTreeMap::new();
        updates.insert("b".to_string(), Tensor::vector(vec![1.0, -1.0, 0.5]));
        let artifact = AggregationArtifact::from_updates(12, &updates);
        let bytes = serde_json::to_vec(&artifact).unwrap();
        assert_eq!(
            summarize(&bytes).unwrap(),
            Summary::Aggregation {
                window: 12,
                params: vec![("b".to_string(), vec![3])],
            }
        );
    }

    #[test]
    fn summarize_rejects_garbage() {
        assert!(summarize(b"[1, 2, 3]").is_err());
    }

    #[tokio::test]
    async fn cleanup_keeps_newest_windows() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path(), "3").unwrap();
        for window in 1..=5 {
            store
                .publish("17", window, ArtifactKind::Debug, b"{}")
                .await
                .unwrap();
        }
        store.settle().await;

        let result = cmd_cleanup(dir.path(), "17", ArtifactKind::Debug, 2).await.unwrap();
        assert_eq!(result.removed_count, 3);
        assert_eq!(store.list_windows("17", ArtifactKind::Debug).await.unwrap(), vec![4, 5]);
    }

    #[test]
    fn lr_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        std::fs::write(&path, r#"{"learning_rate": 0.01, "warmup_steps": 10}"#).unwrap();
        let hparams = load_hparams(Some(&path)).unwrap();
        let schedule = LrSchedule::from_hparams(&hparams);
        assert!((schedule.lr_at(0) - 0.001).abs() < 1e-12);
    }
}
