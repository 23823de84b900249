use swarmgrad_store::{ArtifactKind, PublishRecord};
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

use super::{data_seed, Node, RoundReport};
use crate::clock::WindowClock;
use crate::error::Result;
use crate::gather::GatherOutcome;
use crate::metrics::METRICS;
use crate::obs;
use crate::peers::PeerId;
use crate::prepare::GradientPreparer;

/// Trains on its own data slice, publishes the compressed gradient, then
/// gathers every peer's gradient for the same window and applies the merge.
pub struct Miner {
    node: Node,
    preparer: GradientPreparer,
    /// Peer whose aggregation artifacts are replayed on resume.
    aggregator: Option<PeerId>,
}

impl Miner {
    pub fn new(node: Node) -> Self {
        let preparer = GradientPreparer::new(node.hparams.momentum_decay, node.hparams.allowed_topk);
        Self {
            node,
            preparer,
            aggregator: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: PeerId) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn preparer(&self) -> &GradientPreparer {
        &self.preparer
    }

    /// Restore state and momentum, replay missed windows, return the first
    /// window to run live.
    pub async fn resume(&mut self, clock: &WindowClock) -> Result<u64> {
        let outcome = self.node.resume(clock, self.aggregator).await?;
        if outcome.checkpoint_window.is_some() {
            self.preparer.set_momentum(outcome.momentum);
        }
        Ok(outcome.catch_up.next_window)
    }

    /// Publish during window `w`, aggregate `w` once `w + 1` begins.
    pub async fn run(&mut self, clock: &WindowClock, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut next = self.resume(clock).await?;
        loop {
            let window = tokio::select! {
                w = clock.wait_until(next) => w,
                _ = shutdown.changed() => break,
            };
            let span = obs::window_span(window, "miner");
            if let Err(e) = self.train_and_publish(window).instrument(span.clone()).await {
                error!(window, error = %e, "training step failed");
            }
            tokio::select! {
                _ = clock.wait_until(window + 1) => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.aggregate(window).instrument(span).await {
                error!(window, error = %e, "miner round aborted");
            }
            next = window + 1;
        }
        Ok(())
    }

    /// Both halves back to back, for callers that drive timing themselves.
    pub async fn run_window(&mut self, window: u64) -> Result<RoundReport> {
        let span = obs::window_span(window, "miner");
        self.train_and_publish(window).instrument(span.clone()).await?;
        self.aggregate(window).instrument(span).await
    }

    /// Accumulate gradients over this window's batches and publish the
    /// compressed, momentum-corrected result tagged with `window`.
    pub async fn train_and_publish(&mut self, window: u64) -> Result<Option<PublishRecord>> {
        let node = &mut self.node;
        let batches = node
            .data
            .batches(data_seed(window, node.uid), node.hparams.train_batches)
            .await?;

        node.trainer.zero_grad();
        let mut loss = 0.0;
        for batch in &batches {
            loss += node.trainer.compute_gradients(batch)?;
        }
        if !batches.is_empty() {
            loss /= batches.len() as f64;
        }

        let learning_rate = node.schedule.lr_at(node.step_of(window));
        let artifact = self
            .preparer
            .prepare(node.trainer.as_ref(), &mut node.dct, learning_rate)?;
        node.trainer.zero_grad();
        info!(window, loss, entries = artifact.total_entries(), "gradient prepared");

        let bytes = artifact.to_bytes()?;
        Ok(node.publish(window, ArtifactKind::Gradient, &bytes).await)
    }

    /// Gather every peer, own gradient included, and apply the merge.
    pub async fn aggregate(&mut self, window: u64) -> Result<RoundReport> {
        let mut candidates = self.node.ledger.candidate_peer_ids().await?;
        candidates.push(self.node.uid);
        let peers = self.node.directory.gather_peers(&candidates, None);
        let outcome = self.node.gather_window(window, &peers).await?;

        let mut report = RoundReport::from_outcome(&outcome);
        let result = match outcome {
            GatherOutcome::Aggregated(result) => result,
            GatherOutcome::Failed(_) => {
                METRICS.inc_rounds_deferred();
                warn!(window, "no contributions; round deferred");
                return Ok(report);
            }
        };

        self.node.apply_merged(window, &result)?;
        self.node.publish_debug(window, &result).await?;
        report.checkpoint = self
            .node
            .maybe_checkpoint(window, self.preparer.momentum(), None)
            .await;

        METRICS.inc_windows_processed();
        Ok(report)
    }
}
