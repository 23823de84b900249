//! Shared current-window value and the background block listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use swarmgrad_store::RetryPolicy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Monotonic current window, readable without locking and awaitable.
pub struct WindowClock {
    current: AtomicU64,
    tx: watch::Sender<u64>,
}

impl WindowClock {
    pub fn new(initial: u64) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            current: AtomicU64::new(initial),
            tx,
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Move forward to `window`. Returns `true` if the value changed;
    /// older windows are ignored.
    pub fn advance_to(&self, window: u64) -> bool {
        let previous = self.current.fetch_max(window, Ordering::AcqRel);
        if window > previous {
            self.tx.send_replace(window);
            true
        } else {
            false
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Resolve once the current window is at least `window`.
    pub async fn wait_until(&self, window: u64) -> u64 {
        let mut rx = self.subscribe();
        loop {
            let now = self.current();
            if now >= window {
                return now;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}

/// Stream of finalized block numbers.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Next block number. `Ok(None)` means the source is closed for good;
    /// an error means the connection dropped.
    async fn next_block(&self) -> Result<Option<u64>>;

    async fn reconnect(&self) -> Result<()>;
}

/// Backoff used between reconnect attempts: 1 s doubling up to 60 s.
pub fn listener_backoff() -> RetryPolicy {
    RetryPolicy::exponential(u32::MAX, Duration::from_secs(1), Duration::from_secs(60))
}

/// Follow `source`, publishing `block / blocks_per_window` into `clock`.
///
/// Reconnects forever with `backoff` between failures and exits only when
/// the source reports it is closed.
pub fn spawn_block_listener(
    source: Arc<dyn BlockSource>,
    clock: Arc<WindowClock>,
    blocks_per_window: u64,
    backoff: RetryPolicy,
) -> JoinHandle<()> {
    let blocks_per_window = blocks_per_window.max(1);
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            match source.next_block().await {
                Ok(Some(block)) => {
                    failures = 0;
                    let window = block / blocks_per_window;
                    if clock.advance_to(window) {
                        info!(event = "window.advanced", block, window);
                    } else {
                        debug!(block, window, "block in current window");
                    }
                }
                Ok(None) => {
                    info!("block source closed; listener exiting");
                    return;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff.delay_after(failures);
                    warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "block source failed; reconnecting");
                    tokio::time::sleep(delay).await;
                    if let Err(e) = source.reconnect().await {
                        warn!(error = %e, "reconnect failed");
                    }
                }
            }
        }
    })
}
