//! Background workers (dirty inode flush)

use crate::vfs::cache::InodeCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Calls `flush_once` on a fixed interval until cancelled.
pub struct FlushDriver {
    cache: Arc<InodeCache>,
    interval: Duration,
    cancel: CancellationToken,
}

impl FlushDriver {
    pub fn new(cache: Arc<InodeCache>, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the driver when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled. A final drain is left to the caller (`flush_all`).
    pub async fn run(self) {
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        info!("flush driver started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.cache.flush_once().await;
                    if report.failed > 0 {
                        warn!(
                            "flush cycle: {} of {} records failed",
                            report.failed,
                            report.flushed + report.failed
                        );
                    } else if report.flushed > 0 {
                        debug!("flush cycle: {} records flushed", report.flushed);
                    }
                }
            }
        }
        info!("flush driver stopped");
    }
}
