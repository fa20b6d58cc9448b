//! Request throttles.
//!
//! - [`ReadWriteThrottle`]: token buckets on IOPS and bandwidth, total and per
//!   direction. A request over budget is delayed, never rejected.
//! - [`InflightBytesThrottle`]: caps the bytes held by asynchronous transfers
//!   that have started but not completed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, sleep};
use tracing::trace;

const MB: u64 = 1024 * 1024;

/// Rate limits; `0` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub iops_total: u64,
    pub iops_read: u64,
    pub iops_write: u64,
    pub bps_total_mb: u64,
    pub bps_read_mb: u64,
    pub bps_write_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// Bucket holding up to one second worth of tokens.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64, now: Instant) -> Option<Self> {
        (rate_per_sec > 0).then(|| Self {
            tokens: rate_per_sec as f64,
            capacity: rate_per_sec as f64,
            rate: rate_per_sec as f64,
            last_refill: now,
        })
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens, going into debt if needed. Returns how long the caller
    /// has to wait until the debt is paid back.
    fn reserve(&mut self, n: u64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

#[derive(Debug, Default)]
struct Buckets {
    iops_total: Option<TokenBucket>,
    iops_read: Option<TokenBucket>,
    iops_write: Option<TokenBucket>,
    bps_total: Option<TokenBucket>,
    bps_read: Option<TokenBucket>,
    bps_write: Option<TokenBucket>,
}

#[derive(Debug)]
pub struct ReadWriteThrottle {
    buckets: Mutex<Buckets>,
    enabled: bool,
}

impl Default for ReadWriteThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

impl ReadWriteThrottle {
    pub fn new(cfg: ThrottleConfig) -> Self {
        let now = Instant::now();
        let buckets = Buckets {
            iops_total: TokenBucket::new(cfg.iops_total, now),
            iops_read: TokenBucket::new(cfg.iops_read, now),
            iops_write: TokenBucket::new(cfg.iops_write, now),
            bps_total: TokenBucket::new(cfg.bps_total_mb * MB, now),
            bps_read: TokenBucket::new(cfg.bps_read_mb * MB, now),
            bps_write: TokenBucket::new(cfg.bps_write_mb * MB, now),
        };
        Self {
            buckets: Mutex::new(buckets),
            enabled: cfg != ThrottleConfig::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Wait until one `kind` request of `bytes` bytes fits the budget.
    pub async fn acquire(&self, kind: IoKind, bytes: u64) {
        self.take(kind, 1, bytes).await
    }

    /// Charge bandwidth only, for a transfer whose size is known afterwards.
    pub async fn charge(&self, kind: IoKind, bytes: u64) {
        self.take(kind, 0, bytes).await
    }

    async fn take(&self, kind: IoKind, ops: u64, bytes: u64) {
        if !self.enabled {
            return;
        }
        let wait = {
            let now = Instant::now();
            let mut b = self.buckets.lock().await;
            let b = &mut *b;
            let (iops_kind, bps_kind) = match kind {
                IoKind::Read => (&mut b.iops_read, &mut b.bps_read),
                IoKind::Write => (&mut b.iops_write, &mut b.bps_write),
            };
            [
                (&mut b.iops_total, ops),
                (iops_kind, ops),
                (&mut b.bps_total, bytes),
                (bps_kind, bytes),
            ]
            .into_iter()
            .filter_map(|(bucket, n)| bucket.as_mut().map(|bk| bk.reserve(n, now)))
            .max()
            .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            trace!("throttle {kind:?} of {bytes} bytes for {wait:?}");
            sleep(wait).await;
        }
    }
}

/// Caps the total size of in-flight asynchronous requests.
///
/// A request larger than the cap never fits and waits forever.
#[derive(Debug)]
pub struct InflightBytesThrottle {
    max: u64,
    current: AtomicU64,
    released: Notify,
}

/// Holds `len` bytes of the budget until dropped.
#[derive(Debug)]
pub struct InflightGuard {
    throttle: Arc<InflightBytesThrottle>,
    len: u64,
}

impl InflightBytesThrottle {
    /// `max == 0` means unlimited.
    pub fn new(max: u64) -> Self {
        Self {
            max: if max == 0 { u64::MAX } else { max },
            current: AtomicU64::new(0),
            released: Notify::new(),
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn try_take(&self, len: u64) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(len).filter(|next| *next <= self.max)
            })
            .is_ok()
    }

    /// Wait until `len` more bytes fit, then hold them.
    pub async fn acquire(self: &Arc<Self>, len: u64) -> InflightGuard {
        loop {
            // registered before the check so a release in between is not missed
            let released = self.released.notified();
            if self.try_take(len) {
                return InflightGuard {
                    throttle: self.clone(),
                    len,
                };
            }
            trace!(
                "inflight throttle: {} + {len} exceeds {}",
                self.current(),
                self.max
            );
            released.await;
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.throttle.current.fetch_sub(self.len, Ordering::AcqRel);
        self.throttle.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_inflight_never_exceeds_max() {
        let throttle = Arc::new(InflightBytesThrottle::new(100));
        let peak = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for i in 0..20u64 {
            let throttle = throttle.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let guard = throttle.acquire(10 + (i % 4) * 10).await;
                peak.fetch_max(throttle.current(), Ordering::SeqCst);
                sleep(Duration::from_millis(5 + i % 3)).await;
                drop(guard);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 100);
        assert_eq!(throttle.current(), 0);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_completion() {
        let throttle = Arc::new(InflightBytesThrottle::new(64));
        let first = throttle.acquire(48).await;
        let second = throttle.clone();
        let waiter = tokio::spawn(async move {
            let _g = second.acquire(32).await;
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_blocks() {
        let throttle = Arc::new(InflightBytesThrottle::new(16));
        let res = timeout(Duration::from_millis(50), throttle.acquire(17)).await;
        assert!(res.is_err());
        assert_eq!(throttle.current(), 0);
    }

    #[tokio::test]
    async fn test_zero_means_unlimited() {
        let throttle = Arc::new(InflightBytesThrottle::new(0));
        let _a = throttle.acquire(u64::MAX / 2).await;
        let _b = throttle.acquire(u64::MAX / 4).await;
        assert_eq!(throttle.max(), u64::MAX);
    }

    #[tokio::test]
    async fn test_charge_skips_request_slots() {
        let throttle = ReadWriteThrottle::new(ThrottleConfig {
            iops_read: 2,
            ..Default::default()
        });
        let start = Instant::now();
        throttle.acquire(IoKind::Read, 0).await;
        for _ in 0..10 {
            throttle.charge(IoKind::Read, 1 << 20).await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_rate_limit_delays_writes() {
        let throttle = ReadWriteThrottle::new(ThrottleConfig {
            iops_write: 10,
            ..Default::default()
        });
        assert!(throttle.is_enabled());
        let start = Instant::now();
        for _ in 0..15 {
            throttle.acquire(IoKind::Write, 1).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(400));

        // reads are not limited by the write bucket
        let start = Instant::now();
        for _ in 0..50 {
            throttle.acquire(IoKind::Read, 1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_disabled_throttle_is_free() {
        let throttle = ReadWriteThrottle::default();
        assert!(!throttle.is_enabled());
        let start = Instant::now();
        for _ in 0..1000 {
            throttle.acquire(IoKind::Write, 1 << 20).await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
