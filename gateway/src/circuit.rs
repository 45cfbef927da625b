//! Per-route admission control: a bounded slot pool with a bounded FIFO
//! wait queue and per-wait deadlines.
//!
//! One mutex guards both counters; a bounded wake channel signals waiters.
//! Fairness is best-effort: a late arriver can overtake an earlier waiter
//! if it wins the wake receive. A waiter dropped between wake-send and
//! wake-receive leaves a stale token behind; the counter invariants hold
//! at quiescent points.

use crate::metrics::GatewayMetrics;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("queue full: cannot accept more requests")]
    QueueFull,

    #[error("queue timeout: waited too long for capacity")]
    QueueTimeout,
}

/// Admission limits for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub max_concurrent: i32,
    pub max_queue_size: i32,
    pub queue_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            max_queue_size: 50,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    fn sanitized(mut self) -> Self {
        if self.max_concurrent <= 0 {
            self.max_concurrent = 100;
        }
        if self.max_queue_size < 0 {
            self.max_queue_size = 0;
        }
        if self.queue_timeout.is_zero() {
            self.queue_timeout = Duration::from_secs(30);
        }
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    active: i32,
    waiting: i32,
}

struct BreakerInner {
    route: String,
    config: BreakerConfig,
    counters: Mutex<Counters>,
    wake_tx: mpsc::Sender<()>,
    // Waiters take turns receiving; tokens buffered in the channel are
    // never lost while a waiter is queued on this lock.
    wake_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    metrics: Arc<GatewayMetrics>,
}

/// Concurrency limiter for one route. Cheap to clone; all clones share
/// the same pool.
#[derive(Clone)]
pub struct Breaker {
    inner: Arc<BreakerInner>,
}

/// An admitted request slot. Dropping it releases the slot and wakes one
/// waiter, on every path: success, error, timeout or disconnect.
pub struct SlotPermit {
    breaker: Breaker,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").finish_non_exhaustive()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.breaker.release();
    }
}

/// Decrements `waiting` if the wait ends without a wake (timeout or the
/// waiting future being dropped on client disconnect).
struct WaitGuard {
    breaker: Breaker,
    armed: bool,
}

impl WaitGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut counters = self.breaker.inner.counters.lock();
            counters.waiting -= 1;
            self.breaker.publish_gauges(&counters);
        }
    }
}

impl Breaker {
    pub fn new(route: &str, config: BreakerConfig, metrics: Arc<GatewayMetrics>) -> Self {
        let config = config.sanitized();
        // Buffer >= max_concurrent + max_queue_size so enqueue never blocks
        let capacity = usize::try_from(config.max_concurrent + config.max_queue_size)
            .unwrap_or(1)
            .max(1);
        let (wake_tx, wake_rx) = mpsc::channel(capacity);

        Self {
            inner: Arc::new(BreakerInner {
                route: route.to_string(),
                config,
                counters: Mutex::new(Counters::default()),
                wake_tx,
                wake_rx: tokio::sync::Mutex::new(wake_rx),
                metrics,
            }),
        }
    }

    /// Acquire a slot: immediate when under the concurrency limit,
    /// queued up to the queue bound otherwise. Cancellation is the caller
    /// dropping the future; the waiting count unwinds through the guard.
    pub async fn acquire(&self) -> Result<SlotPermit, AcquireError> {
        {
            let mut counters = self.inner.counters.lock();
            if counters.active < self.inner.config.max_concurrent {
                counters.active += 1;
                self.publish_gauges(&counters);
                return Ok(SlotPermit {
                    breaker: self.clone(),
                });
            }

            if counters.waiting >= self.inner.config.max_queue_size {
                drop(counters);
                self.inner
                    .metrics
                    .record_circuit_rejection(&self.inner.route, "queue_full");
                return Err(AcquireError::QueueFull);
            }

            counters.waiting += 1;
            self.publish_gauges(&counters);
        }

        let guard = WaitGuard {
            breaker: self.clone(),
            armed: true,
        };

        let wake = async {
            let mut rx = self.inner.wake_rx.lock().await;
            rx.recv().await
        };

        match tokio::time::timeout(self.inner.config.queue_timeout, wake).await {
            Ok(Some(())) => {
                {
                    let mut counters = self.inner.counters.lock();
                    counters.waiting -= 1;
                    counters.active += 1;
                    self.publish_gauges(&counters);
                }
                guard.disarm();
                Ok(SlotPermit {
                    breaker: self.clone(),
                })
            }
            Ok(None) | Err(_) => {
                drop(guard);
                self.inner
                    .metrics
                    .record_circuit_rejection(&self.inner.route, "timeout");
                Err(AcquireError::QueueTimeout)
            }
        }
    }

    fn release(&self) {
        let mut counters = self.inner.counters.lock();
        counters.active -= 1;
        self.publish_gauges(&counters);

        if counters.waiting > 0 {
            // Non-blocking: buffer is sized for every possible waiter
            let _ = self.inner.wake_tx.try_send(());
        }
    }

    fn publish_gauges(&self, counters: &Counters) {
        self.inner
            .metrics
            .set_circuit_active(&self.inner.route, i64::from(counters.active));
        self.inner
            .metrics
            .set_circuit_waiting(&self.inner.route, i64::from(counters.waiting));
    }

    /// Current (active, waiting) counters.
    pub fn stats(&self) -> (i32, i32) {
        let counters = self.inner.counters.lock();
        (counters.active, counters.waiting)
    }

    pub fn config(&self) -> BreakerConfig {
        self.inner.config
    }
}

/// Registry of per-route pools. Pools are created on first use with the
/// defaults current at that moment and keep them for life; defaults
/// updates apply to new pools only.
pub struct BreakerManager {
    breakers: RwLock<HashMap<String, Breaker>>,
    defaults: Mutex<BreakerConfig>,
    metrics: Arc<GatewayMetrics>,
}

impl BreakerManager {
    pub fn new(defaults: BreakerConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults: Mutex::new(defaults),
            metrics,
        }
    }

    /// Fetch the pool for a route, creating it under the write lock if
    /// another request didn't beat us to it.
    pub fn get(&self, route: &str) -> Breaker {
        if let Some(breaker) = self.breakers.read().get(route) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        if let Some(breaker) = breakers.get(route) {
            return breaker.clone();
        }

        let breaker = Breaker::new(route, *self.defaults.lock(), self.metrics.clone());
        breakers.insert(route.to_string(), breaker.clone());
        breaker
    }

    pub fn update_defaults(&self, config: BreakerConfig) {
        *self.defaults.lock() = config;
    }

    /// Drop every pool; for tests and full reloads.
    pub fn reset(&self) {
        self.breakers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_concurrent: i32, max_queue: i32, timeout: Duration) -> Breaker {
        Breaker::new(
            "test-route",
            BreakerConfig {
                max_concurrent,
                max_queue_size: max_queue,
                queue_timeout: timeout,
            },
            Arc::new(GatewayMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_acquire_release_counts() {
        let breaker = breaker(2, 1, Duration::from_secs(1));

        let first = breaker.acquire().await.unwrap();
        let second = breaker.acquire().await.unwrap();
        assert_eq!(breaker.stats(), (2, 0));

        drop(first);
        assert_eq!(breaker.stats(), (1, 0));
        drop(second);
        assert_eq!(breaker.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        let breaker = breaker(1, 1, Duration::from_secs(5));

        let held = breaker.acquire().await.unwrap();

        // Second request occupies the single queue slot
        let waiter = {
            let breaker = breaker.clone();
            tokio::spawn(async move { breaker.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.stats(), (1, 1));

        // Third is rejected immediately
        let err = breaker.acquire().await.unwrap_err();
        assert_eq!(err, AcquireError::QueueFull);
        assert_eq!(err.to_string(), "queue full: cannot accept more requests");

        drop(held);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(breaker.stats(), (1, 0));
        drop(permit);
    }

    #[tokio::test]
    async fn test_queue_timeout() {
        let breaker = breaker(1, 2, Duration::from_millis(50));

        let _held = breaker.acquire().await.unwrap();
        let err = breaker.acquire().await.unwrap_err();
        assert_eq!(err, AcquireError::QueueTimeout);

        // The timed-out waiter unwound its counter
        assert_eq!(breaker.stats(), (1, 0));
    }

    #[tokio::test]
    async fn test_release_wakes_one_waiter() {
        let breaker = breaker(1, 2, Duration::from_secs(5));

        let held = breaker.acquire().await.unwrap();
        let waiter = {
            let breaker = breaker.clone();
            tokio::spawn(async move { breaker.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.stats(), (1, 1));

        drop(held);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(breaker.stats(), (1, 0));
        drop(permit);
        assert_eq!(breaker.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_dropped_waiter_unwinds_waiting_count() {
        let breaker = breaker(1, 2, Duration::from_secs(30));

        let _held = breaker.acquire().await.unwrap();
        let waiter = {
            let breaker = breaker.clone();
            tokio::spawn(async move { breaker.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.stats(), (1, 1));

        // Client disconnect: the waiting future is dropped mid-wait
        waiter.abort();
        let _ = waiter.await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.stats(), (1, 0));
    }

    #[tokio::test]
    async fn test_quiescent_invariants_under_load() {
        let breaker = breaker(4, 8, Duration::from_secs(5));
        let mut handles = Vec::new();

        for _ in 0..32 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move {
                match breaker.acquire().await {
                    Ok(permit) => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        drop(permit);
                        true
                    }
                    Err(_) => false,
                }
            }));
        }

        // Counters never exceed their bounds while requests are in flight
        for _ in 0..20 {
            let (active, waiting) = breaker.stats();
            assert!((0..=4).contains(&active), "active = {active}");
            assert!((0..=8).contains(&waiting), "waiting = {waiting}");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for handle in handles {
            let _ = handle.await;
        }
        assert_eq!(breaker.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_manager_pins_pool_config_at_creation() {
        let metrics = Arc::new(GatewayMetrics::new());
        let manager = BreakerManager::new(BreakerConfig::default(), metrics);

        let before = manager.get("pinned");
        assert_eq!(before.config().max_concurrent, 100);

        manager.update_defaults(BreakerConfig {
            max_concurrent: 7,
            max_queue_size: 3,
            queue_timeout: Duration::from_secs(1),
        });

        // Existing pool keeps its original limits; new pools see the update
        assert_eq!(manager.get("pinned").config().max_concurrent, 100);
        assert_eq!(manager.get("fresh").config().max_concurrent, 7);
    }

    #[tokio::test]
    async fn test_queue_full_rejection_is_counted() {
        let metrics = Arc::new(GatewayMetrics::new());
        let breaker = Breaker::new(
            "counted",
            BreakerConfig {
                max_concurrent: 1,
                max_queue_size: 0,
                queue_timeout: Duration::from_secs(1),
            },
            metrics.clone(),
        );

        let _held = breaker.acquire().await.unwrap();
        let _ = breaker.acquire().await.unwrap_err();
        assert_eq!(metrics.circuit_rejections("counted", "queue_full"), 1);
    }
}
