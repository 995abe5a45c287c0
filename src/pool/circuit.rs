//! Rate-based circuit breaker
//!
//! The breaker keeps the outcomes of the last `universe` calls in a rolling
//! window. When a failure is recorded and the window is full, the breaker
//! trips if the failure rate over the window is at or above `fail_rate`.
//!
//! State transitions are published to subscribers as an ordered, lossless
//! stream of [`BreakerNotice`]s:
//! - `Tripped`: the breaker opened
//! - `Reset`: the breaker was closed manually and is waiting for a success
//! - `Fail`: a failure was recorded
//! - `Ready`: the first successful call after a reset went through

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Breaker transitions published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Tripped,
    Reset,
    Fail,
    Ready,
}

/// A [`BreakerEvent`] tagged with its position in the breaker's event order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerNotice {
    /// Strictly increasing, starting at 1
    pub seq: u64,
    pub event: BreakerEvent,
}

/// Error returned by [`RateBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker is tripped; the operation was not run
    #[error("circuit breaker is open")]
    Open,

    /// The operation did not finish within the timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed
    #[error("{0}")]
    Inner(#[source] E),
}

/// Breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Whether the breaker is currently open
    pub tripped: bool,

    /// Outcomes currently held in the rolling window
    pub samples: usize,

    /// Failures currently held in the rolling window
    pub window_failures: usize,

    /// Failure rate over the rolling window
    pub error_rate: f64,

    /// Total successes recorded
    pub total_successes: u64,

    /// Total failures recorded
    pub total_failures: u64,

    /// Number of times the breaker has tripped
    pub trip_count: u64,
}

struct BreakerInner {
    tripped: bool,

    /// Set by `reset`; the next success publishes `Ready`
    awaiting_ready: bool,

    /// Rolling window of outcomes, `true` = failure
    window: VecDeque<bool>,
    window_failures: usize,

    total_successes: u64,
    total_failures: u64,
    trip_count: u64,

    seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<BreakerNotice>>,
}

impl BreakerInner {
    fn publish(&mut self, event: BreakerEvent) {
        self.seq += 1;
        let notice = BreakerNotice { seq: self.seq, event };
        self.subscribers.retain(|tx| tx.send(notice).is_ok());
    }

    fn record(&mut self, failed: bool, universe: usize) {
        self.window.push_back(failed);
        if failed {
            self.window_failures += 1;
        }
        while self.window.len() > universe {
            if self.window.pop_front() == Some(true) {
                self.window_failures -= 1;
            }
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window_failures as f64 / self.window.len() as f64
    }

    fn trip(&mut self) {
        self.tripped = true;
        self.awaiting_ready = false;
        self.trip_count += 1;
        self.publish(BreakerEvent::Tripped);
    }
}

/// Circuit breaker that trips on the failure rate over a sample window
pub struct RateBreaker {
    inner: Mutex<BreakerInner>,
    fail_rate: f64,
    universe: usize,
}

impl RateBreaker {
    /// Create a breaker; `fail_rate` is clamped to [0, 1] and `universe` to at least 1
    pub fn new(fail_rate: f64, universe: usize) -> Self {
        let fail_rate = if fail_rate.is_nan() { 0.0 } else { fail_rate.clamp(0.0, 1.0) };
        let universe = universe.max(1);
        Self {
            inner: Mutex::new(BreakerInner {
                tripped: false,
                awaiting_ready: false,
                window: VecDeque::with_capacity(universe),
                window_failures: 0,
                total_successes: 0,
                total_failures: 0,
                trip_count: 0,
                seq: 0,
                subscribers: Vec::new(),
            }),
            fail_rate,
            universe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_rate(&self) -> f64 {
        self.fail_rate
    }

    pub fn universe(&self) -> usize {
        self.universe
    }

    /// Subscribe to breaker transitions
    ///
    /// Notices are delivered in the order they happen and are never dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BreakerNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Sequence number of the most recently published notice (0 if none)
    pub fn last_seq(&self) -> u64 {
        self.lock().seq
    }

    pub fn tripped(&self) -> bool {
        self.lock().tripped
    }

    /// Open the breaker; no-op if it is already open
    pub fn trip(&self) {
        let mut inner = self.lock();
        if inner.tripped {
            return;
        }
        warn!(error_rate = inner.error_rate(), "Circuit breaker tripped manually");
        inner.trip();
    }

    /// Close the breaker and clear the sample window
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.tripped = false;
        inner.awaiting_ready = true;
        inner.window.clear();
        inner.window_failures = 0;
        info!("Circuit breaker reset");
        inner.publish(BreakerEvent::Reset);
    }

    /// Record a failed call, tripping the breaker if the rate threshold is reached
    pub fn fail(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.record(true, self.universe);
        inner.publish(BreakerEvent::Fail);

        let samples = inner.window.len();
        let rate = inner.error_rate();
        debug!(
            samples = samples,
            window_failures = inner.window_failures,
            error_rate = rate,
            "Breaker recorded failure"
        );

        if !inner.tripped && samples >= self.universe && rate >= self.fail_rate {
            warn!(
                error_rate = rate,
                threshold = self.fail_rate,
                universe = self.universe,
                "Circuit breaker tripped"
            );
            inner.trip();
        }
    }

    /// Record a successful call
    pub fn success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.record(false, self.universe);
        if inner.awaiting_ready && !inner.tripped {
            inner.awaiting_ready = false;
            debug!("Circuit breaker ready");
            inner.publish(BreakerEvent::Ready);
        }
    }

    /// Run `op` guarded by the breaker
    ///
    /// Returns [`CallError::Open`] without running `op` if the breaker is
    /// tripped. A zero `timeout` means no time bound. Errors and timeouts are
    /// recorded as failures, everything else as a success.
    pub async fn call<F, T, E>(&self, op: F, timeout: Duration) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if self.tripped() {
            return Err(CallError::Open);
        }

        let outcome = if timeout.is_zero() {
            op.await.map_err(CallError::Inner)
        } else {
            match tokio::time::timeout(timeout, op).await {
                Ok(result) => result.map_err(CallError::Inner),
                Err(_) => Err(CallError::Timeout(timeout)),
            }
        };

        match outcome {
            Ok(_) => self.success(),
            Err(_) => self.fail(),
        }
        outcome
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            tripped: inner.tripped,
            samples: inner.window.len(),
            window_failures: inner.window_failures,
            error_rate: inner.error_rate(),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            trip_count: inner.trip_count,
        }
    }
}

impl fmt::Debug for RateBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateBreaker")
            .field("fail_rate", &self.fail_rate)
            .field("universe", &self.universe)
            .field("tripped", &self.tripped())
            .finish()
    }
}
