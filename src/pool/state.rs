//! Pool availability state and the breaker event listener

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::circuit::{BreakerEvent, BreakerNotice};

/// Availability of the pool as seen by `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Connections are handed out
    Success,

    /// The breaker is open; calls fail and may trigger regeneration
    Fail,

    /// The breaker was reset and the pool is being rebuilt
    Regenerate,
}

impl PoolState {
    /// State after observing a breaker event
    pub fn apply(self, event: BreakerEvent) -> PoolState {
        match event {
            BreakerEvent::Tripped => PoolState::Fail,
            BreakerEvent::Reset => PoolState::Regenerate,
            BreakerEvent::Ready => PoolState::Success,
            BreakerEvent::Fail => self,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PoolState::Success => "success",
            PoolState::Fail => "fail",
            PoolState::Regenerate => "regenerate",
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Current {
    state: PoolState,

    /// Sequence number of the newest breaker notice reflected in `state`
    applied_seq: u64,
}

/// Shared state written by the listener and by pool (re)builds
pub(crate) struct StateCell {
    current: Mutex<Current>,

    /// Epoch seconds of the most recent trip, 0 if none
    tripped_at: AtomicI64,
}

impl StateCell {
    pub(crate) fn new(state: PoolState) -> Self {
        Self {
            current: Mutex::new(Current {
                state,
                applied_seq: 0,
            }),
            tripped_at: AtomicI64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self) -> PoolState {
        self.lock().state
    }

    /// Apply a breaker notice unless a newer write already covers it
    pub(crate) fn observe(&self, notice: BreakerNotice) {
        let mut current = self.lock();
        if notice.seq <= current.applied_seq {
            trace!(seq = notice.seq, event = ?notice.event, "Skipping superseded breaker event");
            return;
        }

        let next = current.state.apply(notice.event);
        current.applied_seq = notice.seq;
        if next != current.state {
            info!(from = %current.state, to = %next, "Pool state changed");
            current.state = next;
        }

        if notice.event == BreakerEvent::Tripped {
            self.mark_tripped();
        }
    }

    /// Set the state directly, superseding breaker notices up to `seq`
    pub(crate) fn force(&self, state: PoolState, seq: u64) {
        let mut current = self.lock();
        current.applied_seq = current.applied_seq.max(seq);
        if current.state != state {
            info!(from = %current.state, to = %state, "Pool state set");
            current.state = state;
        }
    }

    pub(crate) fn tripped_at(&self) -> i64 {
        self.tripped_at.load(Ordering::Acquire)
    }

    /// Record the trip time unless one is already recorded
    pub(crate) fn mark_tripped(&self) {
        let now = chrono::Utc::now().timestamp();
        if self
            .tripped_at
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(tripped_at = now, "Recorded trip time");
        }
    }

    pub(crate) fn clear_tripped(&self) {
        self.tripped_at.store(0, Ordering::Release);
    }
}

/// Start the task that maps breaker notices onto the pool state
///
/// The task ends when the breaker, and with it the notice stream, is dropped.
pub(crate) fn spawn_listener(
    mut notices: mpsc::UnboundedReceiver<BreakerNotice>,
    cell: Arc<StateCell>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            if notice.event == BreakerEvent::Fail {
                debug!(seq = notice.seq, "Breaker fail");
            }
            cell.observe(notice);
        }
        debug!("Breaker event stream closed, state listener exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::circuit::RateBreaker;
    use std::time::Duration;

    fn notice(seq: u64, event: BreakerEvent) -> BreakerNotice {
        BreakerNotice { seq, event }
    }

    #[test]
    fn test_transition_cycle() {
        let state = PoolState::Success;
        let state = state.apply(BreakerEvent::Fail);
        assert_eq!(state, PoolState::Success);
        let state = state.apply(BreakerEvent::Tripped);
        assert_eq!(state, PoolState::Fail);
        let state = state.apply(BreakerEvent::Reset);
        assert_eq!(state, PoolState::Regenerate);
        let state = state.apply(BreakerEvent::Ready);
        assert_eq!(state, PoolState::Success);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PoolState::Success.to_string(), "success");
        assert_eq!(PoolState::Fail.to_string(), "fail");
        assert_eq!(PoolState::Regenerate.to_string(), "regenerate");
    }

    #[test]
    fn test_forced_state_supersedes_older_events() {
        let cell = StateCell::new(PoolState::Fail);

        cell.force(PoolState::Success, 3);
        cell.observe(notice(2, BreakerEvent::Reset));
        assert_eq!(cell.get(), PoolState::Success);

        cell.observe(notice(4, BreakerEvent::Tripped));
        assert_eq!(cell.get(), PoolState::Fail);
    }

    #[test]
    fn test_trip_time_is_set_once() {
        let cell = StateCell::new(PoolState::Success);
        assert_eq!(cell.tripped_at(), 0);

        cell.mark_tripped();
        let first = cell.tripped_at();
        assert!(first > 0);

        cell.tripped_at.store(first - 100, Ordering::Release);
        cell.mark_tripped();
        assert_eq!(cell.tripped_at(), first - 100);

        cell.clear_tripped();
        assert_eq!(cell.tripped_at(), 0);
    }

    #[tokio::test]
    async fn test_listener_follows_breaker() {
        let breaker = RateBreaker::new(1.0, 1);
        let cell = Arc::new(StateCell::new(PoolState::Success));
        let handle = spawn_listener(breaker.subscribe(), Arc::clone(&cell));

        breaker.fail();
        for _ in 0..50 {
            if cell.get() == PoolState::Fail {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cell.get(), PoolState::Fail);
        assert!(cell.tripped_at() > 0);

        drop(breaker);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
