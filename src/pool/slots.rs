//! Bounded blocking queue of connection slots
//!
//! Entries are `Option<T>`: a `None` entry is a placeholder for a connection
//! that could not be opened. It still occupies one unit of capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

/// Error types for slot queue operations
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("Slot queue is closed")]
    Closed,
}

/// Fixed-capacity multi-producer, multi-consumer queue
///
/// `acquire` waits until an entry is available. The semaphore holds exactly
/// one permit per queued entry.
pub struct SlotQueue<T> {
    entries: Mutex<VecDeque<Option<T>>>,
    available: Semaphore,
    capacity: usize,

    /// Entries handed out by `acquire` and not yet released
    checked_out: AtomicUsize,
}

impl<T> SlotQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            capacity,
            checked_out: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Option<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently waiting in the queue
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    /// Entries currently held by callers
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    /// Take an entry, waiting until one is available
    ///
    /// The entry goes back into the queue when the returned [`Checkout`] is
    /// released or dropped.
    pub async fn acquire(&self) -> Result<Checkout<'_, T>, SlotError> {
        let entry = self.take(true).await?;
        Ok(Checkout {
            queue: self,
            entry: Some(entry),
        })
    }

    /// Add a new entry that was never checked out
    ///
    /// Returns the entry if the queue is already at capacity.
    pub fn push(&self, entry: Option<T>) -> Result<(), Option<T>> {
        self.put(entry, false)
    }

    /// Remove every entry, waiting for checked-out ones to come back
    ///
    /// Stops early if the queue is closed while waiting.
    pub async fn drain(&self) -> Vec<Option<T>> {
        let mut drained = Vec::with_capacity(self.capacity);
        while !self.settled() {
            match self.take(false).await {
                Ok(entry) => drained.push(entry),
                Err(SlotError::Closed) => break,
            }
        }
        drained
    }

    /// Remove the entries that are in the queue right now
    pub fn drain_idle(&self) -> Vec<Option<T>> {
        let mut drained = Vec::new();
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
            if let Some(entry) = self.lock().pop_front() {
                drained.push(entry);
            }
        }
        drained
    }

    /// Wake every waiter with [`SlotError::Closed`]; entries stay in place
    pub fn close(&self) {
        self.available.close();
    }

    /// No entry is queued or checked out
    fn settled(&self) -> bool {
        let entries = self.lock();
        entries.is_empty() && self.checked_out() == 0
    }

    async fn take(&self, checkout: bool) -> Result<Option<T>, SlotError> {
        let permit = self.available.acquire().await.map_err(|_| SlotError::Closed)?;
        permit.forget();

        let mut entries = self.lock();
        let entry = entries.pop_front().ok_or(SlotError::Closed)?;
        if checkout {
            self.checked_out.fetch_add(1, Ordering::AcqRel);
        }
        Ok(entry)
    }

    fn put(&self, entry: Option<T>, checked_in: bool) -> Result<(), Option<T>> {
        {
            let mut entries = self.lock();
            if checked_in {
                let _ = self
                    .checked_out
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            }
            if entries.len() >= self.capacity {
                return Err(entry);
            }
            entries.push_back(entry);
        }
        self.available.add_permits(1);
        Ok(())
    }
}

/// An entry taken from a [`SlotQueue`]
///
/// Dropping a checkout puts the entry back, so a caller that is cancelled
/// while holding a connection does not shrink the queue.
pub struct Checkout<'a, T> {
    queue: &'a SlotQueue<T>,
    entry: Option<Option<T>>,
}

impl<T> Checkout<'_, T> {
    /// True if the entry is an empty placeholder
    pub fn is_placeholder(&self) -> bool {
        matches!(self.entry, Some(None))
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.entry.as_mut().and_then(Option::as_mut)
    }

    /// Put the entry back
    ///
    /// Returns the entry if the queue is already at capacity.
    pub fn release(mut self) -> Result<(), Option<T>> {
        match self.entry.take() {
            Some(entry) => self.queue.put(entry, true),
            None => Ok(()),
        }
    }
}

impl<T> Drop for Checkout<'_, T> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            // Surplus entries are dropped without being closed
            let _ = self.queue.put(entry, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let queue = SlotQueue::new(2);
        queue.push(Some(1)).unwrap();
        queue.push(None).unwrap();

        let mut held = queue.acquire().await.unwrap();
        assert_eq!(held.get_mut(), Some(&mut 1));
        assert!(!held.is_placeholder());
        assert_eq!(queue.checked_out(), 1);
        assert_eq!(queue.idle(), 1);

        held.release().unwrap();
        assert_eq!(queue.checked_out(), 0);
        assert_eq!(queue.idle(), 2);

        let held = queue.acquire().await.unwrap();
        assert!(held.is_placeholder());
    }

    #[test]
    fn test_push_rejects_beyond_capacity() {
        let queue = SlotQueue::new(1);
        queue.push(Some("a")).unwrap();

        assert_eq!(queue.push(Some("b")), Err(Some("b")));
        assert_eq!(queue.idle(), 1);
    }

    #[tokio::test]
    async fn test_release_beyond_capacity_returns_entry() {
        let queue = SlotQueue::new(1);
        queue.push(Some(1)).unwrap();

        let held = queue.acquire().await.unwrap();
        queue.push(Some(2)).unwrap();

        assert_eq!(held.release(), Err(Some(1)));
        assert_eq!(queue.checked_out(), 0);
        assert_eq!(queue.idle(), 1);
    }

    #[tokio::test]
    async fn test_dropped_checkout_returns_entry() {
        let queue = SlotQueue::new(1);
        queue.push(Some(7)).unwrap();

        {
            let _held = queue.acquire().await.unwrap();
            assert_eq!(queue.checked_out(), 1);
        }

        assert_eq!(queue.checked_out(), 0);
        assert_eq!(queue.idle(), 1);

        let mut held = queue.acquire().await.unwrap();
        assert_eq!(held.get_mut(), Some(&mut 7));
    }

    #[tokio::test]
    async fn test_cancelled_holder_does_not_block_drain() {
        let queue = Arc::new(SlotQueue::new(1));
        queue.push(Some(1)).unwrap();

        let holder = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let _held = queue.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.checked_out(), 1);
        holder.abort();
        let _ = holder.await;

        let drained = tokio::time::timeout(Duration::from_secs(1), queue.drain())
            .await
            .unwrap();
        assert_eq!(drained, vec![Some(1)]);
        assert_eq!(queue.checked_out(), 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let queue = Arc::new(SlotQueue::new(1));
        queue.push(Some(42)).unwrap();

        let held = queue.acquire().await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.acquire().await.unwrap().get_mut().copied() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        held.release().unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn test_drain_waits_for_checked_out_entries() {
        let queue = Arc::new(SlotQueue::new(2));
        queue.push(Some(1)).unwrap();
        queue.push(Some(2)).unwrap();

        let releaser = {
            let queue = Arc::clone(&queue);
            let (tx, rx) = tokio::sync::oneshot::channel();
            let task = tokio::spawn(async move {
                let held = queue.acquire().await.unwrap();
                tx.send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                held.release().unwrap();
            });
            rx.await.unwrap();
            task
        };

        let drained = queue.drain().await;
        releaser.await.unwrap();

        assert_eq!(drained.len(), 2);
        assert_eq!(queue.idle(), 0);
        assert_eq!(queue.checked_out(), 0);
    }

    #[tokio::test]
    async fn test_drain_idle_leaves_checked_out_alone() {
        let queue = SlotQueue::new(3);
        queue.push(Some(1)).unwrap();
        queue.push(None).unwrap();
        queue.push(Some(3)).unwrap();

        let held = queue.acquire().await.unwrap();
        let drained = queue.drain_idle();

        assert_eq!(drained, vec![None, Some(3)]);
        assert_eq!(queue.checked_out(), 1);
        drop(held);
        assert_eq!(queue.idle(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let queue: Arc<SlotQueue<u8>> = Arc::new(SlotQueue::new(1));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SlotError::Closed)));
        assert!(queue.is_closed());
    }
}
