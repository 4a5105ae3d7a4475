//! # Engine Arbiter
//!
//! Bounds concurrent use of the inference engine pool. Every pipeline invocation
//! must hold an [`EngineSlot`] while it runs the model, and there are exactly as
//! many slots as loaded engine instances.
//!
//! ## How it works:
//! - A `tokio::sync::Semaphore` with one permit per engine provides the queue.
//!   Tokio's semaphore is fair: waiters are served strictly in FIFO order, so a
//!   released permit always goes to the longest-waiting caller.
//! - Idle engines sit in a small stack. A caller that wins a permit pops one;
//!   there is always one to pop because permits and idle engines move together.
//! - Dropping the slot pushes the engine back *before* the permit is released,
//!   so the next waiter never finds the stack empty.
//!
//! Because release happens in `Drop`, it is unconditional: success, error,
//! panic, or a cancelled future all return the engine to the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::ArbiterError;
use crate::transcription::engine::InferenceEngine;

type EngineStack = Arc<Mutex<Vec<Arc<dyn InferenceEngine>>>>;

pub struct EngineArbiter {
    permits: Arc<Semaphore>,
    idle: EngineStack,
    pool_size: usize,
    acquisitions: AtomicU64,
}

impl EngineArbiter {
    pub fn new(engines: Vec<Arc<dyn InferenceEngine>>) -> Self {
        let pool_size = engines.len();
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            idle: Arc::new(Mutex::new(engines)),
            pool_size,
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Wait for exclusive use of one engine.
    ///
    /// With `max_wait` set, gives up with [`ArbiterError::Busy`] once it elapses;
    /// a caller that gives up leaves the queue without consuming a slot.
    pub async fn acquire(&self, max_wait: Option<Duration>) -> Result<EngineSlot, ArbiterError> {
        let permit = match max_wait {
            Some(wait) => tokio::time::timeout(wait, self.permits.clone().acquire_owned())
                .await
                .map_err(|_| ArbiterError::Busy(wait))?,
            None => self.permits.clone().acquire_owned().await,
        }
        .map_err(|_| ArbiterError::Closed)?;

        let engine = self
            .idle
            .lock()
            .map_err(|_| ArbiterError::Closed)?
            .pop()
            .ok_or(ArbiterError::Closed)?;

        let granted = self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Engine slot #{} acquired ({} idle)", granted, self.available());

        Ok(EngineSlot {
            engine,
            idle: self.idle.clone(),
            _permit: permit,
        })
    }

    /// Try to take a slot without waiting.
    #[cfg(test)]
    pub fn try_acquire(&self) -> Result<EngineSlot, ArbiterError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| ArbiterError::Busy(Duration::ZERO))?;
        let engine = self
            .idle
            .lock()
            .map_err(|_| ArbiterError::Closed)?
            .pop()
            .ok_or(ArbiterError::Closed)?;

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(EngineSlot {
            engine,
            idle: self.idle.clone(),
            _permit: permit,
        })
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Total successful acquisitions since startup.
    #[cfg(test)]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Refuse new acquisitions; queued callers are woken with `Closed`.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Exclusive access to one engine instance, returned to the pool on drop.
pub struct EngineSlot {
    engine: Arc<dyn InferenceEngine>,
    idle: EngineStack,
    // Dropped after `Drop::drop` has returned the engine to the stack.
    _permit: OwnedSemaphorePermit,
}

impl EngineSlot {
    pub fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }
}

impl Drop for EngineSlot {
    fn drop(&mut self) {
        let engine = self.engine.clone();
        match self.idle.lock() {
            Ok(mut idle) => idle.push(engine),
            Err(poisoned) => poisoned.into_inner().push(engine),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    fn arbiter(size: usize) -> Arc<EngineArbiter> {
        let engines: Vec<Arc<dyn InferenceEngine>> = (0..size)
            .map(|i| Arc::new(FakeEngine::named(&format!("fake-{}", i))) as Arc<dyn InferenceEngine>)
            .collect();
        Arc::new(EngineArbiter::new(engines))
    }

    #[tokio::test]
    async fn test_pool_size_slots_granted_immediately() {
        let arbiter = arbiter(2);
        let a = arbiter.acquire(Some(Duration::from_millis(10))).await.unwrap();
        let b = arbiter.acquire(Some(Duration::from_millis(10))).await.unwrap();
        assert_ne!(a.engine().name(), b.engine().name());
        assert_eq!(arbiter.available(), 0);

        let err = arbiter.acquire(Some(Duration::from_millis(20))).await.err().unwrap();
        assert_eq!(err, ArbiterError::Busy(Duration::from_millis(20)));
        assert_eq!(arbiter.acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let arbiter = arbiter(1);
        {
            let _slot = arbiter.acquire(None).await.unwrap();
            assert_eq!(arbiter.available(), 0);
        }
        assert_eq!(arbiter.available(), 1);
        assert!(arbiter.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_waiters_served_in_fifo_order() {
        let arbiter = arbiter(1);
        let held = arbiter.acquire(None).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut waiters = Vec::new();
        for id in 0..4 {
            let arbiter = arbiter.clone();
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let _slot = arbiter.acquire(None).await.unwrap();
                tx.send(id).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(id) = rx.recv().await {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_release_unblocks_exactly_one_waiter() {
        let arbiter = arbiter(1);
        let held = arbiter.acquire(None).await.unwrap();
        let (acquired_tx, mut acquired_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let arbiter = arbiter.clone();
            let acquired_tx = acquired_tx.clone();
            tokio::spawn(async move {
                let _slot = arbiter.acquire(None).await.unwrap();
                acquired_tx.send("first").unwrap();
                let _ = release_rx.await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                let _slot = arbiter.acquire(None).await.unwrap();
                acquired_tx.send("second").unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        assert_eq!(acquired_rx.recv().await, Some("first"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(acquired_rx.try_recv().is_err());
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(acquired_rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn test_timed_out_waiter_leaves_queue() {
        let arbiter = arbiter(1);
        let held = arbiter.acquire(None).await.unwrap();
        assert!(arbiter.acquire(Some(Duration::from_millis(10))).await.is_err());
        drop(held);
        assert_eq!(arbiter.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let arbiter = arbiter(1);
        arbiter.close();
        assert_eq!(arbiter.acquire(None).await.err(), Some(ArbiterError::Closed));
    }
}
