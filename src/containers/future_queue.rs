//! Ordered queue of not-yet-settled outcomes.
//!
//! Callers [`push`](FutureQueue::push) to obtain a future, and a producer
//! later settles heads strictly in push order.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, TaskwireError};

type Outcome<V> = std::result::Result<V, TaskwireError>;

/// Strict-FIFO queue of pending futures.
pub struct FutureQueue<V> {
    waiters: Arc<Mutex<VecDeque<oneshot::Sender<Outcome<V>>>>>,
}

impl<V> Clone for FutureQueue<V> {
    fn clone(&self) -> Self {
        Self {
            waiters: self.waiters.clone(),
        }
    }
}

impl<V> Default for FutureQueue<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FutureQueue<V>
where
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Enqueues a pending future and returns it.
    pub fn push(&self) -> impl Future<Output = Result<V>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(tx);
        async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskwireError::Disconnected(
                    "queue dropped before settlement".into(),
                )),
            }
        }
    }

    /// Resolves the head future with `value`. Returns whether a head
    /// existed to settle.
    pub fn resolve_one(&self, value: V) -> bool {
        self.settle_one(Ok(value))
    }

    /// Rejects the head future with `error`. Returns whether a head
    /// existed to settle.
    pub fn reject_one(&self, error: TaskwireError) -> bool {
        self.settle_one(Err(error))
    }

    /// Settles the head with the eventual outcome of `future`. Returns
    /// whether a head existed; with no head the future is dropped unpolled.
    pub fn resolve_one_with<F>(&self, future: F) -> bool
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let Some(head) = self.waiters.lock().pop_front() else {
            return false;
        };
        tokio::spawn(async move {
            let _ = head.send(future.await);
        });
        true
    }

    /// Resolves every pending future with `value`, returning the count.
    pub fn resolve_all(&self, value: V) -> usize {
        self.settle_all(Ok(value))
    }

    /// Rejects every pending future with `error`, returning the count.
    pub fn reject_all(&self, error: TaskwireError) -> usize {
        self.settle_all(Err(error))
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    fn settle_one(&self, outcome: Outcome<V>) -> bool {
        match self.waiters.lock().pop_front() {
            Some(head) => {
                let _ = head.send(outcome);
                true
            }
            None => false,
        }
    }

    fn settle_all(&self, outcome: Outcome<V>) -> usize {
        let drained: Vec<_> = self.waiters.lock().drain(..).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.send(outcome.clone());
        }
        count
    }
}
