//! Broker failover dispatcher.
//!
//! Wraps an ordered broker list behind the [`MessageBroker`] interface.
//! Each publish asks the strategy for a broker and, on failure, retries
//! with a newly selected one, up to one attempt per member. A broker that
//! already failed within the call is not offered again while alternatives
//! remain.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::MessageBroker;
use crate::error::{Result, TaskwireError};
use crate::message::TaskMessage;

/// Chooses which broker index serves the next publish attempt.
pub trait FailoverStrategy: Send + Sync {
    fn select(&self, broker_count: usize) -> usize;
}

/// Default strategy: cycles through the broker list starting at index 0.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FailoverStrategy for RoundRobinStrategy {
    fn select(&self, broker_count: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % broker_count
    }
}

/// A broker-of-brokers applying a failover strategy per publish.
pub struct FailoverDispatcher {
    brokers: Vec<Arc<dyn MessageBroker>>,
    strategy: Box<dyn FailoverStrategy>,
}

impl FailoverDispatcher {
    /// Dispatcher over `brokers`, round-robin unless a strategy is given.
    pub fn new(
        brokers: Vec<Arc<dyn MessageBroker>>,
        strategy: Option<Box<dyn FailoverStrategy>>,
    ) -> Self {
        Self {
            brokers,
            strategy: strategy.unwrap_or_else(|| Box::new(RoundRobinStrategy::new())),
        }
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }
}

#[async_trait]
impl MessageBroker for FailoverDispatcher {
    async fn publish(&self, message: &TaskMessage) -> Result<String> {
        let count = self.brokers.len();
        if count == 0 {
            return Err(TaskwireError::Broker("no brokers configured".into()));
        }

        let mut failed: HashSet<usize> = HashSet::new();
        let mut last_error: Option<TaskwireError> = None;

        for attempt in 0..count {
            let mut index = self.strategy.select(count);
            // Skip members that already failed this call while an
            // untried alternative exists. Bounded so a constant strategy
            // cannot spin forever.
            let mut reselections = 0;
            while failed.contains(&index) && failed.len() < count && reselections < count {
                index = self.strategy.select(count);
                reselections += 1;
            }
            if failed.contains(&index) {
                if let Some(alternative) = (0..count).find(|i| !failed.contains(i)) {
                    index = alternative;
                }
            }

            match self.brokers[index].publish(message).await {
                Ok(receipt) => {
                    debug!(broker = index, attempt, "publish dispatched");
                    return Ok(receipt);
                }
                Err(error) => {
                    warn!(broker = index, attempt, error = %error, "broker failed, trying the next one");
                    failed.insert(index);
                    last_error = Some(error);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".into());
        Err(TaskwireError::Broker(format!(
            "{count} broker(s) failed, last error: {reason}"
        )))
    }

    async fn end(&self) -> Result<()> {
        for broker in &self.brokers {
            broker.end().await?;
        }
        Ok(())
    }
}
