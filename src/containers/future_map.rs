//! Keyed registry of eventually-delivered values.
//!
//! [`FutureMap`] correlates an identifier (for this crate, a task UUID)
//! with a value that arrives later on a consumer callback or subscription.
//! Waiters may register before or after the value lands; either order
//! delivers the same outcome, and every waiter on a key shares it.

use std::collections::hash_map::Entry as HashEntry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, TaskwireError};

type Outcome<V> = std::result::Result<V, TaskwireError>;

enum EntryState<V> {
    Pending(Vec<oneshot::Sender<Outcome<V>>>),
    Fulfilled(V),
    Rejected(TaskwireError),
}

struct Entry<V> {
    state: EntryState<V>,
    /// Timer deleting this entry after settlement; aborted by delete/clear.
    expiry: Option<JoinHandle<()>>,
}

/// Map from string key to settled-or-pending outcome.
///
/// Shared state lives behind an `Arc`, so clones observe the same records;
/// the result-correlation engines hand a clone to their consumer task.
pub struct FutureMap<V> {
    entries: Arc<Mutex<HashMap<String, Entry<V>>>>,
    entry_timeout: Option<Duration>,
}

impl<V> Clone for FutureMap<V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            entry_timeout: self.entry_timeout,
        }
    }
}

impl<V> Default for FutureMap<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FutureMap<V>
where
    V: Clone + Send + 'static,
{
    /// A map whose settled entries live until explicitly deleted.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            entry_timeout: None,
        }
    }

    /// A map whose settled entries are deleted `timeout` after settlement.
    /// The timer starts when a key settles, not when it is created, and is
    /// cancelled by [`delete`](Self::delete) and [`clear`](Self::clear).
    pub fn with_expiry(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            entry_timeout: Some(timeout),
        }
    }

    /// Future for the value under `key`, creating a pending record if none
    /// exists yet.
    pub async fn get(&self, key: &str) -> Result<V> {
        let receiver = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) => match entry.state {
                    EntryState::Fulfilled(ref value) => return Ok(value.clone()),
                    EntryState::Rejected(ref error) => return Err(error.clone()),
                    EntryState::Pending(ref mut waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        rx
                    }
                },
                None => {
                    let (tx, rx) = oneshot::channel();
                    entries.insert(
                        key.to_owned(),
                        Entry {
                            state: EntryState::Pending(vec![tx]),
                            expiry: None,
                        },
                    );
                    rx
                }
            }
        };

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskwireError::Disconnected(format!(
                "entry for {key} dropped before settlement"
            ))),
        }
    }

    /// Fulfills `key` with `value`, delivering to every pending waiter.
    /// Returns whether the record was created by this call. Settling an
    /// already-settled key replaces the stored value without re-notifying
    /// waiters that already observed the previous one.
    pub fn resolve(&self, key: &str, value: V) -> bool {
        self.settle(key, Ok(value))
    }

    /// Rejects `key` with `error`. Same creation/overwrite semantics as
    /// [`resolve`](Self::resolve).
    pub fn reject(&self, key: &str, error: TaskwireError) -> bool {
        self.settle(key, Err(error))
    }

    /// Keeps `key` pending until `future` settles, then adopts its outcome.
    /// Returns whether the record was created by this call.
    pub fn resolve_with<F>(&self, key: &str, future: F) -> bool
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let created = {
            let mut entries = self.entries.lock();
            match entries.entry(key.to_owned()) {
                HashEntry::Occupied(_) => false,
                HashEntry::Vacant(slot) => {
                    slot.insert(Entry {
                        state: EntryState::Pending(Vec::new()),
                        expiry: None,
                    });
                    true
                }
            }
        };

        let map = self.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            match future.await {
                Ok(value) => {
                    map.resolve(&key, value);
                }
                Err(error) => {
                    map.reject(&key, error);
                }
            }
        });

        created
    }

    /// Removes `key`, rejecting any still-pending waiters, and reports
    /// whether a record existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(entry) => {
                if let Some(handle) = entry.expiry {
                    handle.abort();
                }
                if let EntryState::Pending(waiters) = entry.state {
                    let error = TaskwireError::Disconnected(format!("entry for {key} deleted"));
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Rejects every currently-pending key with `error`, leaving settled
    /// keys untouched. Returns how many keys were rejected.
    pub fn reject_all(&self, error: TaskwireError) -> usize {
        let mut rejected = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (key, entry) in entries.iter_mut() {
                if matches!(entry.state, EntryState::Pending(_)) {
                    let prev =
                        std::mem::replace(&mut entry.state, EntryState::Rejected(error.clone()));
                    if let EntryState::Pending(waiters) = prev {
                        for waiter in waiters {
                            let _ = waiter.send(Err(error.clone()));
                        }
                    }
                    rejected.push(key.clone());
                }
            }
        }
        for key in &rejected {
            self.schedule_expiry(key);
        }
        rejected.len()
    }

    /// Rejects every pending key with a "cleared" reason and drops all
    /// records, settled ones included.
    pub fn clear(&self) {
        let drained: Vec<(String, Entry<V>)> = self.entries.lock().drain().collect();
        for (_, entry) in drained {
            if let Some(handle) = entry.expiry {
                handle.abort();
            }
            if let EntryState::Pending(waiters) = entry.state {
                for waiter in waiters {
                    let _ = waiter.send(Err(TaskwireError::Disconnected("cleared".into())));
                }
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        matches!(
            self.entries.lock().get(key).map(|e| &e.state),
            Some(EntryState::Pending(_))
        )
    }

    pub fn is_fulfilled(&self, key: &str) -> bool {
        matches!(
            self.entries.lock().get(key).map(|e| &e.state),
            Some(EntryState::Fulfilled(_))
        )
    }

    pub fn is_rejected(&self, key: &str) -> bool {
        matches!(
            self.entries.lock().get(key).map(|e| &e.state),
            Some(EntryState::Rejected(_))
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn settle(&self, key: &str, outcome: Outcome<V>) -> bool {
        let created = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) => {
                    let next = match &outcome {
                        Ok(value) => EntryState::Fulfilled(value.clone()),
                        Err(error) => EntryState::Rejected(error.clone()),
                    };
                    let prev = std::mem::replace(&mut entry.state, next);
                    if let EntryState::Pending(waiters) = prev {
                        for waiter in waiters {
                            let _ = waiter.send(outcome.clone());
                        }
                    }
                    false
                }
                None => {
                    let state = match outcome {
                        Ok(value) => EntryState::Fulfilled(value),
                        Err(error) => EntryState::Rejected(error),
                    };
                    entries.insert(
                        key.to_owned(),
                        Entry {
                            state,
                            expiry: None,
                        },
                    );
                    true
                }
            }
        };
        self.schedule_expiry(key);
        created
    }

    fn schedule_expiry(&self, key: &str) {
        let Some(timeout) = self.entry_timeout else {
            return;
        };
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.expiry.is_some() || matches!(entry.state, EntryState::Pending(_)) {
            return;
        }
        // Hold only a weak handle so sleeping timers never keep a dropped
        // map's records alive.
        let weak = Arc::downgrade(&self.entries);
        let key = key.to_owned();
        entry.expiry = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entries) = weak.upgrade() {
                entries.lock().remove(&key);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_then_get_delivers_the_value() {
        let map: FutureMap<u32> = FutureMap::new();
        assert!(map.resolve("a", 7));
        assert_eq!(map.get("a").await.unwrap(), 7);
        assert!(map.is_fulfilled("a"));
    }

    #[tokio::test]
    async fn get_then_resolve_delivers_to_the_original_waiter() {
        let map: FutureMap<u32> = FutureMap::new();
        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.get("a").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(map.is_pending("a"));
        assert!(!map.resolve("a", 9));
        assert_eq!(waiter.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_one_outcome() {
        let map: FutureMap<u32> = FutureMap::new();
        let first = {
            let map = map.clone();
            tokio::spawn(async move { map.get("k").await })
        };
        let second = {
            let map = map.clone();
            tokio::spawn(async move { map.get("k").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        map.resolve("k", 3);
        assert_eq!(first.await.unwrap().unwrap(), 3);
        assert_eq!(second.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn reject_is_symmetric() {
        let map: FutureMap<u32> = FutureMap::new();
        map.reject("a", TaskwireError::Amqp("boom".into()));
        assert!(map.is_rejected("a"));
        assert_eq!(
            map.get("a").await.unwrap_err(),
            TaskwireError::Amqp("boom".into())
        );
    }

    #[tokio::test]
    async fn resolve_reports_record_creation() {
        let map: FutureMap<u32> = FutureMap::new();
        assert!(map.resolve("fresh", 1));

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.get("seen").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!map.resolve("seen", 2));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn delete_rejects_pending_waiters() {
        let map: FutureMap<u32> = FutureMap::new();
        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.get("gone").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(map.delete("gone"));
        assert!(waiter.await.unwrap().is_err());
        assert!(!map.has("gone"));
        assert!(!map.delete("gone"));
    }

    #[tokio::test]
    async fn reject_all_leaves_settled_keys_intact() {
        let map: FutureMap<u32> = FutureMap::new();
        map.resolve("done", 1);
        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.get("waiting").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let rejected = map.reject_all(TaskwireError::Disconnected("disconnecting".into()));
        assert_eq!(rejected, 1);
        assert!(waiter.await.unwrap().is_err());
        assert_eq!(map.get("done").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_rejects_with_cleared_reason_and_empties_the_map() {
        let map: FutureMap<u32> = FutureMap::new();
        map.resolve("settled", 5);
        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.get("open").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        map.clear();
        let error = waiter.await.unwrap().unwrap_err();
        assert!(error.to_string().contains("cleared"));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn resolve_with_adopts_a_rejecting_future() {
        let map: FutureMap<u32> = FutureMap::new();
        let created =
            map.resolve_with("k", async { Err(TaskwireError::Redis("offline".into())) });
        assert!(created);
        assert_eq!(
            map.get("k").await.unwrap_err(),
            TaskwireError::Redis("offline".into())
        );
    }

    #[tokio::test]
    async fn resolve_with_adopts_a_fulfilling_future() {
        let map: FutureMap<u32> = FutureMap::new();
        map.resolve_with("k", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(11)
        });
        assert!(map.is_pending("k"));
        assert_eq!(map.get("k").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn settled_entries_expire_after_the_configured_timeout() {
        let map: FutureMap<u32> = FutureMap::with_expiry(Duration::from_millis(10));
        map.resolve("short", 1);
        assert!(map.has("short"));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!map.has("short"));
    }

    #[tokio::test]
    async fn overwriting_a_settled_key_replaces_the_value() {
        let map: FutureMap<u32> = FutureMap::new();
        map.resolve("k", 1);
        assert!(!map.resolve("k", 2));
        assert_eq!(map.get("k").await.unwrap(), 2);
    }
}
