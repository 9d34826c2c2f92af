//! Bounded borrow/return pool.
//!
//! [`ResourcePool`] caps how many resources exist at once; for this crate
//! that means AMQP channels on one shared connection. Borrowers receive the
//! FIFO-oldest unused resource, a fresh one while under capacity, or block
//! in FIFO order behind a return. Teardown destroys unused resources
//! immediately and defers in-use ones until they come back.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, TaskwireError};

/// Identity source for every pool item, across all pools, so a resource
/// can never be returned to a pool that did not issue it.
static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(0);

type Factory<R> = Box<dyn Fn() -> BoxFuture<'static, Result<R>> + Send + Sync>;
type Destructor<R> = Arc<dyn Fn(R) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// A borrowed resource. Dereferences to the underlying value; hand it back
/// with [`ResourcePool::put`] or one of the scoped helpers.
pub struct PoolItem<R> {
    id: u64,
    pub(crate) value: R,
}

impl<R> Deref for PoolItem<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.value
    }
}

impl<R> DerefMut for PoolItem<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.value
    }
}

struct DrainState {
    outcomes: Vec<String>,
    done: Option<oneshot::Sender<Vec<String>>>,
}

struct PoolState<R> {
    unused: VecDeque<PoolItem<R>>,
    issued: HashSet<u64>,
    num_owned: usize,
    waiters: VecDeque<oneshot::Sender<PoolItem<R>>>,
    drain: Option<DrainState>,
}

/// Bounded pool of asynchronously created and destroyed resources.
pub struct ResourcePool<R> {
    factory: Factory<R>,
    destructor: Destructor<R>,
    capacity: usize,
    state: Arc<Mutex<PoolState<R>>>,
}

impl<R> ResourcePool<R>
where
    R: Send + 'static,
{
    /// Creates a pool owning at most `capacity` resources (minimum 1).
    /// `destroy` reports a human-readable outcome per resource; these are
    /// collected by [`destroy_all`](Self::destroy_all).
    pub fn new<C, CF, D, DF>(create: C, destroy: D, capacity: usize) -> Self
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<R>> + Send + 'static,
        D: Fn(R) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            factory: Box::new(move || create().boxed()),
            destructor: Arc::new(move |resource| destroy(resource).boxed()),
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(PoolState {
                unused: VecDeque::new(),
                issued: HashSet::new(),
                num_owned: 0,
                waiters: VecDeque::new(),
                drain: None,
            })),
        }
    }

    /// Borrows a resource: the FIFO-oldest unused one, or a newly created
    /// one while under capacity. At capacity the call blocks FIFO behind
    /// returns.
    pub async fn get(&self) -> Result<PoolItem<R>> {
        let waiter = {
            let mut state = self.state.lock();
            if state.drain.is_some() {
                return Err(TaskwireError::Disconnected("pool is shutting down".into()));
            }
            if let Some(item) = state.unused.pop_front() {
                state.issued.insert(item.id);
                return Ok(item);
            }
            if state.num_owned < self.capacity {
                state.num_owned += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        match waiter {
            Some(rx) => rx
                .await
                .map_err(|_| TaskwireError::Disconnected("pool is shutting down".into())),
            None => match (self.factory)().await {
                Ok(value) => {
                    let item = PoolItem {
                        id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
                        value,
                    };
                    let mut state = self.state.lock();
                    if state.drain.is_some() {
                        // Teardown raced our creation; this resource was
                        // never issued, so destroy it straight away.
                        drop(state);
                        self.destroy_in_background(item);
                        return Err(TaskwireError::Disconnected("pool is shutting down".into()));
                    }
                    state.issued.insert(item.id);
                    Ok(item)
                }
                Err(error) => {
                    let mut state = self.state.lock();
                    state.num_owned -= 1;
                    finish_drain_if_done(&mut state);
                    Err(error)
                }
            },
        }
    }

    /// Returns a borrowed resource. Fails if the item was not issued by
    /// this pool. During teardown the resource is destroyed instead of
    /// being parked for reuse.
    pub fn put(&self, item: PoolItem<R>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.issued.remove(&item.id) {
            return Err(TaskwireError::Pool(
                "resource was not issued by this pool".into(),
            ));
        }

        if state.drain.is_some() {
            drop(state);
            self.destroy_in_background(item);
            return Ok(());
        }

        let mut item = item;
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    state.issued.insert(item.id);
                    match waiter.send(item) {
                        Ok(()) => return Ok(()),
                        // Receiver gave up on its borrow; reclaim and try
                        // the next waiter.
                        Err(returned) => {
                            state.issued.remove(&returned.id);
                            item = returned;
                        }
                    }
                }
                None => {
                    state.unused.push_back(item);
                    return Ok(());
                }
            }
        }
    }

    /// Scoped borrow: acquires a resource, runs `f`, and returns the
    /// resource on the success and failure paths alike, propagating `f`'s
    /// outcome.
    pub async fn with<T>(
        &self,
        f: impl for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let mut item = self.get().await?;
        let outcome = f(&mut item.value).await;
        self.put(item)?;
        outcome
    }

    /// Returns `item` once `future` settles, forwarding the outcome.
    pub async fn put_after<T, F>(&self, future: F, item: PoolItem<R>) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = future.await;
        self.put(item)?;
        outcome
    }

    /// Shuts the pool down: refuses further [`get`](Self::get)s, destroys
    /// every unused resource immediately, and defers in-use resources
    /// until their return. Resolves only after everything owned has been
    /// destroyed, with one outcome per resource in destruction order.
    pub async fn destroy_all(&self) -> Result<Vec<String>> {
        let (unused, done) = {
            let mut state = self.state.lock();
            if state.drain.is_some() {
                return Err(TaskwireError::Disconnected(
                    "pool is already shutting down".into(),
                ));
            }
            let (tx, rx) = oneshot::channel();
            state.drain = Some(DrainState {
                outcomes: Vec::new(),
                done: Some(tx),
            });
            // Queued borrowers can never be served now; dropping their
            // senders settles them with a disconnect.
            state.waiters.clear();
            let unused: Vec<PoolItem<R>> = state.unused.drain(..).collect();
            (unused, rx)
        };

        for item in unused {
            let outcome = run_destructor(&self.destructor, item.value).await;
            let mut state = self.state.lock();
            state.num_owned -= 1;
            if let Some(drain) = state.drain.as_mut() {
                drain.outcomes.push(outcome);
            }
        }

        finish_drain_if_done(&mut self.state.lock());

        done.await
            .map_err(|_| TaskwireError::Pool("pool state dropped during shutdown".into()))
    }

    pub fn num_owned(&self) -> usize {
        self.state.lock().num_owned
    }

    pub fn num_in_use(&self) -> usize {
        self.state.lock().issued.len()
    }

    pub fn num_unused(&self) -> usize {
        self.state.lock().unused.len()
    }

    fn destroy_in_background(&self, item: PoolItem<R>) {
        let destructor = self.destructor.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let outcome = run_destructor(&destructor, item.value).await;
            let mut state = state.lock();
            state.num_owned -= 1;
            if let Some(drain) = state.drain.as_mut() {
                drain.outcomes.push(outcome);
            }
            finish_drain_if_done(&mut state);
        });
    }
}

async fn run_destructor<R>(destructor: &Destructor<R>, resource: R) -> String {
    match destructor(resource).await {
        Ok(outcome) => outcome,
        Err(error) => format!("destroy failed: {error}"),
    }
}

fn finish_drain_if_done<R>(state: &mut PoolState<R>) {
    if state.num_owned > 0 {
        return;
    }
    if let Some(drain) = state.drain.as_mut() {
        if let Some(done) = drain.done.take() {
            let _ = done.send(std::mem::take(&mut drain.outcomes));
        }
    }
}
