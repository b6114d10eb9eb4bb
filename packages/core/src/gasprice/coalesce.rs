//! Request coalescing with result caching.
//!
//! [`Coalescer::get_or_fetch`] answers from the cache when it can. Otherwise
//! the caller registers a private result slot under its key, and the first
//! caller for a key spawns the single upstream fetch. When the fetch
//! finishes, the cache update and the delivery to every registered slot
//! happen in one critical section. Errors are delivered but never cached.
//!
//! The lock is only held for map and field updates, never across an await.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::GasPriceError;
use super::provider::ProviderError;

/// Storage policy plugged into a [`Coalescer`]. All methods run under the
/// coalescer's lock.
pub trait ResultCache<K, V>: Send + 'static {
    fn lookup(&mut self, key: &K) -> Option<V>;

    /// Called when the first waiter for `key` starts a fetch.
    fn begin(&mut self, _key: &K) {}

    /// Called with a successful result before it is delivered to waiters.
    fn store(&mut self, key: &K, value: &V);
}

impl<K, V> ResultCache<K, V> for LruCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn lookup(&mut self, key: &K) -> Option<V> {
        self.get(key).cloned()
    }

    fn store(&mut self, key: &K, value: &V) {
        self.put(key.clone(), value.clone());
    }
}

type Slot<V> = oneshot::Sender<Result<V, GasPriceError>>;

struct Shared<K, V, C> {
    cache: C,
    waiters: HashMap<K, Vec<Slot<V>>>,
}

enum Registration<V> {
    Ready(V),
    First(oneshot::Receiver<Result<V, GasPriceError>>),
    Waiting(oneshot::Receiver<Result<V, GasPriceError>>),
}

pub struct Coalescer<K, V, C> {
    shared: Arc<Mutex<Shared<K, V, C>>>,
    timeout: Duration,
}

impl<K, V, C> Clone for Coalescer<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            timeout: self.timeout,
        }
    }
}

impl<K, V, C> Coalescer<K, V, C>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
    C: ResultCache<K, V>,
{
    /// `timeout` bounds every upstream fetch; it is independent of the
    /// callers' own cancellation.
    pub fn new(cache: C, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                cache,
                waiters: HashMap::new(),
            })),
            timeout,
        }
    }

    /// Runs `f` against the cache under the coalescer's lock.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.shared.lock().cache)
    }

    #[cfg(test)]
    pub fn in_flight(&self, key: &K) -> bool {
        self.shared.lock().waiters.contains_key(key)
    }

    /// Returns the cached value for `key`, or joins (starting if needed) the
    /// single in-flight fetch for it.
    ///
    /// Cancelling `cancel` only abandons this caller's wait. The shared fetch
    /// keeps running for the remaining waiters.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: K,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<V, GasPriceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GasPriceError>> + Send + 'static,
    {
        let receiver = match self.register(&key) {
            Registration::Ready(value) => return Ok(value),
            Registration::Waiting(receiver) => receiver,
            Registration::First(receiver) => {
                self.spawn_fetch(key, fetch());
                receiver
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GasPriceError::Cancelled),
            // Slots are only dropped undelivered on runtime shutdown.
            delivered = receiver => delivered.unwrap_or(Err(GasPriceError::Cancelled)),
        }
    }

    fn register(&self, key: &K) -> Registration<V> {
        let mut guard = self.shared.lock();
        let Shared { cache, waiters } = &mut *guard;
        if let Some(value) = cache.lookup(key) {
            return Registration::Ready(value);
        }

        let (sender, receiver) = oneshot::channel();
        let pending = waiters.entry(key.clone()).or_default();
        pending.push(sender);
        if pending.len() == 1 {
            cache.begin(key);
            Registration::First(receiver)
        } else {
            Registration::Waiting(receiver)
        }
    }

    fn spawn_fetch<Fut>(&self, key: K, fetch: Fut)
    where
        Fut: Future<Output = Result<V, GasPriceError>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let timeout = self.timeout;
        debug!(?key, "starting coalesced fetch");
        tokio::spawn(async move {
            // The fetch runs in its own task so a panic surfaces as a
            // JoinError here instead of leaving the waiters registered.
            let mut task = tokio::spawn(fetch);
            let result = match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(result)) => result,
                Ok(Err(error)) => Err(GasPriceError::FetchFailed(error.to_string())),
                Err(_) => {
                    task.abort();
                    Err(ProviderError::Timeout(timeout).into())
                }
            };

            let mut guard = shared.lock();
            let Shared { cache, waiters } = &mut *guard;
            if let Ok(value) = &result {
                cache.store(&key, value);
            }
            for slot in waiters.remove(&key).unwrap_or_default() {
                // A waiter that gave up has dropped its receiver.
                let _ = slot.send(result.clone());
            }
        });
    }
}
