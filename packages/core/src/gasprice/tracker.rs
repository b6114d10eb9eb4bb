//! Chain head tracking.
//!
//! Two strategies share the [`HeadTracker`] interface:
//! - [`PollingTracker`] re-fetches the head on a fixed interval, coalescing
//!   concurrent fetches.
//! - [`SubscribedTracker`] follows a push subscription and re-establishes it
//!   when it breaks. Providers that cannot push make startup fall back to
//!   polling.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coalesce::{Coalescer, ResultCache};
use super::error::GasPriceError;
use super::provider::{ChainProvider, HeaderStream, ProviderError};
use super::types::{ChainHead, Header};

const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(250);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

#[async_trait]
pub trait HeadTracker: Send + Sync {
    async fn current_head(&self, cancel: &CancellationToken) -> Result<ChainHead, GasPriceError>;

    /// Registers for head-change signals.
    fn subscribe(&self) -> HeadSubscription;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<()>>,
}

/// Set of head-change subscribers.
#[derive(Clone, Default)]
pub struct SubscriberSet {
    registry: Arc<Mutex<Registry>>,
}

impl SubscriberSet {
    pub fn subscribe(&self) -> HeadSubscription {
        let (sender, receiver) = mpsc::channel(1);
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.senders.insert(id, sender);
        HeadSubscription {
            receiver,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Signals every subscriber without blocking. A subscriber that has not
    /// drained its previous signal keeps that one and gets no duplicate.
    pub fn notify(&self) {
        for sender in self.registry.lock().senders.values() {
            let _ = sender.try_send(());
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of head-change signals. Dropping it unsubscribes.
pub struct HeadSubscription {
    receiver: mpsc::Receiver<()>,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl HeadSubscription {
    /// Waits for the next change. Returns `false` once the tracker is gone.
    pub async fn changed(&mut self) -> bool {
        self.receiver.recv().await.is_some()
    }

    /// Consumes a pending signal, if any, without waiting.
    pub fn try_changed(&mut self) -> bool {
        self.receiver.try_recv().is_ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for HeadSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().senders.remove(&self.id);
        }
    }
}

struct PollState {
    last_head: Option<ChainHead>,
    last_fetch: Option<Instant>,
    subscribers: SubscriberSet,
}

impl ResultCache<(), ChainHead> for PollState {
    fn lookup(&mut self, _key: &()) -> Option<ChainHead> {
        None
    }

    fn store(&mut self, _key: &(), head: &ChainHead) {
        self.last_fetch = Some(Instant::now());
        if self.last_head != Some(*head) {
            debug!(%head, "chain head changed");
            self.last_head = Some(*head);
            self.subscribers.notify();
        }
    }
}

pub struct PollingTracker {
    provider: Arc<dyn ChainProvider>,
    heads: Coalescer<(), ChainHead, PollState>,
    subscribers: SubscriberSet,
    poll_interval: Duration,
}

impl PollingTracker {
    /// Creates the tracker and starts its poll loop, which runs until
    /// `shutdown` is cancelled.
    pub fn spawn(
        provider: Arc<dyn ChainProvider>,
        poll_interval: Duration,
        fetch_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let subscribers = SubscriberSet::default();
        let state = PollState {
            last_head: None,
            last_fetch: None,
            subscribers: subscribers.clone(),
        };
        let tracker = Arc::new(Self {
            provider,
            heads: Coalescer::new(state, fetch_timeout),
            subscribers,
            poll_interval,
        });
        tokio::spawn(Arc::clone(&tracker).poll(shutdown));
        tracker
    }

    /// Last head seen by any fetch, without contacting the provider.
    pub fn last_head(&self) -> Option<ChainHead> {
        self.heads.with_cache(|state| state.last_head)
    }

    async fn poll(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let since_fetch = self
                .heads
                .with_cache(|state| state.last_fetch.map(|at| at.elapsed()));
            let wait = match since_fetch {
                Some(elapsed) if elapsed < self.poll_interval => self.poll_interval - elapsed,
                _ => {
                    if !self.refresh(&shutdown).await {
                        break;
                    }
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("head poll loop stopped");
    }

    /// Fetches until one attempt succeeds. Returns `false` on shutdown.
    async fn refresh(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.current_head(shutdown).await {
                Ok(_) => return true,
                Err(GasPriceError::Cancelled) => return false,
                Err(error) => warn!(
                    %error,
                    provider = self.provider.provider_name(),
                    "head fetch failed, retrying"
                ),
            }
        }
    }
}

async fn fetch_head(provider: Arc<dyn ChainProvider>) -> Result<ChainHead, GasPriceError> {
    let header = provider.latest_header().await?;
    Ok(header.hash)
}

#[async_trait]
impl HeadTracker for PollingTracker {
    async fn current_head(&self, cancel: &CancellationToken) -> Result<ChainHead, GasPriceError> {
        let provider = Arc::clone(&self.provider);
        self.heads
            .get_or_fetch((), cancel, move || fetch_head(provider))
            .await
    }

    fn subscribe(&self) -> HeadSubscription {
        self.subscribers.subscribe()
    }
}

pub struct SubscribedTracker {
    provider: Arc<dyn ChainProvider>,
    last_head: Mutex<ChainHead>,
    subscribers: SubscriberSet,
    fetch_timeout: Duration,
}

impl SubscribedTracker {
    /// Fetches the current head and opens the push subscription. Fails if
    /// either step fails; `ProviderError::SubscriptionsUnsupported` tells
    /// the caller to use a [`PollingTracker`] instead.
    pub async fn connect(
        provider: Arc<dyn ChainProvider>,
        fetch_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, GasPriceError> {
        let header = timeout(fetch_timeout, provider.latest_header())
            .await
            .map_err(|_| ProviderError::Timeout(fetch_timeout))??;
        let stream = timeout(fetch_timeout, provider.subscribe_new_heads())
            .await
            .map_err(|_| ProviderError::Timeout(fetch_timeout))??;

        let tracker = Arc::new(Self {
            provider,
            last_head: Mutex::new(header.hash),
            subscribers: SubscriberSet::default(),
            fetch_timeout,
        });
        tokio::spawn(Arc::clone(&tracker).listen(stream, shutdown));
        Ok(tracker)
    }

    fn on_header(&self, header: &Header) {
        let mut last_head = self.last_head.lock();
        if *last_head != header.hash {
            debug!(head = %header.hash, number = header.number, "chain head changed");
            *last_head = header.hash;
            self.subscribers.notify();
        }
    }

    async fn listen(self: Arc<Self>, mut stream: HeaderStream, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(header)) => {
                    self.on_header(&header);
                    continue;
                }
                Some(Err(error)) => warn!(%error, "head subscription failed"),
                None => warn!(error = %ProviderError::SubscriptionClosed, "head subscription ended"),
            }

            match self.resubscribe(&shutdown).await {
                Some(fresh) => stream = fresh,
                None => break,
            }
        }
        debug!("head subscription listener stopped");
    }

    /// Retries until a subscription is open again. Returns `None` on shutdown.
    async fn resubscribe(&self, shutdown: &CancellationToken) -> Option<HeaderStream> {
        let mut attempt: u32 = 0;
        loop {
            match timeout(self.fetch_timeout, self.provider.subscribe_new_heads()).await {
                Ok(Ok(stream)) => {
                    info!(attempt, "head subscription re-established");
                    self.catch_up().await;
                    return Some(stream);
                }
                Ok(Err(error)) => warn!(%error, attempt, "re-subscription failed"),
                Err(_) => warn!(attempt, "re-subscription timed out"),
            }

            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = sleep(backoff_delay(attempt)) => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Picks up a head that may have been produced while unsubscribed.
    async fn catch_up(&self) {
        match timeout(self.fetch_timeout, self.provider.latest_header()).await {
            Ok(Ok(header)) => self.on_header(&header),
            Ok(Err(error)) => warn!(%error, "could not refresh head after re-subscribing"),
            Err(_) => warn!("head refresh after re-subscribing timed out"),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponential = RESUBSCRIBE_BASE_DELAY.saturating_mul(1u32 << attempt.min(8));
    let capped = exponential.min(RESUBSCRIBE_MAX_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    (capped + Duration::from_millis(jitter_ms)).min(RESUBSCRIBE_MAX_DELAY)
}

#[async_trait]
impl HeadTracker for SubscribedTracker {
    async fn current_head(&self, cancel: &CancellationToken) -> Result<ChainHead, GasPriceError> {
        if cancel.is_cancelled() {
            return Err(GasPriceError::Cancelled);
        }
        Ok(*self.last_head.lock())
    }

    fn subscribe(&self) -> HeadSubscription {
        self.subscribers.subscribe()
    }
}
