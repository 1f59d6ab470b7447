//! Queue engine: admission, de-duplication, and the serial worker.
//!
//! A [`BaseQueue`] is configured by a plug-in implementing [`QueueImpl`].
//! The engine owns the plug-in; the plug-in only reaches back through the
//! [`Requeue`] handle it was given at construction.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::priority::{IndexedPriorityQueue, Upsert};

// =============================================================================
// Plug-in Contract
// =============================================================================

/// Something that can sit in a queue.
pub trait QueueItem: Send + Sync + 'static {
    /// Identity used for de-duplication.
    type Key: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;

    /// The item's identity.
    fn key(&self) -> Self::Key;

    /// Whether the local store holds the item's lease at `now`.
    fn holds_lease(&self, now: DateTime<Utc>) -> bool;
}

/// Answers whether an item still spans a policy boundary.
pub trait SplitPolicy<I: ?Sized> {
    fn needs_split(&self, item: &I) -> bool;
}

/// Source of the current system configuration snapshot.
///
/// `None` means the configuration has not arrived yet; the queue neither
/// admits nor processes until it has.
pub trait ConfigProvider<C>: Send + Sync {
    fn system_config(&self) -> Option<Arc<C>>;
}

/// Atomically swappable configuration slot.
pub struct SharedConfig<C> {
    current: ArcSwapOption<C>,
}

impl<C> SharedConfig<C> {
    /// Create an empty slot.
    pub fn empty() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// Create a slot holding `config`.
    pub fn new(config: C) -> Self {
        Self {
            current: ArcSwapOption::from_pointee(config),
        }
    }

    /// Replace the current configuration.
    pub fn store(&self, config: C) {
        self.current.store(Some(Arc::new(config)));
    }
}

impl<C> Default for SharedConfig<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: Send + Sync> ConfigProvider<C> for SharedConfig<C> {
    fn system_config(&self) -> Option<Arc<C>> {
        self.current.load_full()
    }
}

/// The capability set a maintenance loop plugs into the engine.
#[async_trait]
pub trait QueueImpl: Send + Sync + 'static {
    /// What gets queued.
    type Item: QueueItem;

    /// System configuration consulted on admission and processing.
    type Config: SplitPolicy<Self::Item> + Send + Sync + 'static;

    /// Error returned by `process`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Only the lease holder may admit and process an item.
    fn needs_leader_lease(&self) -> bool;

    /// Whether items that still need a policy-boundary split are admitted.
    fn accepts_unsplit_ranges(&self) -> bool;

    /// Pause between processed entries. Zero means no pause.
    fn timer_interval(&self) -> Duration;

    /// Decide whether `item` should be queued, and with what priority.
    fn should_queue(&self, now: DateTime<Utc>, item: &Self::Item, cfg: &Self::Config)
        -> (bool, f64);

    /// Act on a dequeued item.
    async fn process(
        &self,
        now: DateTime<Utc>,
        item: &Self::Item,
        cfg: &Self::Config,
    ) -> Result<(), Self::Error>;
}

// =============================================================================
// Requeue Handle
// =============================================================================

type RequeueMessage<I> = (Arc<I>, DateTime<Utc>);

/// Callback handed to a plug-in so it can re-offer items to its own queue.
///
/// Re-offers go through normal admission when the worker next takes a turn,
/// never re-entrantly from inside `process`.
pub struct Requeue<I> {
    tx: mpsc::UnboundedSender<RequeueMessage<I>>,
    outstanding: Arc<AtomicUsize>,
}

impl<I> Clone for Requeue<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            outstanding: Arc::clone(&self.outstanding),
        }
    }
}

impl<I: QueueItem> Requeue<I> {
    /// Offer `item` again at time `at`.
    ///
    /// Silently dropped if the queue worker has shut down.
    pub fn requeue(&self, item: Arc<I>, at: DateTime<Utc>) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send((item, at)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            trace!("requeue after queue shutdown ignored");
        }
    }
}

/// Receiving side of [`Requeue`], consumed by [`BaseQueue::new`].
pub struct RequeueReceiver<I> {
    rx: mpsc::UnboundedReceiver<RequeueMessage<I>>,
    outstanding: Arc<AtomicUsize>,
}

impl<I> RequeueReceiver<I> {
    /// Take the next pending re-offer without waiting.
    pub fn try_recv(&mut self) -> Option<(Arc<I>, DateTime<Utc>)> {
        self.rx.try_recv().ok()
    }
}

/// Create a linked requeue handle and receiver.
pub fn requeue_channel<I>() -> (Requeue<I>, RequeueReceiver<I>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let outstanding = Arc::new(AtomicUsize::new(0));
    (
        Requeue {
            tx,
            outstanding: Arc::clone(&outstanding),
        },
        RequeueReceiver { rx, outstanding },
    )
}

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time counters for a queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// New entries admitted.
    pub added: u64,

    /// Existing entries whose priority was replaced.
    pub updated: u64,

    /// Entries evicted to respect the size bound.
    pub evicted: u64,

    /// Entries processed successfully.
    pub processed: u64,

    /// Entries whose processing returned an error.
    pub failed: u64,

    /// Entries dropped at processing time (lease lost, no config).
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    added: AtomicU64,
    updated: AtomicU64,
    evicted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            added: self.added.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Base Queue
// =============================================================================

type Key<Q> = <<Q as QueueImpl>::Item as QueueItem>::Key;

struct Shared<Q: QueueImpl> {
    name: String,
    max_size: usize,
    imp: Q,
    config: Arc<dyn ConfigProvider<Q::Config>>,
    entries: Mutex<IndexedPriorityQueue<Key<Q>, Arc<Q::Item>>>,
    requeue_rx: Mutex<Option<RequeueReceiver<Q::Item>>>,
    /// Held across `process` so the worker and `process_one` callers never
    /// overlap.
    processing: AsyncMutex<()>,
    wake: Notify,
    counters: Counters,
    /// Queued entries + the entry being processed + re-offers not yet
    /// admitted. Work moves between these without the sum touching zero.
    outstanding: Arc<AtomicUsize>,
}

/// A bounded, de-duplicated priority queue drained by one serial worker.
pub struct BaseQueue<Q: QueueImpl> {
    shared: Arc<Shared<Q>>,
}

impl<Q: QueueImpl> Clone for BaseQueue<Q> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Q: QueueImpl> BaseQueue<Q> {
    /// Create a queue around the plug-in `imp`.
    ///
    /// `requeue_rx` must be the receiver paired with the [`Requeue`] handle
    /// given to `imp`.
    pub fn new(
        name: impl Into<String>,
        max_size: usize,
        imp: Q,
        config: Arc<dyn ConfigProvider<Q::Config>>,
        requeue_rx: RequeueReceiver<Q::Item>,
    ) -> Self {
        let outstanding = Arc::clone(&requeue_rx.outstanding);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                max_size: max_size.max(1),
                imp,
                config,
                entries: Mutex::new(IndexedPriorityQueue::new()),
                requeue_rx: Mutex::new(Some(requeue_rx)),
                processing: AsyncMutex::new(()),
                wake: Notify::new(),
                counters: Counters::default(),
                outstanding,
            }),
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The plug-in configuring this queue.
    pub fn plugin(&self) -> &Q {
        &self.shared.imp
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Returns true if `key` is queued.
    pub fn contains(&self, key: &Key<Q>) -> bool {
        self.entries().contains(key)
    }

    /// Current priority of `key`, if queued.
    pub fn priority(&self, key: &Key<Q>) -> Option<f64> {
        self.entries().priority(key)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        self.shared.counters.snapshot()
    }

    /// True when nothing is queued, nothing is being processed, and no
    /// re-offer is pending.
    pub fn is_idle(&self) -> bool {
        self.shared.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Offer `item` for admission.
    ///
    /// Rejections are silent. Never calls `process` and never blocks on I/O,
    /// so it is safe to call from scanners, gossip callbacks, and the
    /// worker itself.
    pub fn maybe_add(&self, item: Arc<Q::Item>, now: DateTime<Utc>) {
        let shared = &self.shared;
        let Some(cfg) = shared.config.system_config() else {
            trace!(queue = %shared.name, "no system config yet, skipping admission");
            return;
        };

        if shared.imp.needs_leader_lease() && !item.holds_lease(now) {
            return;
        }

        if !shared.imp.accepts_unsplit_ranges() && cfg.needs_split(&item) {
            return;
        }

        let (should_queue, priority) = shared.imp.should_queue(now, &item, &cfg);
        if !should_queue {
            return;
        }

        let key = item.key();
        let evicted = {
            let mut entries = self.entries();
            match entries.upsert(key.clone(), item, priority, now) {
                Upsert::Inserted => {
                    Counters::bump(&shared.counters.added);
                    shared.outstanding.fetch_add(1, Ordering::SeqCst);
                }
                Upsert::Updated => Counters::bump(&shared.counters.updated),
            }
            if entries.len() > shared.max_size {
                let evicted = entries.evict_min().map(|(k, _)| k);
                if evicted.is_some() {
                    shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                }
                evicted
            } else {
                None
            }
        };

        match evicted {
            Some(evicted) => {
                Counters::bump(&shared.counters.evicted);
                debug!(
                    queue = %shared.name,
                    key = %evicted,
                    "queue full, evicted lowest priority entry"
                );
                if evicted != key {
                    shared.wake.notify_one();
                }
            }
            None => {
                trace!(queue = %shared.name, key = %key, priority, "queued");
                shared.wake.notify_one();
            }
        }
    }

    /// Remove `key` from the queue if present.
    pub fn maybe_remove(&self, key: &Key<Q>) -> bool {
        let removed = self.entries().remove(key).is_some();
        if removed {
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Run the serial worker until shutdown is signaled.
    ///
    /// Only one worker may drain a queue; a second call returns at once.
    #[instrument(skip(self, shutdown), fields(queue = %self.shared.name))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut requeue_rx) = self.take_requeue_rx() else {
            warn!("queue worker already running, refusing to start a second one");
            return;
        };

        info!(
            max_size = self.shared.max_size,
            timer_ms = self.shared.imp.timer_interval().as_millis() as u64,
            "Starting queue worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some((item, at)) = requeue_rx.try_recv() {
                self.readmit(item, at);
            }

            let Some(item) = self.pop() else {
                tokio::select! {
                    biased;

                    _ = shutdown_signaled(&mut shutdown) => break,
                    msg = requeue_rx.rx.recv() => {
                        if let Some((item, at)) = msg {
                            self.readmit(item, at);
                        }
                    }
                    _ = self.shared.wake.notified() => {}
                }
                continue;
            };

            let key = item.key();
            tokio::select! {
                biased;

                _ = shutdown_signaled(&mut shutdown) => {
                    info!(key = %key, "shutdown while processing, abandoning entry");
                    break;
                }
                _ = self.process_item(item) => {}
            }

            let interval = self.shared.imp.timer_interval();
            if !interval.is_zero() {
                tokio::select! {
                    biased;

                    _ = shutdown_signaled(&mut shutdown) => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        info!(remaining = self.len(), "Queue worker shutting down");
    }

    /// Admit pending re-offers, then pop and process a single entry.
    /// Returns false if the queue was empty.
    ///
    /// Used by callers that drive the queue themselves instead of via `run`.
    /// Waits for any in-flight `process` call, including the worker's, to
    /// finish first.
    pub async fn process_one(&self) -> bool {
        let pending: Vec<_> = {
            let mut guard = self
                .shared
                .requeue_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(rx) => std::iter::from_fn(|| rx.try_recv()).collect(),
                None => Vec::new(),
            }
        };
        for (item, at) in pending {
            self.readmit(item, at);
        }

        match self.pop() {
            Some(item) => {
                self.process_item(item).await;
                true
            }
            None => false,
        }
    }

    async fn process_item(&self, item: Arc<Q::Item>) {
        let _serial = self.shared.processing.lock().await;
        self.process_popped(item).await;
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    async fn process_popped(&self, item: Arc<Q::Item>) {
        let shared = &self.shared;
        let key = item.key();

        let Some(cfg) = shared.config.system_config() else {
            debug!(key = %key, "no system config, dropping entry");
            Counters::bump(&shared.counters.skipped);
            return;
        };

        let now = Utc::now();
        if shared.imp.needs_leader_lease() && !item.holds_lease(now) {
            debug!(key = %key, "lease no longer held, dropping entry");
            Counters::bump(&shared.counters.skipped);
            return;
        }

        match shared.imp.process(now, &item, &cfg).await {
            Ok(()) => {
                Counters::bump(&shared.counters.processed);
                debug!(key = %key, "processed");
            }
            Err(e) => {
                Counters::bump(&shared.counters.failed);
                error!(key = %key, error = %e, "failed to process entry");
            }
        }
    }

    fn pop(&self) -> Option<Arc<Q::Item>> {
        self.entries().pop_max().map(|(_, entry)| entry.value)
    }

    /// Admit a re-offer taken off the requeue channel.
    fn readmit(&self, item: Arc<Q::Item>, at: DateTime<Utc>) {
        self.maybe_add(item, at);
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn take_requeue_rx(&self) -> Option<RequeueReceiver<Q::Item>> {
        self.shared
            .requeue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn entries(&self) -> MutexGuard<'_, IndexedPriorityQueue<Key<Q>, Arc<Q::Item>>> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_signaled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
