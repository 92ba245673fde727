use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::config::ConfigHandle;
use crate::exchange::{Exchange, KeyMid};
use crate::scheduler::{Scheduler, TaskHandle};

/// Remembers recently seen (message id, peer) pairs to detect duplicate datagrams
pub trait Deduplicator: Send + Sync + 'static {
    /// Returns the exchange stored for the key, or stores the candidate and returns `None` if
    ///  the key was not seen before
    fn find_previous(&self, key: KeyMid, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>>;

    fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>);
    fn start(&self);
    fn stop(&self);
    fn clear(&self);
}

/// [Deduplicator] that evicts entries older than the exchange lifetime in a periodic sweep
pub struct SweepDeduplicator {
    inner: Arc<SweepInner>,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
    sweep_handle: Mutex<Option<TaskHandle>>,
}

struct SweepInner {
    config: ConfigHandle,
    entries: Mutex<FxHashMap<KeyMid, (Arc<Exchange>, Instant)>>,
}

impl SweepInner {
    fn entries(&self) -> MutexGuard<'_, FxHashMap<KeyMid, (Arc<Exchange>, Instant)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sweep(&self) {
        let lifetime = self.config.load().exchange_lifetime;
        let now = Instant::now();

        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, (_, seen)| now.duration_since(*seen) < lifetime);
        if entries.len() != before {
            debug!("deduplicator sweep evicted {} of {} entries", before - entries.len(), before);
        }
    }
}

impl SweepDeduplicator {
    pub fn new(config: ConfigHandle) -> SweepDeduplicator {
        SweepDeduplicator {
            inner: Arc::new(SweepInner {
                config,
                entries: Default::default(),
            }),
            scheduler: Default::default(),
            sweep_handle: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep_handle(&self) -> MutexGuard<'_, Option<TaskHandle>> {
        match self.sweep_handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Deduplicator for SweepDeduplicator {
    fn find_previous(&self, key: KeyMid, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>> {
        let mut entries = self.inner.entries();
        match entries.entry(key) {
            Entry::Occupied(e) => {
                trace!("duplicate message {:?}", e.key());
                Some(e.get().0.clone())
            }
            Entry::Vacant(e) => {
                e.insert((exchange.clone(), Instant::now()));
                None
            }
        }
    }

    fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        match self.scheduler.lock() {
            Ok(mut guard) => *guard = Some(scheduler),
            Err(poisoned) => *poisoned.into_inner() = Some(scheduler),
        }
    }

    fn start(&self) {
        let scheduler = match self.scheduler.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(scheduler) = scheduler else {
            debug!("deduplicator has no scheduler - not starting the sweep");
            return;
        };

        let mut sweep_handle = self.sweep_handle();
        if sweep_handle.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let interval = inner.config.load().mark_and_sweep_interval;
        *sweep_handle = Some(scheduler.schedule(interval, Box::pin(async move {
            loop {
                inner.sweep();
                // re-read the interval to pick up configuration changes
                let interval = inner.config.load().mark_and_sweep_interval;
                time::sleep(interval).await;
            }
        })));
    }

    fn stop(&self) {
        if let Some(handle) = self.sweep_handle().take() {
            handle.abort();
        }
    }

    fn clear(&self) {
        self.inner.entries().clear();
    }
}
