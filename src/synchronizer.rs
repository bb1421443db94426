//! Single-flight polling of the solar API.
//!
//! The [`Synchronizer`] owns one [`SyncState`], runs a cancellable poll loop on
//! the tokio runtime and lets manual refreshes share the loop's in-flight
//! fetch. Every fetch is tagged with a generation number and the run epoch it
//! was dispatched in; a completion is only committed while both are still
//! current, so `stop()` and out-of-order completions can never clobber newer
//! state.

use crate::connectivity::Connectivity;
use crate::error::FetchError;
use crate::models::Snapshot;
use crate::settings_store::ConfigStore;
use crate::solar_api::{SnapshotSource, DEFAULT_REQUEST_TIMEOUT};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

pub type FetchResult = Result<Arc<Snapshot>, FetchError>;

/// Everything an observer needs to render the dashboard
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub last_snapshot: Option<Arc<Snapshot>>,
    pub last_error: Option<FetchError>,
    pub is_fetching: bool,
    pub is_configured: bool,
    pub is_offline: bool,
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Upper bound for one fetch. The refresh interval caps it further.
    pub request_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type StateCallback = Arc<dyn Fn(&SyncState) + Send + Sync>;

/// Handle for a registered observer
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock_core().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

struct InFlight {
    generation: u64,
    result: watch::Receiver<Option<FetchResult>>,
}

struct Core {
    state: SyncState,
    version: u64,
    generation: u64,
    committed_generation: u64,
    /// Bumped by every `stop()`; fetches dispatched in an older epoch are ignored
    epoch: u64,
    in_flight: Option<InFlight>,
    /// Key that got a 401/403; timer cycles leave it alone until it changes
    rejected_key: Option<String>,
    run: Option<CancellationToken>,
    subscribers: Vec<(u64, StateCallback)>,
    next_subscriber: u64,
}

impl Core {
    fn publication(&mut self) -> Publication {
        self.version += 1;
        Publication {
            version: self.version,
            state: self.state.clone(),
            subscribers: self.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        }
    }
}

struct Publication {
    version: u64,
    state: SyncState,
    subscribers: Vec<StateCallback>,
}

enum Trigger<'a> {
    Timer(&'a CancellationToken),
    Manual,
}

enum Dispatch {
    Started(watch::Receiver<Option<FetchResult>>),
    Joined(watch::Receiver<Option<FetchResult>>),
    Skipped(FetchError),
    Cancelled,
}

struct PendingFetch {
    generation: u64,
    epoch: u64,
    api_key: String,
    deadline: Duration,
    result: watch::Sender<Option<FetchResult>>,
}

struct Inner {
    source: Arc<dyn SnapshotSource>,
    config: Arc<dyn ConfigStore>,
    connectivity: Arc<dyn Connectivity>,
    options: SyncOptions,
    core: Mutex<Core>,
    delivered: Mutex<u64>,
    timer_reset: Notify,
}

pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        config: Arc<dyn ConfigStore>,
        connectivity: Arc<dyn Connectivity>,
        options: SyncOptions,
    ) -> Self {
        let core = Core {
            state: SyncState::default(),
            version: 0,
            generation: 0,
            committed_generation: 0,
            epoch: 0,
            in_flight: None,
            rejected_key: None,
            run: None,
            subscribers: Vec::new(),
            next_subscriber: 0,
        };
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                connectivity,
                options,
                core: Mutex::new(core),
                delivered: Mutex::new(0),
                timer_reset: Notify::new(),
            }),
        }
    }

    /// Starts the poll loop. Does nothing when it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let started = self.inner.mutate(|core| {
            if core.run.is_some() {
                return (None, false);
            }
            let cancel = CancellationToken::new();
            core.run = Some(cancel.clone());
            (Some(cancel), false)
        });
        if let Some(cancel) = started {
            tokio::spawn(poll_loop(Arc::clone(&self.inner), cancel));
        }
    }

    /// Stops the loop and orphans any in-flight fetch; its result will be ignored.
    pub fn stop(&self) {
        self.inner.mutate(|core| {
            if let Some(cancel) = core.run.take() {
                tracing::info!("Stopping solar telemetry poll loop");
                cancel.cancel();
            }
            core.epoch += 1;
            let orphaned = core.in_flight.take().is_some();
            if orphaned {
                tracing::debug!("Ignoring result of in-flight fetch after stop");
            }
            let changed = core.state.is_fetching;
            core.state.is_fetching = false;
            ((), changed)
        });
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_core().run.is_some()
    }

    /// Fetches right away, or joins the fetch that is already in flight.
    ///
    /// Restarts the loop's sleep afterwards so the next timed fetch is a full
    /// interval away.
    pub async fn refresh_now(&self) -> FetchResult {
        let result = match self.inner.dispatch(Trigger::Manual) {
            Dispatch::Started(rx) | Dispatch::Joined(rx) => wait_for_result(rx).await,
            Dispatch::Skipped(reason) => Err(reason),
            Dispatch::Cancelled => Err(FetchError::Unreachable),
        };
        self.inner.timer_reset.notify_waiters();
        result
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock_core().state.clone()
    }

    /// Registers `callback`, calls it with the current state, then after every change.
    ///
    /// Callbacks run on whichever task changed the state. They may read
    /// `state()` but must not start, stop, refresh or subscribe.
    pub fn subscribe(
        &self,
        callback: impl Fn(&SyncState) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: StateCallback = Arc::new(callback);
        let _delivery = self.inner.lock_delivered();
        let (id, state) = {
            let mut core = self.inner.lock_core();
            let id = core.next_subscriber;
            core.next_subscriber += 1;
            core.subscribers.push((id, Arc::clone(&callback)));
            (id, core.state.clone())
        };
        callback(&state);
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_delivered(&self) -> MutexGuard<'_, u64> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `change` under the state lock and publishes when it reports a change
    fn mutate<R>(&self, change: impl FnOnce(&mut Core) -> (R, bool)) -> R {
        let (result, publication) = {
            let mut core = self.lock_core();
            let (result, changed) = change(&mut core);
            (result, changed.then(|| core.publication()))
        };
        if let Some(publication) = publication {
            self.deliver(publication);
        }
        result
    }

    fn deliver(&self, publication: Publication) {
        let mut delivered = self.lock_delivered();
        // A newer state already went out; never hand observers an older one
        if publication.version <= *delivered {
            return;
        }
        *delivered = publication.version;
        for callback in &publication.subscribers {
            callback(&publication.state);
        }
    }

    fn dispatch(self: &Arc<Self>, trigger: Trigger<'_>) -> Dispatch {
        let credentials = self.config.credentials();
        let reachable = self.connectivity.is_reachable();

        let (dispatch, pending) = self.mutate(|core| {
            if let Trigger::Timer(cancel) = &trigger {
                if cancel.is_cancelled() {
                    return ((Dispatch::Cancelled, None), false);
                }
            }
            if let Some(in_flight) = &core.in_flight {
                return ((Dispatch::Joined(in_flight.result.clone()), None), false);
            }

            let flags_before = (core.state.is_configured, core.state.is_offline);
            let Some(credentials) = credentials else {
                core.state.is_configured = false;
                return ((Dispatch::Skipped(FetchError::NotConfigured), None), true);
            };
            core.state.is_configured = true;

            if !reachable {
                core.state.is_offline = true;
                return ((Dispatch::Skipped(FetchError::Unreachable), None), true);
            }
            core.state.is_offline = false;

            let is_timer = matches!(trigger, Trigger::Timer(_));
            if is_timer && core.rejected_key.as_deref() == Some(credentials.api_key.as_str()) {
                let changed = flags_before != (core.state.is_configured, core.state.is_offline);
                return ((Dispatch::Skipped(FetchError::Unauthorized), None), changed);
            }

            core.generation += 1;
            core.state.is_fetching = true;
            let (tx, rx) = watch::channel(None);
            core.in_flight = Some(InFlight {
                generation: core.generation,
                result: rx.clone(),
            });
            let pending = PendingFetch {
                generation: core.generation,
                epoch: core.epoch,
                deadline: self.options.request_timeout.min(credentials.refresh_interval),
                api_key: credentials.api_key,
                result: tx,
            };
            ((Dispatch::Started(rx), Some(pending)), true)
        });

        if let Some(pending) = pending {
            tokio::spawn(Arc::clone(self).run_fetch(pending));
        }
        dispatch
    }

    /// Performs the network call in its own task so an abandoned caller
    /// cannot leave the state stuck in `is_fetching`.
    async fn run_fetch(self: Arc<Self>, pending: PendingFetch) {
        tracing::debug!("Dispatching fetch generation {}", pending.generation);
        let result = self
            .source
            .fetch_snapshot(&pending.api_key, pending.deadline)
            .await
            .map(Arc::new);
        self.complete(&pending, &result);
        pending.result.send_replace(Some(result));
    }

    fn complete(&self, pending: &PendingFetch, result: &FetchResult) {
        let generation = pending.generation;
        self.mutate(|core| {
            let is_current = core
                .in_flight
                .as_ref()
                .is_some_and(|f| f.generation == generation);
            if !is_current || core.epoch != pending.epoch || generation <= core.committed_generation
            {
                tracing::debug!("Discarding stale result of fetch generation {}", generation);
                return ((), false);
            }

            core.in_flight = None;
            core.state.is_fetching = false;
            match result {
                Ok(snapshot) => {
                    tracing::debug!("Committed snapshot of fetch generation {}", generation);
                    core.committed_generation = generation;
                    core.rejected_key = None;
                    core.state.last_snapshot = Some(Arc::clone(snapshot));
                    core.state.last_error = None;
                    core.state.last_updated_at = Some(Utc::now());
                }
                Err(e) => {
                    tracing::warn!("Fetch generation {} failed: {}", generation, e);
                    if *e == FetchError::Unauthorized {
                        core.rejected_key = Some(pending.api_key.clone());
                    }
                    core.state.last_error = Some(e.clone());
                }
            }
            ((), true)
        });
    }

    fn is_offline(&self) -> bool {
        self.lock_core().state.is_offline
    }

    fn set_offline(&self, offline: bool, cancel: &CancellationToken) {
        self.mutate(|core| {
            if cancel.is_cancelled() || core.state.is_offline == offline {
                return ((), false);
            }
            core.state.is_offline = offline;
            ((), true)
        });
    }

    /// Sleeps one refresh interval. Returns false when the loop was cancelled.
    ///
    /// A manual refresh restarts the interval; regaining connectivity while
    /// offline ends the sleep early.
    async fn sleep(
        &self,
        cancel: &CancellationToken,
        reachability: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut deadline = Instant::now() + self.config.refresh_interval();
        let mut watching = true;
        reachability.borrow_and_update();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep_until(deadline) => return true,
                _ = self.timer_reset.notified() => {
                    tracing::debug!("Poll timer restarted after manual refresh");
                    deadline = Instant::now() + self.config.refresh_interval();
                }
                changed = reachability.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let reachable = *reachability.borrow_and_update();
                    if !reachable {
                        self.set_offline(true, cancel);
                    } else if self.is_offline() {
                        tracing::debug!("Connectivity restored, polling now");
                        return true;
                    }
                }
            }
        }
    }
}

async fn wait_for_result(mut rx: watch::Receiver<Option<FetchResult>>) -> FetchResult {
    match rx.wait_for(Option::is_some).await {
        Ok(result) => result
            .as_ref()
            .cloned()
            .unwrap_or(Err(FetchError::Unreachable)),
        Err(_) => Err(FetchError::Unreachable),
    }
}

async fn poll_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    tracing::info!("Starting solar telemetry poll loop");
    let mut reachability = inner.connectivity.subscribe();

    loop {
        match inner.dispatch(Trigger::Timer(&cancel)) {
            Dispatch::Started(rx) | Dispatch::Joined(rx) => {
                tokio::select! {
                    _ = wait_for_result(rx) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Dispatch::Skipped(reason) => tracing::debug!("Skipping fetch: {}", reason),
            Dispatch::Cancelled => break,
        }

        if !inner.sleep(&cancel, &mut reachability).await {
            break;
        }
    }

    tracing::info!("Solar telemetry poll loop exiting");
}
