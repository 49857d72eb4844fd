// src/controller.rs - View controller: mode state and sole feed store writer
//
// Owns the session's authorization scope, the live feed store, the push
// channel pump and the polling fallback, and the historical search state.
// Every write to the feed store goes through `Shared` under the feed lock, so
// push mutations, poll batches and explicit refreshes never interleave.
//
// Background work runs in two tokio tasks per live session:
// - the pump follows the push subscription and drives the health timer
// - the poller refreshes the feed while the channel is unhealthy
// Both read the scope from shared state at the moment they apply data.

use crate::channel::{ChannelFilter, ChannelSignal, PushSource};
use crate::config::Config;
use crate::error::Result;
use crate::event::{AlertEvent, LiveMutation, StationId};
use crate::export::Exporter;
use crate::health::{ChannelState, FailureCause, HealthAction, HealthMonitor, LiveHealth};
use crate::scope::{resolve_or_restrict, AuthorizationResolver, AuthorizationScope, ViewerIdentity};
use crate::search::{SearchEngine, SearchFilters, SearchOutcome};
use crate::source::{AlertSource, SearchBackend, StationDirectory};
use crate::store::FeedStore;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// External services the controller talks to
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn AuthorizationResolver>,
    pub alerts: Arc<dyn AlertSource>,
    pub push: Arc<dyn PushSource>,
    pub search: Arc<dyn SearchBackend>,
    pub stations: Option<Arc<dyn StationDirectory>>,
}

/// Which result set the presentation layer renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    Live,
    Search,
}

/// Everything the presentation layer needs for one render
#[derive(Debug, Clone, Serialize)]
pub struct FeedView {
    pub source: ViewMode,
    pub rows: Vec<AlertEvent>,
    pub live_health: LiveHealth,
    pub channel_state: ChannelState,
    pub fallback_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_filters: Option<SearchFilters>,
    pub search_pending: bool,
    pub revision: u64,
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct FeedState {
    store: Option<FeedStore>,
    /// Bumped by every write; a pull started under an older epoch is stale
    epoch: u64,
    pull_error: Option<String>,
}

#[derive(Default)]
struct SearchState {
    filters: Option<SearchFilters>,
    results: Vec<AlertEvent>,
    error: Option<String>,
    pending: bool,
}

#[derive(Default)]
struct LiveTasks {
    pump: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

struct Shared {
    config: Config,
    collaborators: Collaborators,
    viewer: RwLock<ViewerIdentity>,
    scope: RwLock<Option<Arc<AuthorizationScope>>>,
    /// Held across the resolver call so a session resolves once
    scope_gate: tokio::sync::Mutex<()>,
    mode: RwLock<ViewMode>,
    feed: Mutex<FeedState>,
    health: Mutex<HealthMonitor>,
    search: Mutex<SearchState>,
    search_engine: SearchEngine,
    station_names: DashMap<StationId, String>,
    tasks: Mutex<LiveTasks>,
    /// Live session generation; bumped on teardown so late async work from
    /// an older session is dropped
    generation: AtomicU64,
    revision: AtomicU64,
    changes: watch::Sender<u64>,
}

impl Shared {
    fn new_monitor(config: &Config) -> HealthMonitor {
        HealthMonitor::new(config.health.subscribe_timeout(), config.health.idle_timeout())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn current_scope(&self) -> Option<Arc<AuthorizationScope>> {
        self.scope.read().clone()
    }

    /// Record a visible state change
    fn touch(&self) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.changes.send_replace(revision);
    }

    fn channel_filter(&self) -> ChannelFilter {
        let stations = self
            .current_scope()
            .and_then(|scope| scope.station_hint().cloned());
        ChannelFilter::new(self.config.api.topic.clone(), stations)
    }

    fn cached_name(&self, event: &mut AlertEvent) {
        if event.station_name.is_none() {
            if let Some(name) = self.station_names.get(&event.station_id) {
                event.station_name = Some(name.value().clone());
            }
        }
    }

    /// Scope-filter and apply one push mutation
    fn apply_mutation(&self, mutation: LiveMutation) -> bool {
        let scope = match self.current_scope() {
            Some(scope) => scope,
            None => {
                trace!("No scope resolved, dropping {} for event {}", mutation.kind(), mutation.id());
                return false;
            }
        };
        if !scope.admits_mutation(&mutation) {
            trace!(
                "Dropping {} for event {} outside viewer scope",
                mutation.kind(),
                mutation.id()
            );
            return false;
        }

        let kind = mutation.kind();
        let id = mutation.id();
        let changed = {
            let mut feed = self.feed.lock();
            let store = match feed.store.as_mut() {
                Some(store) => store,
                None => return false,
            };
            let changed = match mutation {
                LiveMutation::Insert(mut event) => {
                    self.cached_name(&mut event);
                    store.insert(event)
                }
                LiveMutation::Update(mut event) => {
                    self.cached_name(&mut event);
                    store.apply_update(event)
                }
                LiveMutation::Delete { id, .. } => store.apply_delete(id),
            };
            feed.epoch += 1;
            changed
        };

        debug!("Applied live {} for event {} (changed: {})", kind, id, changed);
        self.health.lock().on_fresh_data();
        self.touch();
        changed
    }

    /// Full pull plus replace. Dropped if the live session changed or any
    /// other write landed while the pull was in flight.
    async fn pull_and_replace(&self, origin: &str) -> bool {
        let generation = self.generation();
        let scope = match self.current_scope() {
            Some(scope) => scope,
            None => return false,
        };
        let epoch = {
            let feed = self.feed.lock();
            if feed.store.is_none() {
                return false;
            }
            feed.epoch
        };

        let pulled = self
            .collaborators
            .alerts
            .recent(self.config.pull_limit(), scope.station_hint())
            .await;

        if !self.is_current(generation) {
            debug!("Discarding {} pull from a torn down session", origin);
            return false;
        }

        let applied = {
            let mut feed = self.feed.lock();
            if feed.epoch != epoch {
                debug!("Discarding stale {} pull, feed changed while it was in flight", origin);
                return false;
            }
            match pulled {
                Ok(events) => {
                    let scope = self.current_scope().unwrap_or(scope);
                    let mut events = scope.filter(events);
                    events.iter_mut().for_each(|e| self.cached_name(e));
                    let count = events.len();
                    if let Some(store) = feed.store.as_mut() {
                        store.replace_all(events);
                    }
                    feed.epoch += 1;
                    feed.pull_error = None;
                    debug!("{} pull replaced feed with {} events", origin, count);
                    true
                }
                Err(e) => {
                    warn!("{} pull failed: {}", origin, e);
                    feed.pull_error = Some(e.to_string());
                    false
                }
            }
        };

        if applied {
            self.health.lock().on_fresh_data();
        }
        self.touch();
        applied
    }

    async fn poll_tick(&self) -> bool {
        let healthy = self.health.lock().live_health() == LiveHealth::Healthy;
        if healthy {
            trace!("Poll tick skipped, live channel healthy");
            return false;
        }
        self.pull_and_replace("poll").await
    }

    fn on_subscribed(self: &Arc<Self>) {
        let action = self.health.lock().on_subscribed(Instant::now());
        // Any poll still in flight predates the subscription
        self.feed.lock().epoch += 1;
        self.handle_action(action);
        self.touch();
    }

    fn on_health<F>(self: &Arc<Self>, transition: F)
    where
        F: FnOnce(&mut HealthMonitor) -> HealthAction,
    {
        let action = {
            let mut health = self.health.lock();
            transition(&mut *health)
        };
        self.handle_action(action);
        self.touch();
    }

    fn handle_action(self: &Arc<Self>, action: HealthAction) {
        match action {
            HealthAction::None => {}
            HealthAction::StartFallback => self.start_poller(),
            HealthAction::StopFallback => self.stop_poller(),
        }
    }

    fn start_poller(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        let generation = self.generation();
        if tasks.poller.is_some() {
            return;
        }
        if tasks.pump.is_none() {
            debug!("Not starting polling fallback, live channel is not running");
            return;
        }
        info!(
            "Polling fallback started (every {:?})",
            self.config.polling.interval()
        );
        tasks.poller = Some(tokio::spawn(run_poller(self.clone(), generation)));
    }

    fn stop_poller(&self) {
        if let Some(poller) = self.tasks.lock().poller.take() {
            poller.abort();
            info!("Polling fallback stopped");
        }
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Follow the push channel, resubscribing after errors and closes
async fn run_live_channel(shared: Arc<Shared>, generation: u64) {
    let reconnect_delay = shared.config.health.reconnect_delay();

    while shared.is_current(generation) {
        shared.on_health(|h| {
            h.begin_connect(Instant::now());
            HealthAction::None
        });

        let filter = shared.channel_filter();
        let mut subscription = match shared.collaborators.push.subscribe(&filter).await {
            Ok(subscription) => subscription,
            Err(e) => {
                shared.on_health(|h| h.on_failure(FailureCause::SubscriptionError(e.to_string())));
                sleep(reconnect_delay).await;
                continue;
            }
        };
        debug!("Live subscription {} opened on '{}'", subscription.id(), filter.topic);

        let cause = loop {
            let deadline = shared.health.lock().next_deadline();
            tokio::select! {
                signal = subscription.next() => match signal {
                    Some(ChannelSignal::Subscribed) => shared.on_subscribed(),
                    Some(ChannelSignal::Mutation(mutation)) => {
                        shared.on_health(|h| h.on_activity(Instant::now()));
                        shared.apply_mutation(mutation);
                    }
                    Some(ChannelSignal::Error(reason)) => break FailureCause::SubscriptionError(reason),
                    Some(ChannelSignal::Closed) | None => break FailureCause::Closed,
                },
                _ = wait_until(deadline) => {
                    shared.on_health(|h| h.on_timer(Instant::now()));
                }
            }
        };

        drop(subscription);
        shared.on_health(|h| h.on_failure(cause));
        sleep(reconnect_delay).await;
    }
}

/// Refresh the feed on a fixed interval while the channel is unhealthy
async fn run_poller(shared: Arc<Shared>, generation: u64) {
    let period = shared.config.polling.interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !shared.is_current(generation) {
            return;
        }
        shared.poll_tick().await;
    }
}

// ============================================================================
// VIEW CONTROLLER
// ============================================================================

/// Orchestrates one viewer session
pub struct ViewController {
    shared: Arc<Shared>,
    exporter: Exporter,
}

impl ViewController {
    pub fn new(config: Config, collaborators: Collaborators, viewer: ViewerIdentity) -> Result<Self> {
        config.validate()?;
        let exporter = Exporter::from_config(&config.export)?;
        let search_engine = SearchEngine::new(collaborators.search.clone(), config.search.limit);
        let (changes, _) = watch::channel(0);

        Ok(Self {
            shared: Arc::new(Shared {
                health: Mutex::new(Shared::new_monitor(&config)),
                feed: Mutex::new(FeedState {
                    store: None,
                    epoch: 0,
                    pull_error: None,
                }),
                config,
                collaborators,
                viewer: RwLock::new(viewer),
                scope: RwLock::new(None),
                scope_gate: tokio::sync::Mutex::new(()),
                mode: RwLock::new(ViewMode::Live),
                search: Mutex::new(SearchState::default()),
                search_engine,
                station_names: DashMap::new(),
                tasks: Mutex::new(LiveTasks::default()),
                generation: AtomicU64::new(0),
                revision: AtomicU64::new(0),
                changes,
            }),
            exporter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn viewer(&self) -> ViewerIdentity {
        self.shared.viewer.read().clone()
    }

    pub fn mode(&self) -> ViewMode {
        *self.shared.mode.read()
    }

    /// Cached scope, if resolved
    pub fn scope(&self) -> Option<Arc<AuthorizationScope>> {
        self.shared.current_scope()
    }

    /// Receives the view revision after every visible change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// True while the push pump runs
    pub fn is_live(&self) -> bool {
        self.shared.tasks.lock().pump.is_some()
    }

    /// Resolve the scope once per session
    async fn ensure_scope(&self) -> Arc<AuthorizationScope> {
        if let Some(scope) = self.shared.current_scope() {
            return scope;
        }
        let _gate = self.shared.scope_gate.lock().await;
        if let Some(scope) = self.shared.current_scope() {
            return scope;
        }
        let generation = self.shared.generation();
        let viewer = self.viewer();
        let scope = resolve_or_restrict(self.shared.collaborators.resolver.as_ref(), &viewer).await;

        let mut cached = self.shared.scope.write();
        if let Some(existing) = cached.as_ref() {
            return existing.clone();
        }
        if !self.shared.is_current(generation) {
            // Viewer switched while resolving; use the answer once, do not cache it
            return scope;
        }

        if scope.is_admin {
            info!("Resolved scope for '{}': admin", viewer.user);
        } else {
            info!(
                "Resolved scope for '{}': {} stations",
                viewer.user,
                scope.allowed_station_ids.len()
            );
        }
        *cached = Some(scope.clone());
        scope
    }

    // ------------------------------------------------------------------------
    // Live mode
    // ------------------------------------------------------------------------

    /// Resolve the scope, load the feed and start the push channel.
    ///
    /// A failed initial pull leaves an empty feed with `pull_error` set; the
    /// channel still starts and `refresh` retries. Calling this while the
    /// channel already runs only switches the rendered source back to live.
    pub async fn enter_live_mode(&self) {
        let shared = &self.shared;
        if self.mode() == ViewMode::Search {
            self.clear_search();
        }
        if self.is_live() {
            return;
        }

        let generation = shared.generation();
        let scope = self.ensure_scope().await;
        let pulled = shared
            .collaborators
            .alerts
            .recent(shared.config.pull_limit(), scope.station_hint())
            .await;

        if !shared.is_current(generation) {
            debug!("Live mode entry superseded by teardown");
            return;
        }

        {
            let mut feed = shared.feed.lock();
            let capacity = shared.config.feed.capacity;
            let store = feed.store.get_or_insert_with(|| FeedStore::new(capacity));
            match pulled {
                Ok(events) => {
                    let mut events = scope.filter(events);
                    events.iter_mut().for_each(|e| shared.cached_name(e));
                    store.replace_all(events);
                    info!("Initial pull loaded {} events", store.len());
                    feed.pull_error = None;
                }
                Err(e) => {
                    warn!("Initial pull failed: {}", e);
                    feed.pull_error = Some(e.to_string());
                }
            }
            feed.epoch += 1;
        }

        {
            let mut tasks = shared.tasks.lock();
            if !shared.is_current(generation) || tasks.pump.is_some() {
                return;
            }
            *shared.mode.write() = ViewMode::Live;
            tasks.pump = Some(tokio::spawn(run_live_channel(shared.clone(), generation)));
        }
        shared.touch();
    }

    /// Apply one candidate mutation. Returns `true` if the feed changed.
    pub fn on_live_mutation(&self, mutation: LiveMutation) -> bool {
        self.shared.apply_mutation(mutation)
    }

    /// Polling fallback tick. Acts only while the live channel is unhealthy;
    /// returns `true` if the feed was replaced.
    pub async fn on_poll_tick(&self) -> bool {
        self.shared.poll_tick().await
    }

    /// Explicit full refresh, regardless of channel health
    pub async fn refresh(&self) -> bool {
        self.shared.pull_and_replace("refresh").await
    }

    /// Release the subscription and cancel the health and poll timers.
    /// Idempotent; the feed store and cached scope are kept.
    pub async fn teardown(&self) {
        let (pump, poller) = self.release_tasks();
        if pump.is_none() && poller.is_none() {
            trace!("Teardown with nothing running");
            return;
        }
        for handle in [pump, poller].into_iter().flatten() {
            // Resolves once the task and its subscription are dropped
            let _ = handle.await;
        }
        info!("Live channel torn down");
        self.shared.touch();
    }

    fn release_tasks(&self) -> (Option<JoinHandle<()>>, Option<JoinHandle<()>>) {
        let shared = &self.shared;
        shared.generation.fetch_add(1, Ordering::SeqCst);
        shared.search_engine.cancel();
        let (pump, poller) = {
            let mut tasks = shared.tasks.lock();
            (tasks.pump.take(), tasks.poller.take())
        };
        for handle in [&pump, &poller].into_iter().flatten() {
            handle.abort();
        }
        *shared.health.lock() = Shared::new_monitor(&shared.config);
        (pump, poller)
    }

    /// Authorization context change: tear down, then discard the scope, the
    /// feed store and any search state. The next `enter_live_mode` resolves
    /// the new viewer's scope.
    pub async fn switch_viewer(&self, viewer: ViewerIdentity) {
        self.teardown().await;
        let shared = &self.shared;
        info!("Switching viewer to '{}'", viewer.user);
        *shared.viewer.write() = viewer;
        *shared.scope.write() = None;
        {
            let mut feed = shared.feed.lock();
            feed.store = None;
            feed.pull_error = None;
            feed.epoch += 1;
        }
        *shared.search.lock() = SearchState::default();
        *shared.mode.write() = ViewMode::Live;
        shared.touch();
    }

    // ------------------------------------------------------------------------
    // Search mode
    // ------------------------------------------------------------------------

    /// Run a historical search and render its results.
    ///
    /// Empty filters leave search mode instead. Returns the number of rows
    /// shown when this submission's answer was applied, `None` if it failed
    /// or was superseded by a newer submission.
    pub async fn enter_search_mode(&self, filters: SearchFilters) -> Option<usize> {
        if filters.is_empty() {
            self.clear_search();
            return None;
        }

        let shared = &self.shared;
        let ticket = {
            let mut search = shared.search.lock();
            let ticket = shared.search_engine.begin();
            search.filters = Some(filters.clone());
            search.results.clear();
            search.error = None;
            search.pending = true;
            ticket
        };
        *shared.mode.write() = ViewMode::Search;
        shared.touch();

        let scope = if shared.config.search.apply_scope {
            Some(self.ensure_scope().await)
        } else {
            None
        };
        if !shared.search_engine.is_latest(ticket) {
            debug!("Search #{} superseded while resolving scope", ticket);
            return None;
        }

        match shared.search_engine.run(ticket, &filters).await {
            SearchOutcome::Completed { ticket, results } => {
                for event in &results {
                    if let Some(name) = &event.station_name {
                        shared.station_names.insert(event.station_id, name.clone());
                    }
                }
                let mut results = match scope {
                    Some(scope) => scope.filter(results),
                    None => results,
                };
                results.iter_mut().for_each(|e| shared.cached_name(e));

                let count = results.len();
                {
                    let mut search = shared.search.lock();
                    if !shared.search_engine.is_latest(ticket) {
                        return None;
                    }
                    search.results = results;
                    search.pending = false;
                }
                info!("Search returned {} rows", count);
                shared.touch();
                Some(count)
            }
            SearchOutcome::Failed { ticket, error } => {
                {
                    let mut search = shared.search.lock();
                    if !shared.search_engine.is_latest(ticket) {
                        return None;
                    }
                    search.error = Some(error.to_string());
                    search.pending = false;
                }
                shared.touch();
                None
            }
            SearchOutcome::Superseded => None,
        }
    }

    /// Leave search mode. The live feed renders as it is; nothing is fetched.
    pub fn clear_search(&self) {
        let shared = &self.shared;
        shared.search_engine.cancel();
        *shared.search.lock() = SearchState::default();
        *shared.mode.write() = ViewMode::Live;
        debug!("Search cleared, rendering live feed");
        shared.touch();
    }

    // ------------------------------------------------------------------------
    // Presentation
    // ------------------------------------------------------------------------

    pub fn view(&self) -> FeedView {
        let shared = &self.shared;
        let source = self.mode();
        let health = shared.health.lock().snapshot();
        let (live_rows, pull_error) = {
            let feed = shared.feed.lock();
            let rows = feed
                .store
                .as_ref()
                .map(|store| store.view(shared.config.feed.view_limit))
                .unwrap_or_default();
            (rows, feed.pull_error.clone())
        };
        let search = shared.search.lock();

        FeedView {
            source,
            rows: match source {
                ViewMode::Live => live_rows,
                ViewMode::Search => search.results.clone(),
            },
            live_health: health.live_health,
            channel_state: health.channel,
            fallback_active: health.fallback_active,
            warning: health.warning,
            pull_error,
            search_error: search.error.clone(),
            search_filters: search.filters.clone(),
            search_pending: search.pending,
            revision: shared.revision.load(Ordering::SeqCst),
        }
    }

    /// Full ordered feed store contents (not truncated to the view limit)
    pub fn live_snapshot(&self) -> Vec<AlertEvent> {
        self.shared
            .feed
            .lock()
            .store
            .as_ref()
            .map(FeedStore::snapshot)
            .unwrap_or_default()
    }

    /// Write the currently displayed rows as delimited text
    pub fn export<W: Write>(&self, writer: W) -> Result<usize> {
        self.exporter.write(&self.view().rows, writer)
    }

    /// Look up missing station names for visible rows and fill them in.
    /// Returns the number of newly resolved stations.
    pub async fn resolve_station_names(&self) -> usize {
        let shared = &self.shared;
        let directory = match &shared.collaborators.stations {
            Some(directory) => directory.clone(),
            None => return 0,
        };

        let missing: Vec<StationId> = self
            .view()
            .rows
            .iter()
            .map(|e| e.station_id)
            .filter(|id| !shared.station_names.contains_key(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let names = match directory.station_names(&missing).await {
            Ok(names) => names,
            Err(e) => {
                warn!("Station name lookup failed: {}", e);
                return 0;
            }
        };
        let resolved = names.len();
        for (id, name) in names {
            shared.station_names.insert(id, name);
        }

        if let Some(store) = shared.feed.lock().store.as_mut() {
            store.for_each_mut(|e| shared.cached_name(e));
        }
        shared
            .search
            .lock()
            .results
            .iter_mut()
            .for_each(|e| shared.cached_name(e));

        debug!("Resolved {} of {} station names", resolved, missing.len());
        shared.touch();
        resolved
    }
}

impl Drop for ViewController {
    fn drop(&mut self) {
        // Tasks hold the shared state; abort them so nothing outlives the session
        let _ = self.release_tasks();
    }
}
