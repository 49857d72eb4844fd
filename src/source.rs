// src/source.rs
//
// Request/response collaborators: the recent-alarms pull used for the initial
// load and the polling fallback, historical search, and station name lookup.

use crate::error::{FeedError, Result};
use crate::event::{AlertEvent, StationId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Pull of the most recent alarm events
#[async_trait]
pub trait AlertSource: Send + Sync {
    /// Newest `limit` events, optionally scoped to `stations` server-side
    async fn recent(&self, limit: usize, stations: Option<&BTreeSet<StationId>>) -> Result<Vec<AlertEvent>>;
}

/// Query sent to the historical store
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchQuery {
    /// Free text over message, station name or station id
    pub text: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Historical alarm search
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<AlertEvent>>;
}

/// Station label lookup
#[async_trait]
pub trait StationDirectory: Send + Sync {
    /// Names for the requested stations. Unknown stations are omitted.
    async fn station_names(&self, stations: &[StationId]) -> Result<HashMap<StationId, String>>;
}

/// True if `event` satisfies the text and range parts of `query`.
///
/// Numeric text also matches the station id exactly; text matching is a
/// case-insensitive substring over message and station name. Both range
/// bounds are inclusive.
pub fn matches_query(event: &AlertEvent, query: &SearchQuery) -> bool {
    if let Some(start) = query.start {
        if event.timestamp < start {
            return false;
        }
    }
    if let Some(end) = query.end {
        if event.timestamp > end {
            return false;
        }
    }

    let text = match query.text.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text,
        _ => return true,
    };

    if let Ok(station) = text.parse::<u64>() {
        if event.station_id == StationId(station) {
            return true;
        }
    }

    let needle = text.to_lowercase();
    event.message.to_lowercase().contains(&needle)
        || event
            .station_name
            .as_deref()
            .map_or(false, |name| name.to_lowercase().contains(&needle))
}

// ============================================================================
// IN-MEMORY ARCHIVE
// ============================================================================

/// In-memory alarm archive implementing every request/response collaborator.
///
/// Backs the console's replay mode and the test suite. Failures can be
/// injected per operation.
#[derive(Clone, Default)]
pub struct MemoryArchive {
    inner: Arc<RwLock<ArchiveState>>,
}

#[derive(Default)]
struct ArchiveState {
    events: Vec<AlertEvent>,
    names: HashMap<StationId, String>,
    fail_recent: Option<String>,
    fail_search: Option<String>,
    recent_calls: usize,
    search_calls: usize,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = AlertEvent>) -> Self {
        let archive = Self::new();
        archive.extend(events);
        archive
    }

    pub fn push(&self, event: AlertEvent) {
        self.inner.write().events.push(event);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = AlertEvent>) {
        self.inner.write().events.extend(events);
    }

    pub fn set_station_name(&self, station: StationId, name: impl Into<String>) {
        self.inner.write().names.insert(station, name.into());
    }

    /// Make `recent` fail with `reason` until cleared with `None`
    pub fn fail_recent(&self, reason: Option<&str>) {
        self.inner.write().fail_recent = reason.map(str::to_string);
    }

    /// Make `search` fail with `reason` until cleared with `None`
    pub fn fail_search(&self, reason: Option<&str>) {
        self.inner.write().fail_search = reason.map(str::to_string);
    }

    pub fn recent_calls(&self) -> usize {
        self.inner.read().recent_calls
    }

    pub fn search_calls(&self) -> usize {
        self.inner.read().search_calls
    }
}

#[async_trait]
impl AlertSource for MemoryArchive {
    async fn recent(&self, limit: usize, stations: Option<&BTreeSet<StationId>>) -> Result<Vec<AlertEvent>> {
        let mut state = self.inner.write();
        state.recent_calls += 1;
        if let Some(reason) = &state.fail_recent {
            return Err(FeedError::Pull(reason.clone()));
        }

        let mut events: Vec<AlertEvent> = state
            .events
            .iter()
            .filter(|e| stations.map_or(true, |s| s.contains(&e.station_id)))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait]
impl SearchBackend for MemoryArchive {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<AlertEvent>> {
        let mut state = self.inner.write();
        state.search_calls += 1;
        if let Some(reason) = &state.fail_search {
            return Err(FeedError::Search(reason.clone()));
        }

        let names = &state.names;
        let mut results: Vec<AlertEvent> = state
            .events
            .iter()
            .map(|e| {
                let mut event = e.clone();
                if event.station_name.is_none() {
                    event.station_name = names.get(&event.station_id).cloned();
                }
                event
            })
            .filter(|e| matches_query(e, query))
            .collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        results.truncate(query.limit);
        Ok(results)
    }
}

#[async_trait]
impl StationDirectory for MemoryArchive {
    async fn station_names(&self, stations: &[StationId]) -> Result<HashMap<StationId, String>> {
        let state = self.inner.read();
        Ok(stations
            .iter()
            .filter_map(|id| state.names.get(id).map(|name| (*id, name.clone())))
            .collect())
    }
}
