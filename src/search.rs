// src/search.rs
//
// Historical search: filter validation and last-request-wins submission over
// a `SearchBackend`. Results never touch the feed store.

use crate::error::{FeedError, Result};
use crate::event::AlertEvent;
use crate::source::{SearchBackend, SearchQuery};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Filters entered by the viewer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl SearchFilters {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Blank text and no range: submitting this leaves search mode
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.start.is_none() && self.end.is_none()
    }

    /// Build the backend query, rejecting an inverted range
    pub fn to_query(&self, limit: usize) -> Result<SearchQuery> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(FeedError::Search(format!(
                    "start {} is after end {}",
                    start.to_rfc3339(),
                    end.to_rfc3339()
                )));
            }
        }

        let text = self.text.trim();
        Ok(SearchQuery {
            text: (!text.is_empty()).then(|| text.to_string()),
            start: self.start,
            end: self.end,
            limit,
        })
    }
}

/// Result of one submission
#[derive(Debug)]
pub enum SearchOutcome {
    /// The backend answered; `ticket` identifies the submission
    Completed { ticket: u64, results: Vec<AlertEvent> },
    /// The backend or validation failed
    Failed { ticket: u64, error: FeedError },
    /// A newer submission (or a cancel) started while this one was running
    Superseded,
}

/// Thin client over the historical store.
///
/// Every submission takes a ticket; only the newest ticket's answer is
/// reported, so an older response arriving late can never replace a newer
/// one.
pub struct SearchEngine {
    backend: Arc<dyn SearchBackend>,
    limit: usize,
    latest: AtomicU64,
}

impl SearchEngine {
    pub fn new(backend: Arc<dyn SearchBackend>, limit: usize) -> Self {
        Self {
            backend,
            limit,
            latest: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True if no submission or cancel happened after `ticket` was issued
    pub fn is_latest(&self, ticket: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket
    }

    /// Supersede whatever is in flight
    pub fn cancel(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }

    /// Take a ticket, superseding everything issued before it. Take it
    /// before any other await so submissions are ordered by arrival.
    pub fn begin(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// `begin` then `run`
    pub async fn submit(&self, filters: &SearchFilters) -> SearchOutcome {
        let ticket = self.begin();
        self.run(ticket, filters).await
    }

    /// Query the backend under a ticket from `begin`
    pub async fn run(&self, ticket: u64, filters: &SearchFilters) -> SearchOutcome {
        if !self.is_latest(ticket) {
            return SearchOutcome::Superseded;
        }

        let query = match filters.to_query(self.limit) {
            Ok(query) => query,
            Err(error) => return SearchOutcome::Failed { ticket, error },
        };

        debug!("Search #{} submitted: {:?}", ticket, query);
        let outcome = self.backend.search(&query).await;

        if !self.is_latest(ticket) {
            debug!("Search #{} superseded, dropping its response", ticket);
            return SearchOutcome::Superseded;
        }

        match outcome {
            Ok(results) => {
                debug!("Search #{} returned {} rows", ticket, results.len());
                SearchOutcome::Completed { ticket, results }
            }
            Err(error) => {
                warn!("Search #{} failed: {}", ticket, error);
                SearchOutcome::Failed { ticket, error }
            }
        }
    }
}
