// src/channel.rs
//
// Push delivery of alarm mutations. A `PushSource` hands out subscriptions;
// each subscription is a stream of `ChannelSignal`s. Dropping the
// `Subscription` releases it.

use crate::error::Result;
use crate::event::{LiveMutation, StationId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// Buffered signals per subscription before the producer waits
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Everything a push subscription can report
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// Server confirmed the subscription
    Subscribed,
    /// An alarm row changed
    Mutation(LiveMutation),
    /// Channel reported an error; the subscription is unusable
    Error(String),
    /// Channel closed cleanly by the remote end
    Closed,
}

/// Server-side scoping hint for a subscription
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelFilter {
    /// Table or topic to follow
    pub topic: String,
    /// Stations to follow; `None` follows everything
    pub stations: Option<BTreeSet<StationId>>,
}

impl ChannelFilter {
    pub fn new(topic: impl Into<String>, stations: Option<BTreeSet<StationId>>) -> Self {
        Self {
            topic: topic.into(),
            stations,
        }
    }
}

/// A live subscription. Receives signals until dropped or closed.
pub struct Subscription {
    id: Uuid,
    signals: mpsc::Receiver<ChannelSignal>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(signals: mpsc::Receiver<ChannelSignal>) -> Self {
        Self {
            id: Uuid::new_v4(),
            signals,
            worker: None,
        }
    }

    /// Attach the task producing this subscription's signals. It is aborted
    /// when the subscription is dropped.
    pub fn with_worker(mut self, worker: JoinHandle<()>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next signal; `None` once the producer is gone
    pub async fn next(&mut self) -> Option<ChannelSignal> {
        self.signals.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.signals.close();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        trace!("Subscription {} released", self.id);
    }
}

/// Source of push subscriptions
#[async_trait]
pub trait PushSource: Send + Sync {
    /// Open a subscription. Confirmation arrives later as
    /// [`ChannelSignal::Subscribed`].
    async fn subscribe(&self, filter: &ChannelFilter) -> Result<Subscription>;
}

// ============================================================================
// IN-MEMORY PUSH SOURCE
// ============================================================================

/// Push source fed by hand. Used by the console's replay mode and by tests.
#[derive(Clone, Default)]
pub struct MemoryPushSource {
    subscribers: Arc<Mutex<HashMap<Uuid, Subscriber>>>,
}

struct Subscriber {
    filter: ChannelFilter,
    tx: mpsc::Sender<ChannelSignal>,
}

impl MemoryPushSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a signal to every open subscription whose filter matches.
    /// Mutations are scoped by the subscription's station hint; other
    /// signals go to everyone. Returns the number of receivers.
    pub fn publish(&self, signal: ChannelSignal) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, s| !s.tx.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.values() {
            if let ChannelSignal::Mutation(mutation) = &signal {
                let in_scope = match (&subscriber.filter.stations, mutation.station_id()) {
                    (Some(stations), Some(station)) => stations.contains(&station),
                    _ => true,
                };
                if !in_scope {
                    continue;
                }
            }
            if subscriber.tx.try_send(signal.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of subscriptions still held by a consumer
    pub fn active_subscriptions(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Filters of the open subscriptions
    pub fn active_filters(&self) -> Vec<ChannelFilter> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, s| !s.tx.is_closed());
        subscribers.values().map(|s| s.filter.clone()).collect()
    }
}

#[async_trait]
impl PushSource for MemoryPushSource {
    async fn subscribe(&self, filter: &ChannelFilter) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let subscription = Subscription::new(rx);
        debug!("Memory subscription {} on '{}'", subscription.id(), filter.topic);
        self.subscribers.lock().insert(
            subscription.id(),
            Subscriber {
                filter: filter.clone(),
                tx,
            },
        );
        Ok(subscription)
    }
}
