// src/health.rs - Push channel health state machine
//
// Tracks the live channel through Connecting -> Subscribed -> Degraded/Failed
// and decides when the polling fallback starts and stops. Pure state: the
// caller owns the clock and the timers, which keeps every transition testable
// without a runtime.
//
// Two recovery signals are tracked separately:
// - `warning` is the viewer-facing message; any fresh data clears it
// - `fallback_active` stops only when the channel confirms a subscription

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// STATES
// ============================================================================

/// Lifecycle of the push subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Subscription requested, confirmation pending
    Connecting,
    /// Subscription confirmed and delivering
    Subscribed,
    /// Subscribed but silent past the idle window
    Degraded,
    /// Timed out, errored or closed
    Failed,
}

/// Feed health as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveHealth {
    Healthy,
    Degraded,
    Failed,
}

/// Why the channel left the healthy path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// No subscription confirmation within the bounded window
    SubscriptionTimeout,
    /// Explicit error from the channel
    SubscriptionError(String),
    /// Channel closed by the remote end
    Closed,
    /// No inbound traffic within the idle window
    Idle,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::SubscriptionTimeout => write!(f, "live updates did not connect in time"),
            FailureCause::SubscriptionError(reason) => write!(f, "live updates failed: {}", reason),
            FailureCause::Closed => write!(f, "live updates connection closed"),
            FailureCause::Idle => write!(f, "live updates went quiet"),
        }
    }
}

/// What the caller must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    StartFallback,
    StopFallback,
}

// ============================================================================
// HEALTH MONITOR
// ============================================================================

/// Snapshot of monitor state for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub channel: ChannelState,
    pub live_health: LiveHealth,
    pub fallback_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub connect_attempts: u32,
}

/// Push channel health state machine
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: ChannelState,
    live_health: LiveHealth,
    subscribe_timeout: Duration,
    idle_timeout: Option<Duration>,
    connect_deadline: Option<Instant>,
    last_activity: Option<Instant>,
    fallback_active: bool,
    warning: Option<String>,
    connect_attempts: u32,
}

impl HealthMonitor {
    pub fn new(subscribe_timeout: Duration, idle_timeout: Option<Duration>) -> Self {
        Self {
            state: ChannelState::Connecting,
            live_health: LiveHealth::Healthy,
            subscribe_timeout,
            idle_timeout,
            connect_deadline: None,
            last_activity: None,
            fallback_active: false,
            warning: None,
            connect_attempts: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn live_health(&self) -> LiveHealth {
        self.live_health
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_active
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            channel: self.state,
            live_health: self.live_health,
            fallback_active: self.fallback_active,
            warning: self.warning.clone(),
            connect_attempts: self.connect_attempts,
        }
    }

    /// A (re)subscription attempt starts; the bounded wait restarts.
    ///
    /// Health and fallback are left as they are: a reconnect after a failure
    /// keeps polling until the new subscription is confirmed.
    pub fn begin_connect(&mut self, now: Instant) {
        self.state = ChannelState::Connecting;
        self.connect_deadline = Some(now + self.subscribe_timeout);
        self.connect_attempts += 1;
        debug!(
            "Live channel connecting (attempt {}, timeout {:?})",
            self.connect_attempts, self.subscribe_timeout
        );
    }

    /// The channel confirmed the subscription
    pub fn on_subscribed(&mut self, now: Instant) -> HealthAction {
        if self.state != ChannelState::Subscribed {
            info!("Live channel subscribed (attempt {})", self.connect_attempts);
        }
        self.state = ChannelState::Subscribed;
        self.live_health = LiveHealth::Healthy;
        self.connect_deadline = None;
        self.last_activity = Some(now);
        self.warning = None;

        if self.fallback_active {
            self.fallback_active = false;
            info!("Live channel recovered, stopping polling fallback");
            HealthAction::StopFallback
        } else {
            HealthAction::None
        }
    }

    /// An inbound mutation arrived. Resets liveness, never the connection.
    pub fn on_activity(&mut self, now: Instant) -> HealthAction {
        self.last_activity = Some(now);
        if self.state == ChannelState::Degraded {
            // Traffic resumed on the same subscription
            return self.on_subscribed(now);
        }
        HealthAction::None
    }

    /// Explicit error, close or timeout. Idempotent: a second failure while
    /// the fallback already runs does not restart it.
    pub fn on_failure(&mut self, cause: FailureCause) -> HealthAction {
        let degraded_only = cause == FailureCause::Idle;
        if degraded_only {
            self.state = ChannelState::Degraded;
            self.live_health = LiveHealth::Degraded;
        } else {
            self.state = ChannelState::Failed;
            self.live_health = LiveHealth::Failed;
            self.connect_deadline = None;
        }
        self.warning = Some(format!("{}; refreshing periodically", cause));

        if self.fallback_active {
            debug!("Live channel failure while fallback already active: {}", cause);
            HealthAction::None
        } else {
            warn!("Live channel unhealthy ({}), starting polling fallback", cause);
            self.fallback_active = true;
            HealthAction::StartFallback
        }
    }

    /// Fire whichever deadline has passed
    pub fn on_timer(&mut self, now: Instant) -> HealthAction {
        if let Some(deadline) = self.connect_deadline {
            if self.state == ChannelState::Connecting && now >= deadline {
                self.connect_deadline = None;
                return self.on_failure(FailureCause::SubscriptionTimeout);
            }
        }
        if let Some(idle_deadline) = self.idle_deadline() {
            if now >= idle_deadline {
                return self.on_failure(FailureCause::Idle);
            }
        }
        HealthAction::None
    }

    /// Next instant at which [`on_timer`](Self::on_timer) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ChannelState::Connecting => self.connect_deadline,
            ChannelState::Subscribed => self.idle_deadline(),
            ChannelState::Degraded | ChannelState::Failed => None,
        }
    }

    /// Fresh data reached the feed (from any path). Clears the warning only.
    pub fn on_fresh_data(&mut self) {
        if self.warning.take().is_some() {
            debug!("Fresh data received, clearing feed warning");
        }
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if self.state != ChannelState::Subscribed {
            return None;
        }
        match (self.idle_timeout, self.last_activity) {
            (Some(window), Some(last)) => Some(last + window),
            _ => None,
        }
    }
}
