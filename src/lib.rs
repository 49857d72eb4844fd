//! ALARMFEED - Live SCADA alarm feed
//!
//! Keeps a bounded, ordered, deduplicated view of equipment alarms for one
//! operator session. Updates arrive over a push channel; when the channel
//! stalls or fails the feed falls back to periodic polling. Every event is
//! filtered against the viewer's authorized stations before it reaches the
//! feed. A historical search mode queries the alarm archive directly.
//!
//! # Example
//!
//! ```rust,no_run
//! use alarmfeed::{Collaborators, Config, MemoryArchive, MemoryPushSource, StaticResolver};
//! use alarmfeed::{AuthorizationScope, ViewController, ViewerIdentity};
//! use std::sync::Arc;
//!
//! # async fn run() -> alarmfeed::Result<()> {
//! alarmfeed::init();
//!
//! let archive = MemoryArchive::new();
//! let collaborators = Collaborators {
//!     resolver: Arc::new(StaticResolver::new(AuthorizationScope::admin())),
//!     alerts: Arc::new(archive.clone()),
//!     push: Arc::new(MemoryPushSource::new()),
//!     search: Arc::new(archive.clone()),
//!     stations: Some(Arc::new(archive)),
//! };
//!
//! let controller = ViewController::new(Config::default(), collaborators, ViewerIdentity::new("operator"))?;
//! controller.enter_live_mode().await;
//! println!("{} rows", controller.view().rows.len());
//! controller.teardown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error taxonomy shared by every module
pub mod error;

/// YAML configuration
pub mod config;

/// Alarm events and push mutations
pub mod event;

/// Viewer identity and authorization scope
pub mod scope;

/// Bounded, ordered, deduplicated feed store
pub mod store;

/// Push channel health state machine
pub mod health;

/// Push subscriptions
pub mod channel;

/// Pull, search and station-name collaborators
pub mod source;

/// Historical search
pub mod search;

/// Delimited export
pub mod export;

/// Session orchestration
pub mod controller;

/// HTTP implementations of the collaborators
pub mod http;

// ============================================================================
// PUBLIC API EXPORTS
// ============================================================================

pub use channel::{ChannelFilter, ChannelSignal, MemoryPushSource, PushSource, Subscription};
pub use config::Config;
pub use controller::{Collaborators, FeedView, ViewController, ViewMode};
pub use error::{FeedError, Result};
pub use event::{AlertEvent, EventId, LiveMutation, MutationKind, Priority, Severity, StationId};
pub use export::Exporter;
pub use health::{ChannelState, FailureCause, HealthAction, HealthMonitor, LiveHealth};
pub use http::{HttpBackend, HttpPushSource};
pub use scope::{AuthorizationResolver, AuthorizationScope, StaticResolver, ViewerIdentity};
pub use search::{SearchEngine, SearchFilters, SearchOutcome};
pub use source::{AlertSource, MemoryArchive, SearchBackend, SearchQuery, StationDirectory};
pub use store::FeedStore;

// ============================================================================
// VERSION AND BUILD INFORMATION
// ============================================================================

/// Current alarmfeed version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub mod build_info {
    /// Git commit hash (if available)
    pub const GIT_HASH: Option<&str> = option_env!("ALARMFEED_GIT_HASH");

    /// Build timestamp
    pub const BUILD_TIMESTAMP: Option<&str> = option_env!("ALARMFEED_BUILD_TIMESTAMP");

    /// Rust version used for compilation
    pub const RUSTC_VERSION: Option<&str> = option_env!("ALARMFEED_RUSTC_VERSION");

    /// Target triple
    pub const TARGET: Option<&str> = option_env!("ALARMFEED_TARGET");

    /// Build profile (debug/release)
    pub const PROFILE: Option<&str> = option_env!("ALARMFEED_PROFILE");

    /// One-line summary for startup logs
    pub fn summary() -> String {
        format!(
            "alarmfeed {} ({}, {} {}, built {})",
            super::VERSION,
            GIT_HASH.unwrap_or("unknown"),
            TARGET.unwrap_or("unknown"),
            PROFILE.unwrap_or("unknown"),
            BUILD_TIMESTAMP.unwrap_or("unknown"),
        )
    }
}

// ============================================================================
// INITIALIZATION
// ============================================================================

/// Install the tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `alarmfeed=info`. Safe to call more than
/// once; later calls are no-ops.
pub fn init() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("alarmfeed=info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    if subscriber.try_init().is_err() {
        // Already initialized
    }
}
