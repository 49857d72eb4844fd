// src/scope.rs
//
// Per-viewer authorization scope. Resolved once per session, never mutated,
// shared read-only by every filtering decision.

use crate::error::Result;
use crate::event::{AlertEvent, LiveMutation, StationId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Identity of the viewer a session is opened for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewerIdentity {
    /// Login or user id as known to the authorization service
    pub user: String,
    /// Bearer token forwarded to the authorization service, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ViewerIdentity {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// The set of stations a viewer may see, or everything for administrators
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorizationScope {
    pub is_admin: bool,
    pub allowed_station_ids: BTreeSet<StationId>,
}

impl AuthorizationScope {
    /// Scope that admits every station
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            allowed_station_ids: BTreeSet::new(),
        }
    }

    /// Scope limited to the given stations
    pub fn restricted(stations: impl IntoIterator<Item = StationId>) -> Self {
        Self {
            is_admin: false,
            allowed_station_ids: stations.into_iter().collect(),
        }
    }

    /// Scope that admits nothing (authorization lookup failed)
    pub fn none() -> Self {
        Self::default()
    }

    pub fn admits_station(&self, station: StationId) -> bool {
        self.is_admin || self.allowed_station_ids.contains(&station)
    }

    pub fn admits(&self, event: &AlertEvent) -> bool {
        self.admits_station(event.station_id)
    }

    /// Deletes without a station are admitted: they can only remove rows that
    /// already passed this filter.
    pub fn admits_mutation(&self, mutation: &LiveMutation) -> bool {
        mutation
            .station_id()
            .map_or(true, |station| self.admits_station(station))
    }

    /// Drop every event outside the scope
    pub fn filter(&self, events: Vec<AlertEvent>) -> Vec<AlertEvent> {
        if self.is_admin {
            return events;
        }
        events.into_iter().filter(|e| self.admits(e)).collect()
    }

    /// Server-side filter hint. `None` means "no restriction".
    pub fn station_hint(&self) -> Option<&BTreeSet<StationId>> {
        if self.is_admin {
            None
        } else {
            Some(&self.allowed_station_ids)
        }
    }
}

/// External authorization service
#[async_trait]
pub trait AuthorizationResolver: Send + Sync {
    /// Resolve the scope for a viewer
    async fn resolve(&self, viewer: &ViewerIdentity) -> Result<AuthorizationScope>;
}

/// Resolve a scope, degrading to [`AuthorizationScope::none`] on failure.
///
/// The feed still loads; a viewer whose scope could not be fetched simply
/// sees no events.
pub async fn resolve_or_restrict(
    resolver: &dyn AuthorizationResolver,
    viewer: &ViewerIdentity,
) -> Arc<AuthorizationScope> {
    match resolver.resolve(viewer).await {
        Ok(scope) => Arc::new(scope),
        Err(e) => {
            warn!(
                "Authorization lookup for '{}' failed, showing no stations: {}",
                viewer.user, e
            );
            Arc::new(AuthorizationScope::none())
        }
    }
}

/// Resolver that always answers with a fixed scope
pub struct StaticResolver {
    scope: AuthorizationScope,
}

impl StaticResolver {
    pub fn new(scope: AuthorizationScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl AuthorizationResolver for StaticResolver {
    async fn resolve(&self, _viewer: &ViewerIdentity) -> Result<AuthorizationScope> {
        Ok(self.scope.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use chrono::Utc;

    fn event(id: i64, station: u64) -> AlertEvent {
        AlertEvent::new(id, "test", Utc::now(), 1, station)
    }

    #[test]
    fn test_restricted_scope() {
        let scope = AuthorizationScope::restricted([StationId(10)]);
        assert!(scope.admits(&event(1, 10)));
        assert!(!scope.admits(&event(2, 20)));
        assert_eq!(scope.filter(vec![event(1, 10), event(2, 20)]).len(), 1);
        assert_eq!(scope.station_hint().map(|s| s.len()), Some(1));
    }

    #[test]
    fn test_admin_bypass() {
        let scope = AuthorizationScope::admin();
        assert!(scope.admits(&event(1, 999)));
        assert!(scope.station_hint().is_none());
    }

    #[test]
    fn test_delete_without_station_is_admitted() {
        let scope = AuthorizationScope::restricted([StationId(10)]);
        assert!(scope.admits_mutation(&LiveMutation::Delete { id: 1, station_id: None }));
        assert!(!scope.admits_mutation(&LiveMutation::Delete {
            id: 1,
            station_id: Some(StationId(20)),
        }));
    }

    struct FailingResolver;

    #[async_trait]
    impl AuthorizationResolver for FailingResolver {
        async fn resolve(&self, _viewer: &ViewerIdentity) -> Result<AuthorizationScope> {
            Err(FeedError::AuthorizationFetch("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_failure_degrades_to_empty_scope() {
        let scope = resolve_or_restrict(&FailingResolver, &ViewerIdentity::new("op1")).await;
        assert!(!scope.is_admin);
        assert!(scope.allowed_station_ids.is_empty());
        assert!(!scope.admits(&event(1, 10)));
    }
}
