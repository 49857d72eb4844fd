// Search mode: switching sources, last-request-wins, failures, and the
// scope applied (or not) to historical results.

use alarmfeed::{
    AlertEvent, AuthorizationResolver, AuthorizationScope, Collaborators, Config, MemoryArchive,
    MemoryPushSource, Result, SearchBackend, SearchFilters, SearchQuery, StationId, ViewController,
    ViewMode, ViewerIdentity,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Resolver {}

    #[async_trait]
    impl AuthorizationResolver for Resolver {
        async fn resolve(&self, viewer: &ViewerIdentity) -> Result<AuthorizationScope>;
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, hour, 0, 0).unwrap()
}

fn archive() -> MemoryArchive {
    MemoryArchive::with_events(vec![
        AlertEvent::new(1, "Trafo overload stage 1", at(1), 3, 10),
        AlertEvent::new(2, "CB open", at(2), 2, 10),
        AlertEvent::new(3, "Trafo overload stage 2", at(3), 4, 20),
        AlertEvent::new(4, "Comm fail RTU", at(4), 1, 20),
        AlertEvent::new(5, "Feeder overload", at(5), 3, 30),
    ])
}

fn resolver_once(scope: AuthorizationScope) -> Arc<MockResolver> {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .times(1)
        .returning(move |_| Ok(scope.clone()));
    Arc::new(resolver)
}

fn controller(config: Config, resolver: Arc<dyn AuthorizationResolver>, archive: &MemoryArchive, search: Option<Arc<dyn SearchBackend>>) -> ViewController {
    let collaborators = Collaborators {
        resolver,
        alerts: Arc::new(archive.clone()),
        push: Arc::new(MemoryPushSource::new()),
        search: search.unwrap_or_else(|| Arc::new(archive.clone())),
        stations: Some(Arc::new(archive.clone())),
    };
    ViewController::new(config, collaborators, ViewerIdentity::new("operator")).unwrap()
}

fn ids(events: &[AlertEvent]) -> Vec<i64> {
    events.iter().map(|e| e.id).collect()
}

#[tokio::test]
async fn test_search_then_clear_returns_to_live_without_refetch() {
    let archive = archive();
    let ctl = controller(Config::default(), resolver_once(AuthorizationScope::admin()), &archive, None);

    ctl.enter_live_mode().await;
    let live_rows = ids(&ctl.view().rows);
    assert_eq!(live_rows, vec![5, 4, 3, 2, 1]);
    assert_eq!(archive.recent_calls(), 1);

    assert_eq!(ctl.enter_search_mode(SearchFilters::text("overload")).await, Some(3));
    let view = ctl.view();
    assert_eq!(view.source, ViewMode::Search);
    assert_eq!(ids(&view.rows), vec![5, 3, 1]);
    assert!(!view.search_pending);

    assert_eq!(ctl.enter_search_mode(SearchFilters::default()).await, None);
    let view = ctl.view();
    assert_eq!(view.source, ViewMode::Live);
    assert_eq!(ids(&view.rows), live_rows);
    assert!(view.search_filters.is_none());
    assert_eq!(archive.recent_calls(), 1);
    assert_eq!(archive.search_calls(), 1);

    ctl.teardown().await;
}

#[tokio::test]
async fn test_search_results_bypass_the_feed_store() {
    let archive = archive();
    let config = Config::from_yaml("feed:\n  capacity: 2\n  view_limit: 2\n").unwrap();
    let ctl = controller(config, resolver_once(AuthorizationScope::admin()), &archive, None);
    ctl.enter_live_mode().await;
    assert_eq!(ctl.live_snapshot().len(), 2);

    // Larger than the live capacity, and overlapping it
    let shown = ctl.enter_search_mode(SearchFilters::default().with_range(Some(at(1)), Some(at(5)))).await;
    assert_eq!(shown, Some(5));
    assert_eq!(ctl.live_snapshot().len(), 2);

    ctl.teardown().await;
}

#[tokio::test]
async fn test_search_applies_viewer_scope_by_default() {
    let archive = archive();
    let ctl = controller(
        Config::default(),
        resolver_once(AuthorizationScope::restricted([StationId(10)])),
        &archive,
        None,
    );

    assert_eq!(ctl.enter_search_mode(SearchFilters::text("overload")).await, Some(1));
    assert_eq!(ids(&ctl.view().rows), vec![1]);

    // Scope was resolved once and reused by live mode
    ctl.enter_live_mode().await;
    assert_eq!(ids(&ctl.view().rows), vec![2, 1]);
    ctl.teardown().await;
}

#[tokio::test]
async fn test_search_scope_can_be_disabled() {
    let archive = archive();
    let config = Config::from_yaml("search:\n  apply_scope: false\n").unwrap();
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().never();
    let ctl = controller(config, Arc::new(resolver), &archive, None);

    assert_eq!(ctl.enter_search_mode(SearchFilters::text("overload")).await, Some(3));
    assert_eq!(ids(&ctl.view().rows), vec![5, 3, 1]);
}

#[tokio::test]
async fn test_numeric_search_matches_station() {
    let archive = archive();
    let ctl = controller(Config::default(), resolver_once(AuthorizationScope::admin()), &archive, None);

    assert_eq!(ctl.enter_search_mode(SearchFilters::text(" 20 ")).await, Some(2));
    assert_eq!(ids(&ctl.view().rows), vec![4, 3]);
}

#[tokio::test]
async fn test_search_failure_is_reported_inline() {
    let archive = archive();
    archive.fail_search(Some("Failed to search alarms: timeout"));
    let ctl = controller(Config::default(), resolver_once(AuthorizationScope::admin()), &archive, None);
    ctl.enter_live_mode().await;

    assert_eq!(ctl.enter_search_mode(SearchFilters::text("trip")).await, None);
    let view = ctl.view();
    assert_eq!(view.source, ViewMode::Search);
    assert!(view.rows.is_empty());
    assert!(view.search_error.unwrap().contains("timeout"));
    assert!(view.pull_error.is_none());
    assert_eq!(ctl.live_snapshot().len(), 5);

    // Retry succeeds once the backend recovers
    archive.fail_search(None);
    assert_eq!(ctl.enter_search_mode(SearchFilters::text("CB")).await, Some(1));
    assert!(ctl.view().search_error.is_none());

    ctl.teardown().await;
}

#[tokio::test]
async fn test_inverted_range_is_rejected() {
    let archive = archive();
    let ctl = controller(Config::default(), resolver_once(AuthorizationScope::admin()), &archive, None);

    let filters = SearchFilters::text("trafo").with_range(Some(at(5)), Some(at(1)));
    assert_eq!(ctl.enter_search_mode(filters).await, None);
    assert!(ctl.view().search_error.is_some());
    assert_eq!(archive.search_calls(), 0);
}

/// Search backend answering after a delay chosen by the query text
struct DelayedSearch {
    archive: MemoryArchive,
}

#[async_trait]
impl SearchBackend for DelayedSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<AlertEvent>> {
        let delay = if query.text.as_deref() == Some("trafo") { 5 } else { 1 };
        tokio::time::sleep(Duration::from_secs(delay)).await;
        self.archive.search(query).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_latest_search_wins_over_slower_earlier_one() {
    let archive = archive();
    let search = Arc::new(DelayedSearch {
        archive: archive.clone(),
    });
    let ctl = Arc::new(controller(
        Config::default(),
        resolver_once(AuthorizationScope::admin()),
        &archive,
        Some(search),
    ));

    let slow = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.enter_search_mode(SearchFilters::text("trafo")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(ctl.enter_search_mode(SearchFilters::text("comm")).await, Some(1));
    assert_eq!(slow.await.unwrap(), None);

    let view = ctl.view();
    assert_eq!(ids(&view.rows), vec![4]);
    assert_eq!(view.search_filters.unwrap().text, "comm");
}

#[tokio::test(start_paused = true)]
async fn test_clearing_search_discards_in_flight_response() {
    let archive = archive();
    let search = Arc::new(DelayedSearch {
        archive: archive.clone(),
    });
    let ctl = Arc::new(controller(
        Config::default(),
        resolver_once(AuthorizationScope::admin()),
        &archive,
        Some(search),
    ));

    let pending = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.enter_search_mode(SearchFilters::text("trafo")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(ctl.view().search_pending);

    ctl.clear_search();
    assert_eq!(pending.await.unwrap(), None);

    let view = ctl.view();
    assert_eq!(view.source, ViewMode::Live);
    assert!(view.rows.is_empty());
    assert!(!view.search_pending);
}

#[tokio::test]
async fn test_search_names_feed_the_station_cache() {
    let archive = archive();
    archive.set_station_name(StationId(20), "GI Gambir");
    let ctl = controller(Config::default(), resolver_once(AuthorizationScope::admin()), &archive, None);

    ctl.enter_search_mode(SearchFilters::text("20")).await;
    assert!(ctl.view().rows.iter().all(|e| e.station_name.as_deref() == Some("GI Gambir")));

    // Live rows for that station pick the cached name up without a lookup
    ctl.clear_search();
    ctl.enter_live_mode().await;
    let named: Vec<_> = ctl
        .live_snapshot()
        .into_iter()
        .filter(|e| e.station_id == StationId(20))
        .map(|e| e.station_name)
        .collect();
    assert_eq!(named, vec![Some("GI Gambir".to_string()); 2]);
    ctl.teardown().await;
}

#[tokio::test]
async fn test_export_follows_the_rendered_source() {
    let archive = archive();
    let ctl = controller(Config::default(), resolver_once(AuthorizationScope::admin()), &archive, None);
    ctl.enter_live_mode().await;
    ctl.enter_search_mode(SearchFilters::text("overload")).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("search.csv");
    let written = ctl.export(std::fs::File::create(&path).unwrap()).unwrap();
    assert_eq!(written, 3);

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "id,time,message,priority,stationID,stationName");
    assert!(lines[1].starts_with("5,2025-07-01 05:00:00,Feeder overload,3,30,"));

    ctl.teardown().await;
}

/// Resolver whose first answer takes five seconds; counts every call
#[derive(Default)]
struct SlowFirstResolver {
    calls: AtomicUsize,
}

impl SlowFirstResolver {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorizationResolver for SlowFirstResolver {
    async fn resolve(&self, _viewer: &ViewerIdentity) -> Result<AuthorizationScope> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(AuthorizationScope::admin())
    }
}

#[tokio::test(start_paused = true)]
async fn test_latest_search_wins_while_scope_is_resolving() {
    let archive = archive();
    let resolver = Arc::new(SlowFirstResolver::default());
    let search = Arc::new(DelayedSearch {
        archive: archive.clone(),
    });
    let ctl = Arc::new(controller(Config::default(), resolver.clone(), &archive, Some(search)));

    let first = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.enter_search_mode(SearchFilters::text("trafo")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(ctl.enter_search_mode(SearchFilters::text("comm")).await, Some(1));
    assert_eq!(first.await.unwrap(), None);

    let view = ctl.view();
    assert_eq!(ids(&view.rows), vec![4]);
    assert_eq!(view.search_filters.unwrap().text, "comm");
    assert_eq!(resolver.calls(), 1);
    // The superseded submission never reached the backend
    assert_eq!(archive.search_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_resolve_scope_once() {
    let archive = archive();
    let resolver = Arc::new(SlowFirstResolver::default());
    let ctl = controller(Config::default(), resolver.clone(), &archive, None);

    let (_, shown) = tokio::join!(
        ctl.enter_live_mode(),
        ctl.enter_search_mode(SearchFilters::text("overload"))
    );
    assert_eq!(shown, Some(3));
    assert_eq!(resolver.calls(), 1);
    assert!(ctl.scope().unwrap().is_admin);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_clearing_search_while_scope_resolves_discards_submission() {
    let archive = archive();
    let resolver = Arc::new(SlowFirstResolver::default());
    let ctl = Arc::new(controller(Config::default(), resolver.clone(), &archive, None));

    let pending = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.enter_search_mode(SearchFilters::text("overload")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    ctl.clear_search();

    assert_eq!(pending.await.unwrap(), None);
    let view = ctl.view();
    assert_eq!(view.source, ViewMode::Live);
    assert!(view.search_filters.is_none());
    assert!(!view.search_pending);
    assert_eq!(archive.search_calls(), 0);
}
