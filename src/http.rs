// src/http.rs - reqwest client for the monitoring backend
//
// Endpoints:
// - GET /api/alarms/filtered-keypoints   viewer scope
// - GET /api/alarms/recent               initial and polling pull
// - GET /api/alarms/search               historical search
// - GET /api/station-points/{id}         station label
// - GET /api/alarms/stream               NDJSON push stream
//
// JSON endpoints answer with an envelope `{success, data, message?}`; a
// `success: false` body is reported even when the status is 5xx.

use crate::channel::{ChannelFilter, ChannelSignal, PushSource, Subscription, SUBSCRIPTION_BUFFER};
use crate::config::ApiConfig;
use crate::error::{FeedError, Result};
use crate::event::{AlertEvent, LiveMutation, StationId};
use crate::scope::{AuthorizationResolver, AuthorizationScope, ViewerIdentity};
use crate::source::{AlertSource, SearchBackend, SearchQuery, StationDirectory};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// RESPONSE DECODING
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    is_admin: bool,
}

impl<T> Envelope<T> {
    fn into_data(self, what: &str) -> Result<T> {
        if !self.success {
            return Err(FeedError::Upstream(
                self.message.unwrap_or_else(|| format!("{} request was not successful", what)),
            ));
        }
        self.data
            .ok_or_else(|| FeedError::Upstream(format!("{} response carried no data", what)))
    }
}

#[derive(Debug, Deserialize)]
struct StationPoint {
    name: Option<String>,
}

/// Station ids arrive as numbers or numeric strings depending on the backend
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireStationId {
    Number(u64),
    Text(String),
}

impl WireStationId {
    fn parse(self) -> Option<StationId> {
        match self {
            WireStationId::Number(id) => Some(StationId(id)),
            WireStationId::Text(text) => text.trim().parse().ok().map(StationId),
        }
    }
}

fn decode_scope(body: &str) -> Result<AuthorizationScope> {
    let envelope: Envelope<Vec<WireStationId>> = serde_json::from_str(body)?;
    if envelope.success && envelope.is_admin {
        return Ok(AuthorizationScope::admin());
    }
    let ids = envelope.into_data("authorization")?;
    Ok(AuthorizationScope::restricted(ids.into_iter().filter_map(WireStationId::parse)))
}

fn decode_events(body: &str, what: &str) -> Result<Vec<AlertEvent>> {
    let envelope: Envelope<Vec<AlertEvent>> = serde_json::from_str(body)?;
    envelope.into_data(what)
}

fn decode_station_name(body: &str) -> Result<Option<String>> {
    let envelope: Envelope<StationPoint> = serde_json::from_str(body)?;
    Ok(envelope.into_data("station point")?.name)
}

fn stations_param(stations: &BTreeSet<StationId>) -> String {
    stations
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn search_params(query: &SearchQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![("limit", query.limit.to_string())];
    if let Some(text) = &query.text {
        params.push(("search", text.clone()));
    }
    if let Some(start) = query.start {
        params.push(("start_date", start.to_rfc3339()));
    }
    if let Some(end) = query.end {
        params.push(("end_date", end.to_rfc3339()));
    }
    params
}

/// Splits a byte stream into newline-delimited push frames
#[derive(Debug, Default)]
struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Feed a chunk; returns every complete non-blank line
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Trailing frame without a newline at end of stream
    fn finish(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        (!line.is_empty()).then_some(line)
    }
}

// ============================================================================
// HTTP BACKEND
// ============================================================================

/// Request/response client for every JSON endpoint
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| FeedError::Config("api.base_url is required for the HTTP backend".into()))?
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| FeedError::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!("HTTP backend at {}", base_url);
        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str, token: Option<&str>) -> RequestBuilder {
        let request = self.client.get(self.url(path));
        match token.or(self.token.as_deref()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send and return the body text. Non-2xx bodies are returned too, since
    /// the backend reports failures inside the envelope.
    async fn fetch(&self, request: RequestBuilder) -> Result<String> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            debug!("Backend answered {}: {}", status, body);
            if serde_json::from_str::<Envelope<serde_json::Value>>(&body).is_err() {
                return Err(FeedError::Transport(format!("HTTP {}", status)));
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl AuthorizationResolver for HttpBackend {
    async fn resolve(&self, viewer: &ViewerIdentity) -> Result<AuthorizationScope> {
        let request = self.get("/api/alarms/filtered-keypoints", viewer.token.as_deref());
        let body = self
            .fetch(request)
            .await
            .map_err(|e| FeedError::AuthorizationFetch(e.to_string()))?;
        decode_scope(&body).map_err(|e| FeedError::AuthorizationFetch(e.to_string()))
    }
}

#[async_trait]
impl AlertSource for HttpBackend {
    async fn recent(&self, limit: usize, stations: Option<&BTreeSet<StationId>>) -> Result<Vec<AlertEvent>> {
        let mut params = vec![("limit", limit.to_string())];
        if let Some(stations) = stations {
            params.push(("stations", stations_param(stations)));
        }
        let request = self.get("/api/alarms/recent", None).query(&params);
        let body = self.fetch(request).await.map_err(|e| FeedError::Pull(e.to_string()))?;
        decode_events(&body, "recent alarms").map_err(|e| FeedError::Pull(e.to_string()))
    }
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<AlertEvent>> {
        let request = self.get("/api/alarms/search", None).query(&search_params(query));
        let body = self.fetch(request).await.map_err(|e| FeedError::Search(e.to_string()))?;
        decode_events(&body, "search").map_err(|e| FeedError::Search(e.to_string()))
    }
}

#[async_trait]
impl StationDirectory for HttpBackend {
    async fn station_names(&self, stations: &[StationId]) -> Result<HashMap<StationId, String>> {
        let lookups = stations.iter().map(|id| async move {
            let request = self.get(&format!("/api/station-points/{}", id), None);
            let name = match self.fetch(request).await {
                Ok(body) => decode_station_name(&body),
                Err(e) => Err(e),
            };
            (*id, name)
        });

        let mut names = HashMap::new();
        for (id, outcome) in futures::future::join_all(lookups).await {
            match outcome {
                Ok(Some(name)) => {
                    names.insert(id, name);
                }
                Ok(None) => {}
                Err(e) => debug!("No name for station {}: {}", id, e),
            }
        }
        Ok(names)
    }
}

// ============================================================================
// PUSH STREAM
// ============================================================================

/// NDJSON push stream. A 2xx response confirms the subscription; end of
/// body is a close; transport failures are errors.
#[derive(Clone)]
pub struct HttpPushSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPushSource {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| FeedError::Config("api.base_url is required for the push stream".into()))?
            .trim_end_matches('/')
            .to_string();

        // No total timeout: the stream stays open for the whole session
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| FeedError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl PushSource for HttpPushSource {
    async fn subscribe(&self, filter: &ChannelFilter) -> Result<Subscription> {
        let mut request = self
            .client
            .get(format!("{}/api/alarms/stream", self.base_url))
            .query(&[("topic", filter.topic.clone())]);
        if let Some(stations) = &filter.stations {
            request = request.query(&[("stations", stations_param(stations))]);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let worker = tokio::spawn(stream_frames(request, tx));
        Ok(Subscription::new(rx).with_worker(worker))
    }
}

async fn stream_frames(request: RequestBuilder, tx: mpsc::Sender<ChannelSignal>) {
    let response = match request.send().await.and_then(|r| r.error_for_status()) {
        Ok(response) => response,
        Err(e) => {
            error!("Push stream request failed: {}", e);
            let _ = tx.send(ChannelSignal::Error(e.to_string())).await;
            return;
        }
    };
    if tx.send(ChannelSignal::Subscribed).await.is_err() {
        return;
    }

    let mut decoder = FrameDecoder::default();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Push stream broke: {}", e);
                let _ = tx.send(ChannelSignal::Error(e.to_string())).await;
                return;
            }
        };
        for line in decoder.push(&chunk) {
            if !forward_frame(&line, &tx).await {
                return;
            }
        }
    }

    if let Some(line) = decoder.finish() {
        if !forward_frame(&line, &tx).await {
            return;
        }
    }
    let _ = tx.send(ChannelSignal::Closed).await;
}

/// Decode and forward one frame. Undecodable frames are skipped. Returns
/// `false` once the subscription is gone.
async fn forward_frame(line: &str, tx: &mpsc::Sender<ChannelSignal>) -> bool {
    match LiveMutation::from_frame(line) {
        Ok(mutation) => tx.send(ChannelSignal::Mutation(mutation)).await.is_ok(),
        Err(e) => {
            warn!("Skipping undecodable push frame: {}", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_admin_scope() {
        let scope = decode_scope(r#"{"success":true,"data":[],"is_admin":true}"#).unwrap();
        assert!(scope.is_admin);
    }

    #[test]
    fn test_decode_restricted_scope() {
        let scope = decode_scope(r#"{"success":true,"data":[10,"20"," 30 ","bad"],"is_admin":false}"#).unwrap();
        assert!(!scope.is_admin);
        assert_eq!(
            scope.allowed_station_ids,
            [StationId(10), StationId(20), StationId(30)].into_iter().collect()
        );
    }

    #[test]
    fn test_decode_failed_envelope() {
        let err = decode_scope(r#"{"success":false,"message":"Failed to get keypoints: db"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Upstream error: Failed to get keypoints: db");

        let err = decode_events(r#"{"success":true}"#, "search").unwrap_err();
        assert!(matches!(err, FeedError::Upstream(_)));
    }

    #[test]
    fn test_decode_search_rows() {
        let body = r#"{
            "success": true,
            "data": [
                {"id": 3, "TEXT": "Overload", "TIME": "2025-07-01 10:00:00", "PRIORITY": 2, "STATIONPID": 10, "station_name": "GI A"},
                {"id": 2, "TEXT": "Trip", "TIME": "2025-07-01 09:00:00", "PRIORITY": 4, "STATIONPID": 20, "station_name": null}
            ],
            "total": 2
        }"#;
        let rows = decode_events(body, "search").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].station_name.as_deref(), Some("GI A"));
        assert!(rows[1].station_name.is_none());
    }

    #[test]
    fn test_decode_station_name() {
        let name = decode_station_name(r#"{"success":true,"data":{"name":"GI Cawang"}}"#).unwrap();
        assert_eq!(name.as_deref(), Some("GI Cawang"));
    }

    #[test]
    fn test_query_parameters() {
        let stations: BTreeSet<_> = [StationId(30), StationId(10)].into_iter().collect();
        assert_eq!(stations_param(&stations), "10,30");

        let query = SearchQuery {
            text: Some("trip".into()),
            limit: 30,
            ..Default::default()
        };
        let params = search_params(&query);
        assert!(params.contains(&("limit", "30".to_string())));
        assert!(params.contains(&("search", "trip".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "start_date"));
    }

    #[test]
    fn test_frame_decoder_splits_lines() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.push(b"{\"eventType\":\"del").is_empty());
        let lines = decoder.push(b"ete\",\"payload\":{\"id\":1}}\n\n{\"a\":1}\r\n{\"b\"");
        assert_eq!(lines, vec![r#"{"eventType":"delete","payload":{"id":1}}"#, r#"{"a":1}"#]);
        assert_eq!(decoder.finish().as_deref(), Some(r#"{"b""#));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_backend_requires_base_url() {
        assert!(matches!(HttpBackend::new(&ApiConfig::default()), Err(FeedError::Config(_))));
        assert!(matches!(HttpPushSource::new(&ApiConfig::default()), Err(FeedError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_stream_reports_error() {
        let config = ApiConfig {
            base_url: Some("http://127.0.0.1:9".into()),
            ..Default::default()
        };
        let source = HttpPushSource::new(&config).unwrap();
        let mut sub = source.subscribe(&ChannelFilter::new("alarms", None)).await.unwrap();
        assert!(matches!(sub.next().await, Some(ChannelSignal::Error(_))));
    }
}
