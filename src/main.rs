// src/main.rs - alarmfeed operator console
//
// Usage: alarmfeed [config.yaml] [--viewer NAME] [--search TEXT]
//                  [--from TIME] [--to TIME] [--export FILE] [--replay FILE]
//
// Without `api.base_url` the console runs against an in-memory archive,
// optionally seeded from a JSON array of alarm events (`--replay`).

use alarmfeed::event::flexible_time;
use alarmfeed::{
    AlertEvent, AuthorizationScope, Collaborators, Config, FeedView, HttpBackend, HttpPushSource,
    MemoryArchive, MemoryPushSource, SearchFilters, StaticResolver, ViewController, ViewMode,
    ViewerIdentity,
};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    viewer: Option<String>,
    search: Option<String>,
    from: Option<String>,
    to: Option<String>,
    export: Option<String>,
    replay: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| iter.next().with_context(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--viewer" => args.viewer = Some(value("--viewer")?),
            "--search" => args.search = Some(value("--search")?),
            "--from" => args.from = Some(value("--from")?),
            "--to" => args.to = Some(value("--to")?),
            "--export" => args.export = Some(value("--export")?),
            "--replay" => args.replay = Some(value("--replay")?),
            flag if flag.starts_with("--") => bail!("Unknown option {}", flag),
            path if args.config.is_none() => args.config = Some(path.to_string()),
            extra => bail!("Unexpected argument {}", extra),
        }
    }
    Ok(args)
}

fn collaborators(config: &Config, replay: Option<&str>) -> Result<Collaborators> {
    if config.api.base_url.is_some() {
        let backend = Arc::new(HttpBackend::new(&config.api)?);
        let push = Arc::new(HttpPushSource::new(&config.api)?);
        return Ok(Collaborators {
            resolver: backend.clone(),
            alerts: backend.clone(),
            push,
            search: backend.clone(),
            stations: Some(backend),
        });
    }

    let archive = MemoryArchive::new();
    if let Some(path) = replay {
        let text = std::fs::read_to_string(path).with_context(|| format!("Reading replay file {}", path))?;
        let events: Vec<AlertEvent> =
            serde_json::from_str(&text).with_context(|| format!("Parsing replay file {}", path))?;
        info!("Replaying {} events from {}", events.len(), path);
        archive.extend(events);
    }
    warn!("No api.base_url configured, running against the in-memory archive");

    Ok(Collaborators {
        resolver: Arc::new(StaticResolver::new(AuthorizationScope::admin())),
        alerts: Arc::new(archive.clone()),
        push: Arc::new(MemoryPushSource::new()),
        search: Arc::new(archive.clone()),
        stations: Some(Arc::new(archive)),
    })
}

fn render(view: &FeedView) {
    let source = match view.source {
        ViewMode::Live => "LIVE",
        ViewMode::Search => "SEARCH",
    };
    println!(
        "[{} rev {}] {} rows, channel {:?}, health {:?}{}",
        source,
        view.revision,
        view.rows.len(),
        view.channel_state,
        view.live_health,
        if view.fallback_active { ", polling" } else { "" }
    );
    for message in [&view.warning, &view.pull_error, &view.search_error].into_iter().flatten() {
        println!("  ! {}", message);
    }
    for event in view.rows.iter().take(10) {
        println!(
            "  {:>8}  {}  P{}  {:<24}  {}",
            event.id,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.priority.level(),
            event.station_name.as_deref().unwrap_or(&event.station_id.to_string()),
            event.message
        );
    }
}

fn export(controller: &ViewController, path: Option<&str>) -> Result<()> {
    if let Some(path) = path {
        let file = std::fs::File::create(path).with_context(|| format!("Creating {}", path))?;
        let rows = controller.export(file)?;
        info!("Exported {} rows to {}", rows, path);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    alarmfeed::init();
    info!("{}", alarmfeed::build_info::summary());

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("Loading config {}", path))?,
        None => Config::default(),
    };

    let mut viewer = ViewerIdentity::new(args.viewer.clone().unwrap_or_else(|| "operator".to_string()));
    if let Some(token) = &config.api.token {
        viewer = viewer.with_token(token.clone());
    }

    let controller = ViewController::new(config.clone(), collaborators(&config, args.replay.as_deref())?, viewer)?;

    if args.search.is_some() || args.from.is_some() || args.to.is_some() {
        let start = args.from.as_deref().map(flexible_time::parse).transpose()?;
        let end = args.to.as_deref().map(flexible_time::parse).transpose()?;
        let filters = SearchFilters::text(args.search.clone().unwrap_or_default()).with_range(start, end);

        controller.enter_search_mode(filters).await;
        controller.resolve_station_names().await;
        let view = controller.view();
        render(&view);
        export(&controller, args.export.as_deref())?;
        if let Some(e) = view.search_error {
            bail!("Search failed: {}", e);
        }
        return Ok(());
    }

    controller.enter_live_mode().await;
    controller.resolve_station_names().await;
    render(&controller.view());

    let mut changes = controller.changes();
    let mut ctrl_c = Box::pin(signal::ctrl_c());

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    error!("Signal handler failed: {}", e);
                }
                info!("Received shutdown signal");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                render(&controller.view());
            }
        }
    }

    controller.teardown().await;
    export(&controller, args.export.as_deref())?;
    info!("alarmfeed stopped");
    Ok(())
}
