use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kdash_api::{QueryFilter, Registry, SyncConfig};
use kdash_core::{LabelSelector, Resource, ResourceKind, ResourceModel};
use kdash_transport::WsConnector;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

/// Name-ordered view of one `(kind, env)` partition.
type ObjectMap = std::collections::BTreeMap<String, Resource>;

#[derive(Parser, Debug)]
#[command(name = "kdashctl", version, about = "Follow live dashboard resources and pod logs")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Dashboard origin, e.g. https://dash.example.com
    #[arg(long, global = true, env = "KDASH_ORIGIN")]
    origin: Option<String>,

    /// Delay before reopening a dropped stream
    #[arg(long = "reconnect-ms", global = true, env = "KDASH_RECONNECT_MS")]
    reconnect_ms: Option<u64>,

    /// Quiet window for initial snapshots and log batches
    #[arg(long = "debounce-ms", global = true, env = "KDASH_DEBOUNCE_MS")]
    debounce_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the resource kinds the dashboard streams
    Kinds,
    /// Print the current objects of a kind once the first snapshot arrives
    Ls {
        /// Kind, singular or plural, e.g. "pod" or "deployments"
        kind: String,
        #[arg(long = "env", short = 'e')]
        env: String,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Give up waiting for the first snapshot after this many seconds
        #[arg(long = "wait-secs", default_value_t = 8)]
        wait_secs: u64,
    },
    /// Stream changes of a kind as +/-/~ lines
    Watch {
        kind: String,
        #[arg(long = "env", short = 'e')]
        env: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Follow a pod's logs
    Logs {
        env: String,
        pod: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KDASH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KDASH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KDASH_METRICS_ADDR; expected host:port");
        }
    }
}

fn sync_config(cli: &Cli) -> Result<SyncConfig> {
    let mut cfg = SyncConfig::default();
    if let Some(origin) = &cli.origin { cfg.origin = origin.clone(); }
    if let Some(ms) = cli.reconnect_ms { cfg.reconnect_delay_ms = ms; }
    if let Some(ms) = cli.debounce_ms { cfg.debounce_ms = ms; }
    cfg.validate()?;
    Ok(cfg)
}

fn parse_selector(raw: Option<&str>) -> Result<Option<LabelSelector>> {
    raw.map(LabelSelector::parse).transpose().map_err(|e| anyhow!("invalid selector: {}", e))
}

fn snapshot(reg: &Registry, kind: ResourceKind, env: &str, selector: Option<&LabelSelector>) -> ObjectMap {
    let world = reg.reader().current();
    let Some(store) = world.store(kind) else { return ObjectMap::new() };
    let objects = match selector {
        Some(sel) => store.lookup_by_selector(env, sel),
        None => store.lookup_objects(env),
    };
    objects.into_iter().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Op { Added, Modified, Deleted }

impl Op {
    fn sigil(self) -> char {
        match self {
            Op::Added => '+',
            Op::Modified => '~',
            Op::Deleted => '-',
        }
    }
}

/// Changes between two views, ordered by name.
fn diff_objects<'a>(prev: &'a ObjectMap, next: &'a ObjectMap) -> Vec<(Op, &'a str, &'a Resource)> {
    let mut out = Vec::new();
    for (name, obj) in next {
        match prev.get(name) {
            None => out.push((Op::Added, name.as_str(), obj)),
            Some(old) if old.raw() != obj.raw() => out.push((Op::Modified, name.as_str(), obj)),
            Some(_) => {}
        }
    }
    for (name, obj) in prev {
        if !next.contains_key(name) {
            out.push((Op::Deleted, name.as_str(), obj));
        }
    }
    out.sort_by(|a, b| a.1.cmp(b.1));
    out
}

/// Lines added since `prev`, oldest first. Stored text is newest-first.
fn new_log_lines<'a>(prev: &str, next: &'a str) -> Vec<&'a str> {
    let fresh = if prev.is_empty() {
        next
    } else {
        match next.strip_suffix(prev) {
            Some(head) => head.strip_suffix('\n').unwrap_or(head),
            // Restarted from a new snapshot.
            None => next,
        }
    };
    if fresh.is_empty() {
        return Vec::new();
    }
    fresh.lines().rev().collect()
}

fn render_age(obj: &Resource) -> String {
    let Some(ts) = obj.creation_timestamp() else { return "-".to_string() };
    let mut secs = (chrono::Utc::now().timestamp() - ts.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[derive(Serialize)]
struct ChangeLine<'a> {
    op: Op,
    kind: ResourceKind,
    env: &'a str,
    name: &'a str,
    object: &'a serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if let Commands::Kinds = cli.command {
        for k in ResourceKind::ALL {
            match cli.output {
                Output::Human => println!("{:<12} {}", k.plural(), k.watch_path()),
                Output::Json => println!("{}", serde_json::to_string(&k)?),
            }
        }
        return Ok(());
    }

    let cfg = sync_config(&cli)?;
    info!(origin = %cfg.origin, "connecting");
    let reg = Registry::new(cfg, Arc::new(WsConnector));

    match &cli.command {
        Commands::Kinds => {}
        Commands::Ls { kind, env, selector, wait_secs } => {
            let kind = ResourceKind::from_str(kind)?;
            let selector = parse_selector(selector.as_deref())?;
            let filter = selector.clone().map(QueryFilter::labels);
            reg.subscribe(kind, env, filter.as_ref())?;

            let mut rx = reg.reader().subscribe_epoch();
            let deadline = Instant::now() + Duration::from_secs(*wait_secs);
            while *rx.borrow() == 0 {
                let now = Instant::now();
                if now >= deadline {
                    warn!(kind = %kind, env = %env, "no snapshot before deadline");
                    break;
                }
                if tokio::time::timeout(deadline - now, rx.changed()).await.is_err() { break; }
            }
            let objects = snapshot(&reg, kind, env, selector.as_ref());
            match cli.output {
                Output::Human => {
                    println!("{:<40} {}", "NAME", "AGE");
                    for (name, obj) in &objects {
                        println!("{:<40} {}", name, render_age(obj));
                    }
                }
                Output::Json => {
                    let items: Vec<_> = objects.values().map(|o| o.raw()).collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
        Commands::Watch { kind, env, selector } => {
            let kind = ResourceKind::from_str(kind)?;
            let selector = parse_selector(selector.as_deref())?;
            let filter = selector.clone().map(QueryFilter::labels);
            info!(kind = %kind, env = %env, selector = ?selector.as_ref().map(|s| s.to_string()), "watch invoked");
            reg.subscribe(kind, env, filter.as_ref())?;

            let mut rx = reg.reader().subscribe_epoch();
            let mut prev = ObjectMap::new();
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() { break; }
                        let next = snapshot(&reg, kind, env, selector.as_ref());
                        for (op, name, obj) in diff_objects(&prev, &next) {
                            match cli.output {
                                Output::Human => println!("{} {}", op.sigil(), name),
                                Output::Json => {
                                    let line = ChangeLine { op, kind, env, name, object: obj.raw() };
                                    println!("{}", serde_json::to_string(&line)?);
                                }
                            }
                        }
                        prev = next;
                    }
                    _ = signal::ctrl_c() => {
                        info!("interrupted");
                        break;
                    }
                }
            }
        }
        Commands::Logs { env, pod } => {
            info!(env = %env, pod = %pod, "logs invoked");
            reg.subscribe_log(env, pod)?;
            let reader = reg.reader();
            let mut rx = reader.subscribe_epoch();
            let mut prev = String::new();
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() { break; }
                        let Some(text) = reader.lookup_by_name(ResourceKind::Pod, env, pod).and_then(|r| r.log) else { continue };
                        for line in new_log_lines(&prev, &text) {
                            match cli.output {
                                Output::Human => println!("{}", line),
                                Output::Json => println!("{}", serde_json::json!({ "pod": pod, "line": line })),
                            }
                        }
                        prev = text;
                    }
                    _ = signal::ctrl_c() => {
                        info!("interrupted");
                        break;
                    }
                }
            }
        }
    }
    reg.shutdown();
    Ok(())
}
