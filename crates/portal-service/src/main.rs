use anyhow::{anyhow, Context, Result};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use portal_core::backup::RestoreOptions;
use portal_core::cache::{FileCache, LocalCache};
use portal_core::clock::{Clock, SystemClock};
use portal_core::config::PortalConfig;
use portal_core::event_log::{EventLog, EventSeverity, GUARD_BLOCKED};
use portal_core::guard::{AccessGuard, GuardTransition, GuardView};
use portal_core::paths::data_dir;
use portal_core::policy::{POLICY_COLLECTION, POLICY_DOCUMENT};
use portal_core::store::{DocumentStore, FileStore};
use portal_service::operations::{download_backup, restore_summary, upload_and_restore};
use portal_service::policy_provider::{decode_policy, StorePolicyProvider};
use portal_service::session::GuardSession;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Institute portal guard and backup service", long_about = None)]
struct Cli {
    /// Data directory holding portal.json, the store, cache and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a dated JSON backup of every backed-up collection
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Restore a backup file into the store
    Restore {
        file: PathBuf,
        /// Also restore collections outside the backup list
        #[arg(long)]
        allow_unlisted: bool,
    },
    /// Show what the guard would render for a route
    Status {
        #[arg(long, default_value = "/")]
        route: String,
    },
    /// Lock the local session with a custom reason
    Lock {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        minutes: Option<u32>,
    },
    /// Print recent audit events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run a live guard session driven by stdin
    Watch {
        #[arg(long, default_value = "/")]
        route: String,
    },
}

struct Runtime {
    config: PortalConfig,
    store: Arc<FileStore>,
    cache: Arc<dyn LocalCache>,
    events: Arc<EventLog>,
}

impl Runtime {
    fn open(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let data = match data_dir_override {
            Some(dir) => dir,
            None => data_dir()?,
        };
        let config = PortalConfig::load_or_create(&data)?;
        let store = FileStore::open(&config.store_dir)
            .with_context(|| format!("open store at {}", config.store_dir.display()))?;
        let cache = FileCache::open(&config.cache_dir)
            .with_context(|| format!("open cache at {}", config.cache_dir.display()))?;
        let events = EventLog::new(config.event_log_path(), config.event_log_max_bytes)
            .context("open event log")?;
        Ok(Self {
            config,
            store: Arc::new(store),
            cache: Arc::new(cache),
            events: Arc::new(events),
        })
    }

    /// Guard restored from the cache with the store's current policy applied.
    async fn guard(&self, clock: &dyn Clock) -> AccessGuard {
        let mut guard = AccessGuard::load(self.cache.clone(), clock.now());
        match self.store.get(POLICY_COLLECTION, POLICY_DOCUMENT).await {
            Ok(Some(doc)) => match decode_policy(&doc) {
                Ok(policy) => {
                    guard.apply_policy(policy, clock.now());
                }
                Err(err) => warn!(error = %err, "stored policy malformed; using cached policy"),
            },
            Ok(None) => {}
            Err(err) => warn!(error = %err, "policy unavailable; using cached policy"),
        }
        guard
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let runtime = Runtime::open(cli.data_dir)?;
    match cli.command {
        Commands::Export { out } => export_command(&runtime, out).await,
        Commands::Restore {
            file,
            allow_unlisted,
        } => restore_command(&runtime, file, allow_unlisted).await,
        Commands::Status { route } => status_command(&runtime, &route).await,
        Commands::Lock { reason, minutes } => lock_command(&runtime, reason, minutes).await,
        Commands::Events { limit } => events_command(&runtime, limit),
        Commands::Watch { route } => watch_command(&runtime, route).await,
    }
}

async fn export_command(runtime: &Runtime, out: Option<PathBuf>) -> Result<()> {
    let outcome = download_backup(
        runtime.store.as_ref(),
        &runtime.config,
        out.as_deref(),
        Some(runtime.events.as_ref()),
    )
    .await?;
    for (collection, count) in &outcome.summary.counts {
        println!("{collection:<20} {count}");
    }
    println!("total {} documents -> {}", outcome.summary.total, outcome.path.display());
    if !outcome.summary.skipped_collections.is_empty() {
        println!(
            "not backed up: {}",
            outcome.summary.skipped_collections.join(", ")
        );
    }
    Ok(())
}

async fn restore_command(runtime: &Runtime, file: PathBuf, allow_unlisted: bool) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping restore after the current document");
            let _ = cancel_tx.send(true);
        }
    });

    let result = upload_and_restore(
        runtime.store.as_ref(),
        &file,
        &RestoreOptions { allow_unlisted },
        Some(cancel_rx),
        Some(runtime.events.as_ref()),
    )
    .await;
    interrupt.abort();

    let report = result?;
    println!("{}", restore_summary(&report));
    if !report.is_complete() {
        return Err(anyhow!("restore incomplete"));
    }
    Ok(())
}

async fn status_command(runtime: &Runtime, route: &str) -> Result<()> {
    let clock = SystemClock;
    let guard = runtime.guard(&clock).await;
    let policy = guard.policy();
    println!(
        "guard {} | reload detection {} | interaction detection {} | maintenance {}",
        on_off(policy.active),
        on_off(policy.reload_detection),
        on_off(policy.interaction_detection),
        on_off(policy.maintenance_mode)
    );
    println!(
        "threshold {} reloads / {}s, block {} min",
        policy.max_refreshes, policy.refresh_window_seconds, policy.block_duration_minutes
    );
    println!("{route}: {}", render(&guard.view(route, clock.now())));
    Ok(())
}

async fn lock_command(runtime: &Runtime, reason: String, minutes: Option<u32>) -> Result<()> {
    let clock = SystemClock;
    let mut guard = runtime.guard(&clock).await;
    let duration = minutes.map(|m| ChronoDuration::minutes(i64::from(m)));
    let transition = guard.trigger(reason, duration, clock.now());
    info!(?transition, "lock requested");
    if let GuardTransition::Blocked(reason) | GuardTransition::Reblocked(reason) = &transition {
        runtime.events.append(
            GUARD_BLOCKED,
            EventSeverity::Warn,
            serde_json::json!({ "reason": reason, "operator": runtime.config.operator }),
        )?;
    }
    println!("{}", render(&guard.view("/", clock.now())));
    Ok(())
}

fn events_command(runtime: &Runtime, limit: usize) -> Result<()> {
    for entry in runtime.events.read_recent(None, Some(limit))? {
        println!(
            "{:>6} {} {:?} {} {}",
            entry.seq,
            entry.timestamp.to_rfc3339(),
            entry.severity,
            entry.event_type,
            entry.data
        );
    }
    match runtime.events.verify_chain() {
        Ok(count) => println!("chain intact ({count} entries)"),
        Err(err) => println!("chain BROKEN: {err}"),
    }
    Ok(())
}

async fn watch_command(runtime: &Runtime, mut route: String) -> Result<()> {
    let provider = Arc::new(StorePolicyProvider::new(runtime.store.clone()));
    let session = GuardSession::start(
        runtime.cache.clone(),
        provider,
        Arc::new(SystemClock),
        Some(runtime.events.clone()),
    );
    println!("{route}: {}", render(&session.view(&route)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("click" | "key"), _) => {
                session.record_action();
            }
            (Some("reload"), _) => {
                session.on_page_load();
            }
            (Some("route"), Some(path)) => route = path.to_string(),
            (Some("quit"), _) => break,
            (None, _) => continue,
            (Some(other), _) => {
                println!(
                    "unknown event {other:?}; expected click, key, reload, route <path>, quit"
                );
                continue;
            }
        }
        println!("{route}: {}", render(&session.view(&route)));
    }

    session.shutdown().await;
    Ok(())
}

fn render(view: &GuardView) -> String {
    match view {
        GuardView::Children => "page".to_string(),
        GuardView::Maintenance => {
            "maintenance: the site is being updated, please check back soon".to_string()
        }
        GuardView::Blocked {
            reason,
            remaining_secs,
        } => format!(
            "access restricted: {reason} (try again in {}:{:02})",
            remaining_secs / 60,
            remaining_secs % 60
        ),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
