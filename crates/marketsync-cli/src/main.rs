//! marketsync - keeps a device's local write queue and live quotes in sync
//! with the investing backend.
//!
//! Usage:
//!   marketsync run                              sync queue, poll watched symbols
//!   marketsync status                           show pending writes
//!   marketsync enqueue <endpoint> <METHOD> <json>
//!   marketsync pull                             print the server's user data
//!   marketsync login <token> [user-id]          save a session
//!   marketsync logout                           forget the saved session
//!
//! While `run` is active on unix, SIGUSR1 pauses polling and SIGUSR2 resumes it.
//! `run` also checks backend reachability on a timer and feeds the result to
//! the sync engine as its network signal.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use marketsync_core::api::{ApiClient, HttpMethod, RemoteApi};
use marketsync_core::auth::{AuthProvider, SessionData, SessionStore, StaticSession};
use marketsync_core::bootstrap::Bootstrap;
use marketsync_core::cache::{CategoryTtlPolicy, ResponseCache};
use marketsync_core::clock::SystemClock;
use marketsync_core::config::Config;
use marketsync_core::scheduler::{RefreshScheduler, UsEquitySession};
use marketsync_core::storage::{FileStore, KeyValueStore, MemoryStore};
use marketsync_core::sync::{AppLifecycle, FlushOutcome, SyncDeps, SyncEngine, WriteMethod};
use marketsync_core::task::TaskGuard;
use marketsync_core::utils::{format_last_synced, truncate_string};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable overriding the configured backend URL
const API_URL_ENV: &str = "MARKETSYNC_API_URL";

/// Environment variable supplying a bearer token, bypassing the session file
const TOKEN_ENV: &str = "MARKETSYNC_TOKEN";

/// Subdirectory of the data dir holding the key-value store
const STORE_DIR: &str = "store";

/// Max payload characters shown by `status`
const PAYLOAD_PREVIEW_LEN: usize = 60;

/// User id recorded by `login` when none is given
const DEFAULT_USER_ID: &str = "local";

/// Initialize the tracing subscriber for logging.
///
/// Use the RUST_LOG env var to control the level (e.g. RUST_LOG=debug). When
/// `log_dir` is set, logs are also written to a daily-rolling file there.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "marketsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  marketsync run");
    eprintln!("  marketsync status");
    eprintln!("  marketsync enqueue <endpoint> <POST|PUT|DELETE> <json>");
    eprintln!("  marketsync pull");
    eprintln!("  marketsync login <token> [user-id]");
    eprintln!("  marketsync logout");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load().context("Failed to load config")?;
    if let Ok(url) = std::env::var(API_URL_ENV) {
        config.api_base_url = url;
    }

    let _log_guard = init_tracing(config.log_dir.as_deref());

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("run") => run(&config).await,
        Some("status") => status(&config).await,
        Some("enqueue") => enqueue(&config, &args[2..]).await,
        Some("pull") => pull(&config).await,
        Some("login") => login(&config, &args[2..]).await,
        Some("logout") => logout(&config),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Everything a command needs, built from config.
struct Services {
    store: Arc<dyn KeyValueStore>,
    client: ApiClient,
    engine: SyncEngine,
    /// Reachability as the engine sees it. Dropping it freezes the signal.
    network: watch::Sender<bool>,
    lifecycle: watch::Sender<AppLifecycle>,
}

fn open_store(config: &Config) -> Arc<dyn KeyValueStore> {
    let dir = match config.data_dir() {
        Ok(dir) => dir.join(STORE_DIR),
        Err(e) => {
            warn!(error = %e, "No data directory, queued writes will not survive restart");
            return Arc::new(MemoryStore::new());
        }
    };
    match FileStore::new(dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "Failed to open store, queued writes will not survive restart");
            Arc::new(MemoryStore::new())
        }
    }
}

fn auth_provider(config: &Config) -> Arc<dyn AuthProvider> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        debug!("Using bearer token from environment");
        return Arc::new(StaticSession(Some(token)));
    }

    let Ok(data_dir) = config.data_dir() else {
        return Arc::new(StaticSession(None));
    };
    let session = SessionStore::new(data_dir);
    match session.load() {
        Ok(true) => debug!("Loaded saved session"),
        Ok(false) => info!("No active session, running in local-only mode"),
        Err(e) => warn!(error = %e, "Failed to load session"),
    }
    Arc::new(session)
}

/// Build the services. With `check_network` the backend is probed once so
/// the engine starts from real reachability; otherwise it starts offline.
async fn build(config: &Config, check_network: bool) -> Result<Services> {
    let store = open_store(config);
    let auth = auth_provider(config);
    let client = ApiClient::new(config.api_base_url.clone(), config.request_timeout())?
        .with_auth(auth.clone());
    let online = check_network && client.is_reachable().await;
    if check_network && !online {
        info!(url = client.base_url(), "Backend unreachable, writes stay queued");
    }

    let (network, network_rx) = watch::channel(online);
    let (lifecycle, lifecycle_rx) = watch::channel(AppLifecycle::Active);
    let engine = SyncEngine::new(SyncDeps {
        store: store.clone(),
        remote: Arc::new(client.clone()),
        auth,
        clock: Arc::new(SystemClock),
        network: network_rx,
        lifecycle: lifecycle_rx,
    });

    Ok(Services {
        store,
        client,
        engine,
        network,
        lifecycle,
    })
}

/// Re-check reachability on a timer and publish changes to the engine.
fn watch_reachability(client: ApiClient, network: watch::Sender<bool>, every: Duration) -> TaskGuard {
    TaskGuard::spawn(async move {
        let mut ticks = tokio::time::interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires at once and build() has just probed
        ticks.tick().await;
        loop {
            ticks.tick().await;
            let online = client.is_reachable().await;
            network.send_if_modified(|current| {
                if *current == online {
                    return false;
                }
                info!(online = online, "Backend reachability changed");
                *current = online;
                true
            });
        }
    })
}

/// Pause polling while the app is not in the foreground.
fn wire_lifecycle(scheduler: RefreshScheduler, mut lifecycle: watch::Receiver<AppLifecycle>) {
    tokio::spawn(async move {
        while lifecycle.changed().await.is_ok() {
            let state = *lifecycle.borrow_and_update();
            if state.is_active() {
                scheduler.resume();
            } else {
                scheduler.pause();
            }
        }
    });
}

#[cfg(unix)]
fn forward_signals(lifecycle: watch::Sender<AppLifecycle>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut background = signal(SignalKind::user_defined1())?;
    let mut foreground = signal(SignalKind::user_defined2())?;
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = background.recv() => AppLifecycle::Background,
                _ = foreground.recv() => AppLifecycle::Active,
            };
            info!(state = ?next, "Lifecycle change");
            lifecycle.send_replace(next);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn forward_signals(_lifecycle: watch::Sender<AppLifecycle>) -> Result<()> {
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: &Config) -> Result<()> {
    info!("marketsync starting");
    let services = build(config, true).await?;
    let Services {
        store,
        client,
        engine,
        network,
        lifecycle,
    } = services;

    engine.initialize().await;
    let _reachability = watch_reachability(
        client.clone(),
        network,
        config.reachability_check_interval(),
    );

    let bootstrap = Bootstrap::new(engine.clone(), store);
    match bootstrap.run().await {
        Ok(Some(report)) if report.migrated_writes() > 0 => {
            info!(writes = report.migrated_writes(), "Migrated legacy data");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Legacy data migration failed"),
    }

    let snapshot = engine.fetch_all_user_data().await;
    if !snapshot.is_empty() {
        info!("Pulled latest user data");
    }

    let cache: ResponseCache<Value> =
        ResponseCache::new(Arc::new(CategoryTtlPolicy::from_config(config)));
    let _sweeper = cache.spawn_sweeper(config.sweep_interval());

    let scheduler = RefreshScheduler::new(
        Arc::new(UsEquitySession::from_config(config)),
        Arc::new(SystemClock),
    );
    wire_lifecycle(scheduler.clone(), lifecycle.subscribe());
    forward_signals(lifecycle)?;

    for symbol in &config.watched_symbols {
        let cache = cache.clone();
        let client = client.clone();
        let symbol = symbol.clone();
        let key = format!("quotes:{}", symbol);
        scheduler.subscribe(
            key,
            move |token| {
                let cache = cache.clone();
                let client = client.clone();
                let symbol = symbol.clone();
                async move {
                    let key = format!("quote:{}", symbol);
                    let quote = cache
                        .get_or_fetch(&key, || {
                            let path = format!("/api/quotes/{}", symbol);
                            async move {
                                client
                                    .request(&path, HttpMethod::Get, None)
                                    .await
                                    .map_err(anyhow::Error::from)
                            }
                        })
                        .await?;
                    if !token.is_cancelled() {
                        println!("{:<6} {}", symbol, quote);
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
            config.quote_poll_interval(),
        );
    }

    let mut status = engine.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(
                    pending = current.pending_count,
                    syncing = current.is_syncing,
                    online = current.is_online,
                    "Sync status"
                );
            }
        }
    }

    info!("Shutting down");
    scheduler.destroy();
    engine.destroy();
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    // Offline so nothing is sent while we look
    let services = build(config, false).await?;
    services.engine.initialize().await;

    let status = services.engine.status();
    println!(
        "{} pending, last synced {}",
        status.pending_count,
        format_last_synced(status.last_synced_at, Utc::now())
    );
    println!("{}", describe_session(config, status.is_authenticated));
    for write in services.engine.pending_writes() {
        println!(
            "  {:<6} {:<40} retries={} {}",
            format!("{:?}", write.method).to_uppercase(),
            write.endpoint,
            write.retry_count,
            truncate_string(&write.payload.to_string(), PAYLOAD_PREVIEW_LEN)
        );
    }
    Ok(())
}

fn describe_session(config: &Config, authenticated: bool) -> String {
    if !authenticated {
        return "signed out; new writes stay on this device".to_string();
    }
    if std::env::var(TOKEN_ENV).is_ok() {
        return format!("signed in with {}", TOKEN_ENV);
    }
    let session = config.data_dir().ok().map(SessionStore::new);
    match session.and_then(|s| s.load().ok().and_then(|_| s.data())) {
        Some(data) => format!(
            "signed in as {}, session expires in {} min",
            data.user_id,
            data.minutes_until_expiry()
        ),
        None => "signed in".to_string(),
    }
}

fn parse_method(raw: &str) -> Result<WriteMethod> {
    match raw.to_ascii_uppercase().as_str() {
        "POST" => Ok(WriteMethod::Post),
        "PUT" => Ok(WriteMethod::Put),
        "DELETE" => Ok(WriteMethod::Delete),
        other => bail!("Unsupported method: {}", other),
    }
}

async fn enqueue(config: &Config, args: &[String]) -> Result<()> {
    let [endpoint, method, payload] = args else {
        print_usage();
        return Err(anyhow!("enqueue takes exactly three arguments"));
    };
    let method = parse_method(method)?;
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let services = build(config, true).await?;
    // Flush whatever is already queued before adding to it
    if let Some(flush) = services.engine.initialize().await {
        flush.await?;
    }

    let Some(flush) = services
        .engine
        .sync_to_cloud(endpoint.as_str(), method, payload)
        .await
    else {
        if services.engine.status().is_authenticated {
            println!("Backend unreachable; write queued for later");
        } else {
            println!("Not signed in; write kept local only");
        }
        return Ok(());
    };

    print_flush(flush.await?);
    services.engine.destroy();
    Ok(())
}

fn print_flush(outcome: FlushOutcome) {
    match outcome {
        FlushOutcome::Completed(report) => {
            println!(
                "sent {}, retrying {}, dropped {}",
                report.completed, report.retrying, report.dropped
            );
        }
        FlushOutcome::Skipped(reason) => println!("flush skipped: {:?}", reason),
    }
}

async fn pull(config: &Config) -> Result<()> {
    let services = build(config, true).await?;
    services.engine.initialize().await;
    let snapshot = services.engine.fetch_all_user_data().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    services.engine.destroy();
    Ok(())
}

async fn login(config: &Config, args: &[String]) -> Result<()> {
    let (token, user_id) = match args {
        [token] => (token.as_str(), DEFAULT_USER_ID),
        [token, user_id] => (token.as_str(), user_id.as_str()),
        _ => {
            print_usage();
            bail!("login takes a token and an optional user id");
        }
    };

    let session = SessionStore::new(config.data_dir()?);
    session.update(SessionData::new(token, user_id));
    session.save().context("Failed to save session")?;
    let minutes = session.data().map(|d| d.minutes_until_expiry()).unwrap_or_default();
    println!("Signed in as {} (session valid for {} min)", user_id, minutes);

    // Writes queued before the last sign-out can go out now
    let services = build(config, true).await?;
    if let Some(flush) = services.engine.initialize().await {
        print_flush(flush.await?);
    }
    services.engine.destroy();
    Ok(())
}

fn logout(config: &Config) -> Result<()> {
    SessionStore::new(config.data_dir()?)
        .clear()
        .context("Failed to clear session")?;
    println!("Signed out; queued writes stay on this device until the next sign-in");
    Ok(())
}
