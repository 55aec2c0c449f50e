use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use chimata_core::{config, Config, MirrorName};

use crate::dispatcher::Dispatcher;
use crate::error::{io_err, DaemonError};
use crate::paths::{log_file_path, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::reconciler::{ReconcileSummary, Reconciler};
use crate::registry::JobRegistry;

/// Shared handles for every runtime task.
struct DaemonState {
    config_path: PathBuf,
    socket: PathBuf,
    reconciler: Reconciler,
    started_at: DateTime<Local>,
}

impl DaemonState {
    fn registry(&self) -> &Arc<JobRegistry> {
        self.reconciler.registry()
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.reconciler.dispatcher()
    }

    async fn apply(&self, config: &Config, source: &'static str) -> ReconcileSummary {
        let summary = self.reconciler.reconcile(config).await;
        tracing::info!(
            source,
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            unscheduled = summary.unscheduled.len(),
            "configuration reconciled",
        );
        summary
    }

    /// Re-read the config file and reconcile. A config that fails to load
    /// leaves the current jobs untouched.
    async fn reload(&self, source: &'static str) -> Result<ReconcileSummary, String> {
        let path = self.config_path.clone();
        let loaded = tokio::task::spawn_blocking(move || config::load_at(&path))
            .await
            .map_err(|err| format!("config load join error: {err}"))?;
        match loaded {
            Ok(config) => Ok(self.apply(&config, source).await),
            Err(err) => {
                tracing::error!(source, error = %err, "reload failed, keeping current jobs");
                Err(err.to_string())
            }
        }
    }
}

struct ReloadRequest {
    source: &'static str,
    respond_to: Option<oneshot::Sender<Result<ReconcileSummary, String>>>,
}

impl ReloadRequest {
    fn detached(source: &'static str) -> Self {
        Self {
            source,
            respond_to: None,
        }
    }
}

/// Load configuration, install logging, and run the daemon on a fresh
/// multi-threaded runtime until it is told to stop.
pub fn start_blocking(config_path: Option<&Path>) -> Result<(), DaemonError> {
    let (path, config) = config::load(config_path)?;
    init_tracing(config.base.log_path.as_deref())?;
    tracing::info!(config = %path.display(), mirrors = config.mirrors.len(), "starting chimata daemon");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(path, config))
}

/// Run the daemon runtime.
pub async fn run(config_path: PathBuf, config: Config) -> Result<(), DaemonError> {
    let state = Arc::new(DaemonState {
        config_path: config_path.clone(),
        socket: config.base.socket_path(),
        reconciler: Reconciler::new(Arc::new(JobRegistry::new()), Arc::new(Dispatcher::new())),
        started_at: Local::now(),
    });

    let (reload_tx, reload_rx) = mpsc::channel::<ReloadRequest>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let mut shutdown_rx = shutdown_tx.subscribe();

    state.dispatcher().start();
    let mirror_dir = Some(config.base.mirror_config_path.clone());

    let reload_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = reload_task(state, config, reload_rx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let reload_tx = reload_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = watcher_task(config_path, mirror_dir, reload_tx, shutdown_rx).await;
            if let Err(err) = &result {
                tracing::error!(error = %err, "config watcher stopped");
            }
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        let reload_tx = reload_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(state, reload_tx, shutdown.clone(), shutdown_rx).await;
            if let Err(err) = &result {
                tracing::error!(error = %err, "control socket stopped");
            }
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = signal_task(reload_tx, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let _ = shutdown_rx.recv().await;
    tracing::info!("shutting down: canceling jobs and stopping the clock");
    state.reconciler.shutdown().await;

    let (reload_result, watcher_result, socket_result, signal_result) =
        tokio::join!(reload_handle, watcher_handle, socket_handle, signal_handle);

    handle_join("reload", reload_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

async fn reload_task(
    state: Arc<DaemonState>,
    initial: Config,
    mut reload_rx: mpsc::Receiver<ReloadRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    state.apply(&initial, "startup").await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            request = reload_rx.recv() => {
                let Some(request) = request else { break };
                let outcome = state.reload(request.source).await;
                if let Some(respond_to) = request.respond_to {
                    let _ = respond_to.send(outcome);
                }
            }
        }
    }
    Ok(())
}

async fn watcher_task(
    config_path: PathBuf,
    mirror_dir: Option<PathBuf>,
    reload_tx: mpsc::Sender<ReloadRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut _watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched = HashSet::new();
    let config_dir = config_path.parent().map(Path::to_path_buf);
    for dir in [config_dir, mirror_dir].into_iter().flatten() {
        // Canonicalize so that event paths (which arrive as real paths, e.g.
        // /private/var/... on macOS) compare equal.
        let canonical = match fs::canonicalize(&dir) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(path = %dir.display(), error = %err, "not watching missing directory");
                continue;
            }
        };
        if watched.insert(canonical.clone()) {
            _watcher.watch(&canonical, RecursiveMode::NonRecursive)?;
            tracing::debug!(path = %canonical.display(), "watching config directory");
        }
    }

    let mut pending = HashMap::<PathBuf, Instant>::new();

    loop {
        let settle_at = settle_deadline(&pending, DEBOUNCE_WINDOW);
        let settle = async {
            match settle_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                let now = Instant::now();
                for path in event.paths.into_iter().filter(|p| config::has_toml_extension(p)) {
                    pending.insert(path, now);
                }
            }
            _ = settle => {
                let settled = take_settled(&mut pending, Instant::now(), DEBOUNCE_WINDOW);
                if settled.is_empty() {
                    continue;
                }
                tracing::info!(paths = ?settled, "config files changed, reloading");
                if reload_tx.send(ReloadRequest::detached("watcher")).await.is_err() {
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn signal_task(
    reload_tx: mpsc::Sender<ReloadRequest>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|e| io_err("SIGHUP handler", e))?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| io_err("ctrl-c handler", e))?;
                tracing::info!("received ctrl-c, shutting down daemon");
                let _ = shutdown_tx.send(());
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down daemon");
                let _ = shutdown_tx.send(());
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration");
                if reload_tx.send(ReloadRequest::detached("sighup")).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    state: Arc<DaemonState>,
    reload_tx: mpsc::Sender<ReloadRequest>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = state.socket.clone();
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let reload_tx = reload_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, reload_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    reload_tx: mpsc::Sender<ReloadRequest>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request == DaemonRequest::Stop;
        let response = match request {
            DaemonRequest::Status => DaemonResponse::ok(build_status_payload(&state).await),
            DaemonRequest::Reload => match enqueue_reload(&reload_tx, "socket").await {
                Ok(summary) => DaemonResponse::ok(json!(summary)),
                Err(err) => DaemonResponse::error(err),
            },
            DaemonRequest::Sync { mirror } => trigger_sync(&state, &mirror).await,
            DaemonRequest::Stop => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

async fn enqueue_reload(
    reload_tx: &mpsc::Sender<ReloadRequest>,
    source: &'static str,
) -> Result<ReconcileSummary, String> {
    let (tx, rx) = oneshot::channel();
    reload_tx
        .send(ReloadRequest {
            source,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| "reload queue closed".to_string())?;
    rx.await.map_err(|_| "reload response dropped".to_string())?
}

async fn trigger_sync(state: &DaemonState, mirror: &str) -> DaemonResponse {
    let name = MirrorName::from(mirror);
    let Some(view) = state.registry().get(&name).await else {
        return DaemonResponse::error(format!("unknown mirror '{mirror}'"));
    };
    let Some(handle) = view.handle else {
        return DaemonResponse::error(format!("mirror '{mirror}' is not scheduled"));
    };

    let started = state.dispatcher().run_now(handle);
    tracing::info!(mirror, started, "manual sync requested");
    DaemonResponse::ok(json!({ "mirror": mirror, "started": started }))
}

async fn build_status_payload(state: &DaemonState) -> Value {
    let dispatcher = state.dispatcher();
    let mirrors: Vec<Value> = state
        .registry()
        .snapshot()
        .await
        .into_iter()
        .map(|view| {
            let job_state = view.job.state();
            let next_fire = view.handle.and_then(|handle| dispatcher.next_fire(handle));
            let running = view
                .handle
                .map(|handle| dispatcher.is_running(handle))
                .unwrap_or(false);
            json!({
                "name": view.job.name(),
                "status": job_state.status,
                "last_change_time": job_state.last_change_time.to_rfc3339(),
                "period": view.job.config().period,
                "scheduled": view.handle.is_some(),
                "running": running,
                "next_fire": next_fire.map(|at| at.to_rfc3339()),
            })
        })
        .collect();

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": state.started_at.to_rfc3339(),
        "config": state.config_path.display().to_string(),
        "socket": state.socket.display().to_string(),
        "mirrors": mirrors,
    })
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// When the quietest pending path will have been quiet for `window`.
fn settle_deadline(pending: &HashMap<PathBuf, Instant>, window: Duration) -> Option<Instant> {
    pending.values().min().map(|seen_at| *seen_at + window)
}

/// Remove and return every path with no event for at least `window`.
fn take_settled(
    pending: &mut HashMap<PathBuf, Instant>,
    now: Instant,
    window: Duration,
) -> Vec<PathBuf> {
    let mut settled: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, seen_at)| now.duration_since(**seen_at) >= window)
        .map(|(path, _)| path.clone())
        .collect();
    for path in &settled {
        pending.remove(path);
    }
    settled.sort();
    settled
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// JSON lines to `<log_dir>/chimata.log` when a log directory is configured,
/// human-readable stderr otherwise. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<(), DaemonError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            let path = log_file_path(dir);
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| io_err(&path, e))?;
            let _ = fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = fmt().with_env_filter(filter).with_target(false).try_init();
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
