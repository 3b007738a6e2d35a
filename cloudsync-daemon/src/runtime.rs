use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, RwLock};

use cloudsync_core::{
    config, registry,
    types::{Account, AccountId},
};
use cloudsync_sync::{SyncEngine, SyncError};

use crate::error::{io_err, DaemonError};
use crate::paths::{log_path, logs_dir, run_dir, socket_path, DAEMON_LABEL};
use crate::protocol::{DaemonRequest, DaemonResponse};

pub type AccountCache = HashMap<AccountId, Account>;

/// Per-account last successful full sync (Unix seconds).
pub type SyncTimestamps = HashMap<AccountId, u64>;

/// State shared by every daemon task.
#[derive(Clone)]
struct Shared {
    home: PathBuf,
    engine: Arc<SyncEngine>,
    accounts: Arc<RwLock<AccountCache>>,
    timestamps: Arc<RwLock<SyncTimestamps>>,
    started_at_unix: u64,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    ensure_runtime_dirs(home)?;
    init_tracing(home);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = config::load_at(&home)?;
    let interval = config.full_sync_interval();
    let shared = Shared {
        engine: Arc::new(SyncEngine::open_at(&home, config)),
        accounts: Arc::new(RwLock::new(load_account_cache(&home)?)),
        timestamps: Arc::new(RwLock::new(HashMap::new())),
        started_at_unix: unix_seconds_now(),
        home,
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let result = socket_server_task(shared, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let periodic_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let result = periodic_sync_task(shared, interval, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, periodic_result, signal_result) =
        tokio::join!(socket_handle, periodic_handle, signal_handle);

    handle_join("socket_server", socket_result)?;
    handle_join("periodic_sync", periodic_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Full-sync every registered account on a fixed interval. Accounts whose
/// lock is held are skipped until the next tick.
async fn periodic_sync_task(
    shared: Shared,
    interval: Option<Duration>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(period) = interval else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if let Err(err) = refresh_cache(&shared).await {
                    tracing::warn!(error = %err, "account cache refresh failed");
                }
                let accounts: Vec<Account> = shared.accounts.read().await.values().cloned().collect();
                for account in accounts {
                    match run_full_sync(&shared, account.clone(), None).await {
                        Ok(_) => {}
                        Err(DaemonError::Sync(SyncError::InProgress)) => {
                            tracing::debug!(account = %account.id, "periodic sync skipped, account busy");
                        }
                        Err(err) => {
                            tracing::error!(account = %account.id, error = %err, "periodic sync failed");
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    shared: Shared,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let run = run_dir(&shared.home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&shared.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let shared = shared.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, shared, shutdown_tx).await {
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
    shared: Shared,
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
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = dispatch(&shared, request, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn dispatch(
    shared: &Shared,
    request: DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    let cmd = request.cmd.clone();
    match cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(shared).await),
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        "sync_account" | "sync_resource" | "sync_status" => {
            let Some(id) = request.account.as_deref() else {
                return DaemonResponse::error(format!("'{cmd}' requires an account"));
            };
            let account = match resolve_account(shared, &AccountId::from(id)).await {
                Ok(account) => account,
                Err(err) => return error_response(&err),
            };
            let result = match cmd.as_str() {
                "sync_account" => run_full_sync(shared, account, request.sync_public_resource)
                    .await
                    .map(|report| json!(report)),
                "sync_resource" => start_resource_sync(shared, account, request).await,
                _ => shared
                    .engine
                    .query_status(&account.id, request.vendor.unwrap_or(account.vendor))
                    .map(|rows| json!(rows))
                    .map_err(DaemonError::from),
            };
            match result {
                Ok(data) => DaemonResponse::ok(data),
                Err(err) => error_response(&err),
            }
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn error_response(err: &DaemonError) -> DaemonResponse {
    match err {
        DaemonError::Sync(sync) => DaemonResponse::from_sync_error(sync),
        DaemonError::Registry(cloudsync_core::RegistryError::AccountNotFound { .. }) => {
            DaemonResponse::error(err.to_string())
        }
        other => DaemonResponse {
            class: Some(cloudsync_sync::ErrorClass::Internal),
            ..DaemonResponse::error(other.to_string())
        },
    }
}

/// Run a full account sync on the blocking pool and record its time.
async fn run_full_sync(
    shared: &Shared,
    account: Account,
    policy: Option<cloudsync_core::PublicResourcePolicy>,
) -> Result<cloudsync_sync::FullSyncReport, DaemonError> {
    let engine = Arc::clone(&shared.engine);
    let account_id = account.id.clone();
    let report = tokio::task::spawn_blocking(move || engine.sync_account(&account, policy))
        .await
        .map_err(|err| DaemonError::Protocol(format!("sync task join error: {err}")))??;
    shared
        .timestamps
        .write()
        .await
        .insert(account_id, unix_seconds_now());
    Ok(report)
}

/// Validation and the initial status rows touch disk, so they run off the reactor.
async fn start_resource_sync(
    shared: &Shared,
    account: Account,
    request: DaemonRequest,
) -> Result<Value, DaemonError> {
    let (Some(vendor), Some(resource_type)) = (request.vendor, request.resource_type) else {
        return Err(DaemonError::Sync(SyncError::Validation(
            "sync_resource requires vendor and resource_type".to_string(),
        )));
    };
    let body = request.request.unwrap_or_default();
    let engine = Arc::clone(&shared.engine);
    let ticket = tokio::task::spawn_blocking(move || {
        engine.start_conditional(&account, vendor, resource_type, &body)
    })
    .await
    .map_err(|err| DaemonError::Protocol(format!("resource sync join error: {err}")))??;
    Ok(json!({ "status": "started", "rid": ticket.rid }))
}

/// Look up an account in the cache, reloading it from the registry on a miss.
async fn resolve_account(shared: &Shared, id: &AccountId) -> Result<Account, DaemonError> {
    if let Some(account) = shared.accounts.read().await.get(id) {
        return Ok(account.clone());
    }
    let mut cache = shared.accounts.write().await;
    reload_account(&shared.home, &mut cache, id)?;
    cache.get(id).cloned().ok_or_else(|| {
        DaemonError::Registry(cloudsync_core::RegistryError::AccountNotFound {
            path: registry::account_path_at(&shared.home, id),
        })
    })
}

async fn build_status_payload(shared: &Shared) -> Value {
    let mut accounts: Vec<Account> = shared.accounts.read().await.values().cloned().collect();
    accounts.sort_by(|a, b| a.id.cmp(&b.id));

    let ts_snapshot: SyncTimestamps = shared.timestamps.read().await.clone();

    let rows: Vec<Value> = accounts
        .iter()
        .map(|account| {
            json!({
                "id": account.id,
                "vendor": account.vendor,
                "last_sync_at_unix": ts_snapshot.get(&account.id).copied().unwrap_or(0),
            })
        })
        .collect();

    let last_sync_at_unix = ts_snapshot.values().copied().max().unwrap_or(0);

    json!({
        "running": true,
        "label": DAEMON_LABEL,
        "started_at_unix": shared.started_at_unix,
        "last_sync_at_unix": last_sync_at_unix,
        "full_sync_interval_secs": shared.engine.config().full_sync_interval_secs,
        "accounts": rows,
        "socket": socket_path(&shared.home).display().to_string(),
    })
}

async fn refresh_cache(shared: &Shared) -> Result<(), DaemonError> {
    let home = shared.home.clone();
    let refreshed = tokio::task::spawn_blocking(move || load_account_cache(&home))
        .await
        .map_err(|err| DaemonError::Protocol(format!("cache refresh join error: {err}")))??;
    *shared.accounts.write().await = refreshed;
    Ok(())
}

fn load_account_cache(home: &Path) -> Result<AccountCache, DaemonError> {
    Ok(registry::list_accounts_at(home)?
        .into_iter()
        .map(|account| (account.id.clone(), account))
        .collect())
}

fn reload_account(home: &Path, cache: &mut AccountCache, id: &AccountId) -> Result<(), DaemonError> {
    match registry::load_account_at(home, id) {
        Ok(account) => {
            cache.insert(id.clone(), account);
            Ok(())
        }
        Err(cloudsync_core::RegistryError::AccountNotFound { .. }) => {
            cache.remove(id);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
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

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [run_dir(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
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

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Log to `~/.cloudsync/logs/daemon.log`, or stdout when it cannot be opened.
fn init_tracing(home: &Path) {
    use std::sync::Mutex;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log = log_path(home);
    match fs::OpenOptions::new().create(true).append(true).open(&log) {
        Ok(file) => {
            let _ = fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(_) => {
            let _ = fmt().with_env_filter(filter).with_target(false).try_init();
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    use cloudsync_core::config::EngineConfig;
    use cloudsync_core::types::{CloudResource, ResourceType, SyncStatus, Vendor};
    use cloudsync_sync::cloud::{cloud_dir_at, CloudSnapshot};
    use cloudsync_sync::{ConditionalSyncRequest, ErrorClass};
    use tempfile::TempDir;

    fn shared(home: &Path) -> Shared {
        Shared {
            home: home.to_path_buf(),
            engine: Arc::new(SyncEngine::open_at(home, EngineConfig::default())),
            accounts: Arc::new(RwLock::new(load_account_cache(home).expect("cache"))),
            timestamps: Arc::new(RwLock::new(SyncTimestamps::new())),
            started_at_unix: 1_000_000,
        }
    }

    fn seed_account(home: &Path) {
        registry::register_at(home, AccountId::from("acct-1"), Vendor::Aws, None).expect("register");
        let snapshot = CloudSnapshot {
            resources: vec![
                CloudResource::new(ResourceType::Region, "r1"),
                CloudResource::new(ResourceType::Zone, "r1-a").in_region("r1"),
                CloudResource::new(ResourceType::Image, "ami-1").in_region("r1"),
                CloudResource::new(ResourceType::Vpc, "vpc-1").in_region("r1"),
            ],
            ..CloudSnapshot::default()
        };
        let dir = cloud_dir_at(home);
        fs::create_dir_all(&dir).expect("cloud dir");
        fs::write(dir.join("acct-1.yaml"), inventory_json(&snapshot)).expect("write inventory");
    }

    fn inventory_json(snapshot: &CloudSnapshot) -> String {
        // The daemon crate only carries serde_json; JSON is valid YAML.
        serde_json::to_string(snapshot).expect("encode inventory")
    }

    fn request(cmd: &str) -> DaemonRequest {
        DaemonRequest {
            account: Some("acct-1".into()),
            ..DaemonRequest::new(cmd)
        }
    }

    #[test]
    fn account_cache_reload_tracks_registry() {
        let home = TempDir::new().expect("home");
        let mut cache = load_account_cache(home.path()).expect("load");
        assert!(cache.is_empty());

        registry::register_at(home.path(), AccountId::from("acct-1"), Vendor::Gcp, None)
            .expect("register");
        reload_account(home.path(), &mut cache, &AccountId::from("acct-1")).expect("reload");
        assert_eq!(cache.len(), 1);

        registry::remove_at(home.path(), &AccountId::from("acct-1")).expect("remove");
        reload_account(home.path(), &mut cache, &AccountId::from("acct-1")).expect("reload");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn status_payload_before_any_sync() {
        let home = TempDir::new().expect("home");
        let payload = build_status_payload(&shared(home.path())).await;

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000_000u64));
        assert_eq!(payload["last_sync_at_unix"], json!(0u64));
        assert!(payload["accounts"].as_array().expect("accounts").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_account_then_status_over_dispatch() {
        let home = TempDir::new().expect("home");
        seed_account(home.path());
        let shared = shared(home.path());
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let response = dispatch(&shared, request("sync_account"), &shutdown_tx).await;
        assert!(response.ok, "{:?}", response.error);
        let data = response.data.expect("report");
        assert_eq!(data["account_id"], json!("acct-1"));

        let status = dispatch(&shared, request("sync_status"), &shutdown_tx).await;
        let rows = status.data.expect("rows");
        let rows = rows.as_array().expect("array");
        assert!(rows
            .iter()
            .all(|r| r["res_status"] == json!(SyncStatus::Succeeded)));

        let payload = build_status_payload(&shared).await;
        assert!(payload["last_sync_at_unix"].as_u64().unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_resource_reports_started_and_conflicts_are_classified() {
        let home = TempDir::new().expect("home");
        seed_account(home.path());
        let shared = shared(home.path());
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        assert!(dispatch(&shared, request("sync_account"), &shutdown_tx).await.ok);

        let held = shared
            .engine
            .locks()
            .lock_account(&AccountId::from("acct-1"))
            .expect("hold lock");
        let conditional = DaemonRequest {
            vendor: Some(Vendor::Aws),
            resource_type: Some(ResourceType::Vpc),
            request: Some(ConditionalSyncRequest {
                regions: vec!["r1".into()],
                ..ConditionalSyncRequest::default()
            }),
            ..request("sync_resource")
        };
        let busy = dispatch(&shared, conditional.clone(), &shutdown_tx).await;
        assert!(!busy.ok);
        assert_eq!(busy.class, Some(ErrorClass::Conflict));
        assert_eq!(busy.error.as_deref(), Some("synchronization is in progress"));
        drop(held);

        let started = dispatch(&shared, conditional, &shutdown_tx).await;
        assert!(started.ok, "{:?}", started.error);
        assert_eq!(started.data.expect("ack")["status"], json!("started"));
    }

    #[tokio::test]
    async fn unknown_account_and_command_are_invalid() {
        let home = TempDir::new().expect("home");
        let shared = shared(home.path());
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let missing = dispatch(&shared, request("sync_status"), &shutdown_tx).await;
        assert!(!missing.ok);
        assert_eq!(missing.class, Some(ErrorClass::Invalid));

        let unknown = dispatch(&shared, DaemonRequest::new("reboot"), &shutdown_tx).await;
        assert_eq!(unknown.error.as_deref(), Some("unknown command 'reboot'"));
    }

    #[tokio::test]
    async fn stop_broadcasts_shutdown() {
        let home = TempDir::new().expect("home");
        let shared = shared(home.path());
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        let response = dispatch(&shared, DaemonRequest::new("stop"), &shutdown_tx).await;
        assert!(response.ok);
        shutdown_rx.recv().await.expect("shutdown signal");
    }
}
