use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    access::{require_ip_approval, AccessControl, DEFAULT_APPROVAL_TTL},
    auth::require_password,
    events::ChangeNotifier,
    handlers::{
        asset, delete_api, delete_file, download, get_file, get_refresh_settings, index,
        list_files, not_found, panic_response, ping, put_file, set_refresh_settings,
        upload_files, zip_all,
    },
    lifecycle::{Lifecycle, LifecycleConfig, ServerState},
    network::{FixedAddress, NetworkMonitor, UdpRouteLookup},
    settings::SettingsStore,
    storage::LocalFolder,
    transfer::DEFAULT_CHUNK_SIZE,
    AppState,
};

pub const DEFAULT_PORT: u16 = 8000;

pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Folder to share immediately; without one the server waits for `start`.
    pub folder: Option<PathBuf>,
    /// Overrides the persisted password when set. An empty value clears it.
    pub password: Option<String>,
    /// Overrides the persisted IP-approval toggle when set.
    pub ip_approval: Option<bool>,
    pub approval_ttl: Duration,
    pub chunk_size: usize,
    pub cors_origins: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub grace: Duration,
    pub network_poll: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("TRANSFER_HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            port: std::env::var("TRANSFER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            folder: std::env::var("TRANSFER_FOLDER").ok().map(PathBuf::from),
            password: std::env::var("TRANSFER_PASSWORD").ok(),
            ip_approval: std::env::var("TRANSFER_IP_APPROVAL")
                .ok()
                .map(|v| v != "false" && v != "0"),
            approval_ttl: std::env::var("TRANSFER_APPROVAL_TTL")
                .ok()
                .and_then(|v| humantime::parse_duration(&v).ok())
                .unwrap_or(DEFAULT_APPROVAL_TTL),
            chunk_size: std::env::var("TRANSFER_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            cors_origins: std::env::var("TRANSFER_CORS_ORIGINS").ok(),
            data_dir: std::env::var("TRANSFER_DATA_DIR").ok().map(PathBuf::from),
            grace: Duration::from_secs(2),
            network_poll: Duration::from_secs(5),
        }
    }
}

/// Resolve the directory holding `settings.json`, creating it if needed.
///
/// An explicit directory wins; otherwise the platform config dir
/// (`~/.config/transfer/` and the like) is used.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "transfer")
            .context("could not determine platform config directory")?
            .config_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// A pinned bind host is the address clients use; otherwise ask the routing table.
fn network_monitor(host: IpAddr) -> NetworkMonitor {
    if host.is_unspecified() {
        NetworkMonitor::new(UdpRouteLookup::default())
    } else {
        NetworkMonitor::new(FixedAddress(Some(host)))
    }
}

/// Build the HTTP surface for one server run.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let cors = build_cors(cors_origins);

    // Public routes (UI assets only).
    let public = Router::new().route("/assets/{*path}", get(asset));

    // Protected routes: password first, then IP approval.
    let protected = Router::new()
        .route("/", get(index))
        .route("/api/ping", get(ping))
        .route(
            "/api/refresh-settings",
            get(get_refresh_settings).post(set_refresh_settings),
        )
        .route("/api/files", get(list_files))
        .route("/api/download/{name}", get(download))
        .route("/api/zip", get(zip_all))
        .route("/api/upload", post(upload_files))
        .route("/api/delete", post(delete_api))
        .route("/{name}", get(get_file).put(put_file).delete(delete_file))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_ip_approval,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_password,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

/// Everything a running process holds on to.
pub struct ServerHandle {
    pub lifecycle: Lifecycle,
    pub network: NetworkMonitor,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn settings(&self) -> &SettingsStore {
        self.lifecycle.settings()
    }

    pub fn access(&self) -> &AccessControl {
        self.lifecycle.access()
    }

    /// Stop the listener and background observers.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.lifecycle.stop().await;
    }
}

/// Load settings, start the observers and share `cfg.folder` if given.
pub async fn run(cfg: ServerConfig) -> Result<ServerHandle> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let settings =
        SettingsStore::load(data_dir.join("settings.json")).context("load settings")?;
    if let Some(password) = cfg.password {
        settings.set_password(Some(password)).context("apply password")?;
    }
    if let Some(enabled) = cfg.ip_approval {
        settings.set_ip_approval(enabled).context("apply IP approval")?;
    }
    let current = settings.current();
    info!(
        password = current.password().is_some(),
        ip_approval = current.ip_approval,
        approval_ttl = %humantime::format_duration(cfg.approval_ttl),
        "access gates"
    );

    let network = network_monitor(cfg.host);
    match network.current() {
        Some(ip) => info!(%ip, "network address"),
        None => info!("no network address yet"),
    }

    let lifecycle = Lifecycle::new(
        LifecycleConfig {
            host: cfg.host,
            port: cfg.port,
            grace: cfg.grace,
            chunk_size: cfg.chunk_size,
            cors_origins: cfg.cors_origins,
        },
        settings,
        AccessControl::new(cfg.approval_ttl),
        ChangeNotifier::new(),
        network.subscribe(),
    );

    let shutdown = CancellationToken::new();
    let tasks = vec![
        lifecycle.spawn_supervisor(shutdown.clone()),
        network.clone().spawn(cfg.network_poll, shutdown.clone()),
    ];

    if let Some(folder) = cfg.folder {
        let state = lifecycle.start(Arc::new(LocalFolder::new(folder))).await;
        if let ServerState::Error { message } = &state {
            tracing::warn!(%message, "server did not start");
        }
    }

    Ok(ServerHandle {
        lifecycle,
        network,
        shutdown,
        tasks,
    })
}
