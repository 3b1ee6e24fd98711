//! Owns the listener: start, stop and restart in response to the operator,
//! settings changes and network transitions.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::AccessControl;
use crate::events::ChangeNotifier;
use crate::settings::{Settings, SettingsStore};
use crate::storage::SharedFolder;
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Running { ip: IpAddr, port: u16 },
    AwaitingNetwork,
    UserStopped,
    Error { message: String },
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running { ip, port } => write!(f, "running at http://{}", SocketAddr::new(*ip, *port)),
            Self::AwaitingNetwork => f.write_str("waiting for a network connection"),
            Self::UserStopped => f.write_str("stopped"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub host: IpAddr,
    pub port: u16,
    /// How long in-flight requests may drain on stop.
    pub grace: Duration,
    pub chunk_size: usize,
    pub cors_origins: Option<String>,
}

struct RunningServer {
    /// Stops accepting and lets in-flight requests drain.
    token: CancellationToken,
    /// Cuts off whatever is still running once the grace period is over.
    hard: CancellationToken,
    task: JoinHandle<()>,
    addr: SocketAddr,
}

#[derive(Default)]
struct Slot {
    folder: Option<Arc<dyn SharedFolder>>,
    running: Option<RunningServer>,
}

struct Inner {
    config: LifecycleConfig,
    settings: SettingsStore,
    access: AccessControl,
    notifier: ChangeNotifier,
    network: watch::Receiver<Option<IpAddr>>,
    state: watch::Sender<ServerState>,
    slot: Mutex<Slot>,
}

/// Handle to the server state machine. Transitions are serialized.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(
        config: LifecycleConfig,
        settings: SettingsStore,
        access: AccessControl,
        notifier: ChangeNotifier,
        network: watch::Receiver<Option<IpAddr>>,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::UserStopped);
        Self {
            inner: Arc::new(Inner {
                config,
                settings,
                access,
                notifier,
                network,
                state,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn access(&self) -> &AccessControl {
        &self.inner.access
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Address the current listener is bound to, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.slot.lock().await.running.as_ref().map(|r| r.addr)
    }

    /// Share `folder` and (re)start serving it.
    pub async fn start(&self, folder: Arc<dyn SharedFolder>) -> ServerState {
        let mut slot = self.inner.slot.lock().await;
        info!(folder = %folder.describe(), "sharing folder");
        slot.folder = Some(folder);
        self.restart_locked(&mut slot).await
    }

    /// Restart with the folder already configured.
    pub async fn restart(&self) -> ServerState {
        let mut slot = self.inner.slot.lock().await;
        self.restart_locked(&mut slot).await
    }

    /// Stop serving until the operator starts again.
    pub async fn stop(&self) -> ServerState {
        let mut slot = self.inner.slot.lock().await;
        self.shutdown_listener(&mut slot).await;
        self.set_state(ServerState::UserStopped)
    }

    /// React to the network observer's latest address.
    pub async fn on_network_change(&self) -> ServerState {
        let mut slot = self.inner.slot.lock().await;
        let address = *self.inner.network.borrow();
        let current = self.state();
        match (&current, address) {
            (ServerState::UserStopped | ServerState::Error { .. }, _) => {
                debug!(state = %current, "ignoring network change");
                current
            }
            (ServerState::Running { ip, .. }, Some(new)) if *ip == new => current,
            (ServerState::AwaitingNetwork, None) => current,
            (_, None) => {
                warn!("network lost; stopping listener");
                self.shutdown_listener(&mut slot).await;
                self.set_state(ServerState::AwaitingNetwork)
            }
            (_, Some(new)) => {
                info!(ip = %new, "network address changed; restarting");
                self.restart_locked(&mut slot).await
            }
        }
    }

    /// Restart if a gate setting changed while running.
    pub async fn on_settings_change(&self, previous: &Settings, next: &Settings) -> ServerState {
        let mut slot = self.inner.slot.lock().await;
        let current = self.state();
        if matches!(current, ServerState::Running { .. }) && previous.requires_restart(next) {
            info!("access settings changed; restarting");
            return self.restart_locked(&mut slot).await;
        }
        current
    }

    /// Drive the machine from network and settings observers until `shutdown`.
    pub fn spawn_supervisor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let lifecycle = self.clone();
        let mut network = self.inner.network.clone();
        let mut settings_rx = self.inner.settings.subscribe();
        let mut last_settings = settings_rx.borrow_and_update().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        network.borrow_and_update();
                        lifecycle.on_network_change().await;
                    }
                    changed = settings_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = settings_rx.borrow_and_update().clone();
                        lifecycle.on_settings_change(&last_settings, &next).await;
                        last_settings = next;
                    }
                }
            }
            lifecycle.stop().await;
            debug!("lifecycle supervisor stopped");
        })
    }

    fn set_state(&self, state: ServerState) -> ServerState {
        info!(state = %state, "server state");
        self.inner.state.send_replace(state.clone());
        state
    }

    async fn restart_locked(&self, slot: &mut Slot) -> ServerState {
        self.set_state(ServerState::Starting);
        self.shutdown_listener(slot).await;

        let Some(folder) = slot.folder.clone() else {
            return self.set_state(ServerState::Error {
                message: "Shared folder not set.".into(),
            });
        };
        if let Err(e) = folder.check_access().await {
            warn!(error = %e, "shared folder check failed");
            return self.set_state(ServerState::Error {
                message: "Shared folder not accessible.".into(),
            });
        }

        let Some(ip) = *self.inner.network.borrow() else {
            return self.set_state(ServerState::AwaitingNetwork);
        };

        let config = &self.inner.config;
        let bind = SocketAddr::new(config.host, config.port);
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                error!(%bind, "port already in use");
                return self.set_state(ServerState::Error {
                    message: format!("Port {} is already in use.", config.port),
                });
            }
            Err(e) => {
                error!(%bind, error = %e, "failed to bind listener");
                return self.set_state(ServerState::Error {
                    message: format!("Failed to start server: {e}"),
                });
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                return self.set_state(ServerState::Error {
                    message: format!("Failed to start server: {e}"),
                })
            }
        };

        let state = AppState::new(
            folder,
            self.inner.settings.clone(),
            self.inner.access.clone(),
            self.inner.notifier.clone(),
            config.chunk_size,
        );
        let hard = CancellationToken::new();
        let app = crate::server::router(state, config.cors_origins.as_deref()).layer(
            middleware::from_fn_with_state(hard.clone(), abort_on_hard_stop),
        );
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = served {
                error!(error = %e, "server error");
            }
        });

        info!(%addr, %ip, "transfer server listening");
        slot.running = Some(RunningServer {
            token,
            hard,
            task,
            addr,
        });
        self.set_state(ServerState::Running {
            ip,
            port: addr.port(),
        })
    }

    async fn shutdown_listener(&self, slot: &mut Slot) {
        let Some(RunningServer {
            token,
            hard,
            mut task,
            addr,
        }) = slot.running.take()
        else {
            return;
        };
        let grace = self.inner.config.grace;
        token.cancel();
        if tokio::time::timeout(grace, &mut task).await.is_ok() {
            debug!(%addr, "listener drained");
            return;
        }

        warn!(%addr, "grace period elapsed; closing remaining connections");
        hard.cancel();
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Outermost layer of every listener: once `hard` fires, pending handlers are
/// dropped with a 503 and response bodies still streaming end in an error.
async fn abort_on_hard_stop(
    State(hard): State<CancellationToken>,
    request: Request,
    next: Next,
) -> Response {
    let response = tokio::select! {
        response = next.run(request) => response,
        _ = hard.cancelled() => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Server stopped.").into_response();
        }
    };
    let (parts, body) = response.into_parts();
    let stopped = hard.clone();
    let data = body
        .into_data_stream()
        .take_until(hard.cancelled_owned())
        .chain(futures::stream::once(async move {
            if stopped.is_cancelled() {
                Err(axum::Error::new("server stopped mid-response"))
            } else {
                Ok(Bytes::new())
            }
        }));
    Response::from_parts(parts, Body::from_stream(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DEFAULT_APPROVAL_TTL;
    use crate::storage::LocalFolder;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn config(port: u16) -> LifecycleConfig {
        LifecycleConfig {
            host: LOCAL,
            port,
            grace: Duration::from_millis(200),
            chunk_size: 1024,
            cors_origins: None,
        }
    }

    fn make_lifecycle(
        port: u16,
        network: Option<IpAddr>,
    ) -> (Lifecycle, watch::Sender<Option<IpAddr>>) {
        let (net_tx, net_rx) = watch::channel(network);
        let lifecycle = Lifecycle::new(
            config(port),
            SettingsStore::new(Settings::default()),
            AccessControl::new(DEFAULT_APPROVAL_TTL),
            ChangeNotifier::new(),
            net_rx,
        );
        (lifecycle, net_tx)
    }

    #[tokio::test]
    async fn start_binds_and_reports_running() {
        let dir = tempdir().unwrap();
        let (lifecycle, _net) = make_lifecycle(0, Some(LOCAL));
        let state = lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await;
        let ServerState::Running { ip, port } = state else {
            panic!("expected running, got {state:?}");
        };
        assert_eq!(ip, LOCAL);
        assert_ne!(port, 0);
        assert_eq!(lifecycle.local_addr().await.unwrap().port(), port);

        assert_eq!(lifecycle.stop().await, ServerState::UserStopped);
        assert!(lifecycle.local_addr().await.is_none());
        assert!(tokio::net::TcpStream::connect((LOCAL, port)).await.is_err());
    }

    #[tokio::test]
    async fn missing_folder_is_an_error() {
        let dir = tempdir().unwrap();
        let folder = Arc::new(LocalFolder::new(dir.path().join("absent")));
        let (lifecycle, _net) = make_lifecycle(0, Some(LOCAL));
        assert_eq!(
            lifecycle.start(folder).await,
            ServerState::Error {
                message: "Shared folder not accessible.".into()
            }
        );
        assert_eq!(
            lifecycle.restart().await,
            ServerState::Error {
                message: "Shared folder not accessible.".into()
            }
        );
    }

    #[tokio::test]
    async fn restart_without_folder_is_an_error() {
        let (lifecycle, _net) = make_lifecycle(0, Some(LOCAL));
        assert_eq!(
            lifecycle.restart().await,
            ServerState::Error {
                message: "Shared folder not set.".into()
            }
        );
    }

    #[tokio::test]
    async fn occupied_port_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = std::net::TcpListener::bind((LOCAL, 0)).unwrap();
        let port = blocker.local_addr().unwrap().port();
        let (lifecycle, _net) = make_lifecycle(port, Some(LOCAL));
        assert_eq!(
            lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await,
            ServerState::Error {
                message: format!("Port {port} is already in use.")
            }
        );
    }

    #[tokio::test]
    async fn no_network_waits_then_starts_when_address_appears() {
        let dir = tempdir().unwrap();
        let (lifecycle, net) = make_lifecycle(0, None);
        assert_eq!(
            lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await,
            ServerState::AwaitingNetwork
        );

        net.send_replace(Some(LOCAL));
        assert!(matches!(
            lifecycle.on_network_change().await,
            ServerState::Running { .. }
        ));
        lifecycle.stop().await;
    }

    #[tokio::test]
    async fn network_loss_and_new_address_rebinds() {
        let dir = tempdir().unwrap();
        let (lifecycle, net) = make_lifecycle(0, Some(LOCAL));
        lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await;
        let first = lifecycle.local_addr().await.unwrap();

        net.send_replace(None);
        assert_eq!(
            lifecycle.on_network_change().await,
            ServerState::AwaitingNetwork
        );
        assert!(lifecycle.local_addr().await.is_none());
        assert!(tokio::net::TcpStream::connect(first).await.is_err());

        let lan = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        net.send_replace(Some(lan));
        let state = lifecycle.on_network_change().await;
        assert!(matches!(state, ServerState::Running { ip, .. } if ip == lan));
        assert!(lifecycle.local_addr().await.is_some());
        lifecycle.stop().await;
    }

    #[tokio::test]
    async fn user_stop_ignores_network_changes() {
        let dir = tempdir().unwrap();
        let (lifecycle, net) = make_lifecycle(0, Some(LOCAL));
        lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await;
        lifecycle.stop().await;

        net.send_replace(Some(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9))));
        assert_eq!(lifecycle.on_network_change().await, ServerState::UserStopped);
        assert!(lifecycle.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn gate_settings_restart_only_while_running() {
        let dir = tempdir().unwrap();
        let (lifecycle, _net) = make_lifecycle(0, Some(LOCAL));
        let before = Settings::default();
        let mut after = before.clone();
        after.password = Some("secret".into());

        assert_eq!(
            lifecycle.on_settings_change(&before, &after).await,
            ServerState::UserStopped
        );

        lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await;
        let mut states = lifecycle.subscribe();
        states.mark_unchanged();
        assert!(matches!(
            lifecycle.on_settings_change(&before, &after).await,
            ServerState::Running { .. }
        ));
        assert!(states.has_changed().unwrap());
        lifecycle.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_requests_waiting_for_approval() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempdir().unwrap();
        let (lifecycle, _net) = make_lifecycle(0, Some(LOCAL));
        lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await;
        let addr = lifecycle.local_addr().await.unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /api/ping HTTP/1.1\r\nHost: transfer\r\n\r\n")
            .await
            .unwrap();
        let broker = lifecycle.access().broker().clone();
        while broker.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(lifecycle.stop().await, ServerState::UserStopped);
        assert!(broker.pending().is_empty());

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .expect("connection should be closed after stop")
            .unwrap();
        let reply = String::from_utf8_lossy(&reply);
        assert!(reply.starts_with("HTTP/1.1 503"), "got {reply:?}");

        // A late decision must not reach the stopped server.
        assert!(!lifecycle.access().broker().resolve(LOCAL, true));
    }

    #[tokio::test]
    async fn supervisor_follows_network_observer() {
        let dir = tempdir().unwrap();
        let (lifecycle, net) = make_lifecycle(0, Some(LOCAL));
        lifecycle.start(Arc::new(LocalFolder::new(dir.path()))).await;

        let shutdown = CancellationToken::new();
        let supervisor = lifecycle.spawn_supervisor(shutdown.clone());
        let mut states = lifecycle.subscribe();

        net.send_replace(None);
        let awaiting = states
            .wait_for(|s| *s == ServerState::AwaitingNetwork)
            .await
            .map(|s| s.clone());
        assert_eq!(awaiting.unwrap(), ServerState::AwaitingNetwork);

        shutdown.cancel();
        supervisor.await.unwrap();
        assert_eq!(lifecycle.state(), ServerState::UserStopped);
    }
}
