/// 监听器生命周期管理
///
/// [`ListenerManager`] 最多持有一个运行中的监听器；start / stop / reset / reconfigure
/// 在同一个异步互斥锁上串行执行，`is_running` 读取独立的同步标志，从不等待
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{ProxyConfiguration, ProxyMode};
use crate::error::{ProxyError, Result};
use crate::handler::{build_handler, ConnectionHandler};
use crate::stats::{ConnectionGuard, ListenerStats, StatsTracker};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What a caller gets back from a successful start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    pub mode: ProxyMode,
    pub local_addr: SocketAddr,
}

struct ActiveListener {
    handle: ListenerHandle,
    /// Stops the accept loop.
    shutdown: CancellationToken,
    /// Cancels in-flight connections once the shutdown deadline passes.
    connections_cancel: CancellationToken,
    connections: TaskTracker,
    accept_task: JoinHandle<()>,
    stats: StatsTracker,
    shutdown_timeout: Option<Duration>,
}

#[derive(Default)]
struct Published {
    running: Option<(ListenerHandle, StatsTracker)>,
    last_stats: Option<ListenerStats>,
}

/// Owns the single active listener.
pub struct ListenerManager {
    config: RwLock<ProxyConfiguration>,
    active: Mutex<Option<ActiveListener>>,
    published: RwLock<Published>,
}

impl ListenerManager {
    pub fn new(config: ProxyConfiguration) -> Self {
        Self {
            config: RwLock::new(config),
            active: Mutex::new(None),
            published: RwLock::new(Published::default()),
        }
    }

    /// Configuration snapshot used by the next start.
    pub fn config(&self) -> ProxyConfiguration {
        self.config.read().clone()
    }

    /// Replace the configuration without touching a running listener.
    pub fn set_config(&self, config: ProxyConfiguration) {
        *self.config.write() = config;
    }

    pub fn is_running(&self) -> bool {
        self.published.read().running.is_some()
    }

    pub fn handle(&self) -> Option<ListenerHandle> {
        self.published.read().running.as_ref().map(|(h, _)| *h)
    }

    /// Statistics of the running listener, or of the last one if stopped.
    pub fn stats(&self) -> Option<ListenerStats> {
        let published = self.published.read();
        match &published.running {
            Some((_, tracker)) => Some(tracker.snapshot()),
            None => published.last_stats.clone(),
        }
    }

    /// Bind and start accepting in `mode`.
    ///
    /// Fails with [`ProxyError::AlreadyRunning`] if a listener is active.
    pub async fn start(&self, mode: ProxyMode) -> Result<ListenerHandle> {
        let mut active = self.active.lock().await;
        self.start_locked(&mut active, mode).await
    }

    /// Close the listener. In-flight connections drain on their own, or are
    /// cancelled once the configured shutdown deadline passes. Stopping a
    /// stopped manager does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        self.stop_locked(&mut active).await;
        Ok(())
    }

    /// Stop (if running) and start in `mode` as one operation.
    pub async fn reset(&self, mode: ProxyMode) -> Result<ListenerHandle> {
        let mut active = self.active.lock().await;
        self.stop_locked(&mut active).await;
        self.start_locked(&mut active, mode).await
    }

    /// Install a new configuration; a running listener is reset to the new
    /// configuration's mode, a stopped one stays stopped.
    pub async fn reconfigure(&self, config: ProxyConfiguration) -> Result<Option<ListenerHandle>> {
        let mut active = self.active.lock().await;
        let mode = config.mode();
        self.set_config(config);

        if active.is_none() {
            debug!("Configuration updated; no listener running");
            return Ok(None);
        }

        info!("Configuration changed, restarting proxy listener in {} mode", mode);
        self.stop_locked(&mut active).await;
        self.start_locked(&mut active, mode).await.map(Some)
    }

    async fn start_locked(
        &self,
        active: &mut Option<ActiveListener>,
        mode: ProxyMode,
    ) -> Result<ListenerHandle> {
        if active.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let mut config = self.config();
        config.forwarding_enabled = mode == ProxyMode::Forwarding;
        config
            .validate()
            .map_err(|e| ProxyError::config_error(format!("{:#}", e)))?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::listen_error(addr.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::listen_error(addr.clone(), e))?;

        let stats = StatsTracker::new(mode, local_addr.to_string());
        let handler = build_handler(mode, &config, stats.clone());
        let handle = ListenerHandle { mode, local_addr };

        let shutdown = CancellationToken::new();
        let connections_cancel = CancellationToken::new();
        let connections = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            handler,
            AcceptContext {
                shutdown: shutdown.clone(),
                connections_cancel: connections_cancel.clone(),
                connections: connections.clone(),
                stats: stats.clone(),
                verbose: config.verbose,
            },
        ));

        info!("Proxy listener started on {} ({} mode)", local_addr, mode);

        *active = Some(ActiveListener {
            handle,
            shutdown,
            connections_cancel,
            connections,
            accept_task,
            stats: stats.clone(),
            shutdown_timeout: config.shutdown_timeout(),
        });
        self.published.write().running = Some((handle, stats));

        Ok(handle)
    }

    async fn stop_locked(&self, active: &mut Option<ActiveListener>) {
        let Some(listener) = active.take() else {
            debug!("No proxy listener currently running");
            return;
        };

        listener.shutdown.cancel();
        // 等待 accept 循环退出，保证端口已释放
        if let Err(e) = listener.accept_task.await {
            error!("Accept loop for {} ended abnormally: {}", listener.handle.local_addr, e);
        }
        listener.connections.close();

        match listener.shutdown_timeout {
            Some(deadline) => {
                if timeout(deadline, listener.connections.wait()).await.is_err() {
                    warn!(
                        "{} connection(s) still open after {:?}, closing them",
                        listener.connections.len(),
                        deadline
                    );
                    listener.connections_cancel.cancel();
                    listener.connections.wait().await;
                }
            }
            None => {
                if !listener.connections.is_empty() {
                    info!(
                        "{} connection(s) left to drain",
                        listener.connections.len()
                    );
                }
            }
        }

        let snapshot = listener.stats.snapshot();
        info!(
            "Proxy listener on {} stopped: {}",
            listener.handle.local_addr,
            serde_json::to_string(&snapshot).unwrap_or_default()
        );

        let mut published = self.published.write();
        published.running = None;
        published.last_stats = Some(snapshot);
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        if let Some(listener) = self.active.get_mut().take() {
            listener.shutdown.cancel();
        }
    }
}

struct AcceptContext {
    shutdown: CancellationToken,
    connections_cancel: CancellationToken,
    connections: TaskTracker,
    stats: StatsTracker,
    verbose: bool,
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    ctx: AcceptContext,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_connection(stream, peer, &handler, &ctx),
                Err(e) => {
                    let err = ProxyError::AcceptError(e);
                    error!("{}", err);
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    debug!("{}", ProxyError::ListenerClosed);
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: &Arc<dyn ConnectionHandler>,
    ctx: &AcceptContext,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if ctx.verbose {
        info!("Accepted connection from {}", peer);
    } else {
        debug!("Accepted connection from {}", peer);
    }

    let guard = ConnectionGuard::new(ctx.stats.clone());
    let handler = handler.clone();
    let cancel = ctx.connections_cancel.clone();

    ctx.connections.spawn(async move {
        let _guard = guard;
        tokio::select! {
            result = handler.handle(stream, peer) => {
                if let Err(e) = result {
                    log_connection_error(&e, peer);
                }
            }
            _ = cancel.cancelled() => {
                debug!("Connection from {} closed at shutdown deadline", peer);
            }
        }
    });
}

fn log_connection_error(e: &ProxyError, peer: SocketAddr) {
    if !e.is_connection_scoped() {
        error!("Connection from {} hit a listener-level error: {}", peer, e);
        return;
    }
    match e {
        ProxyError::SniMissing { .. } | ProxyError::Timeout { .. } => {
            debug!("Connection from {} rejected: {}", peer, e)
        }
        ProxyError::UpstreamDialError { .. } | ProxyError::UpstreamRefused { .. } => {
            warn!("Connection from {} failed: {}", peer, e)
        }
        _ => debug!("Connection from {} ended with error: {}", peer, e),
    }
}
