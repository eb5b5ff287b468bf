use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::watch;

use crate::control::{ControlState, router};
use crate::error::{MosaicError, Result};
use crate::registry::ChannelRegistry;
use crate::session::{DEFAULT_RTP_PORT, SessionManager};

/// How long open connections may hold up [`ControlServer::stop`] before
/// they are dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Control server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    pub bind_addr: String,
    /// RTP destination port when a start request names none.
    pub default_rtp_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            default_rtp_port: DEFAULT_RTP_PORT,
        }
    }
}

/// HTTP control server in front of a [`SessionManager`].
///
/// Runs the control [`router`] on its own tokio runtime, driven from a
/// dedicated thread, so callers stay synchronous. Stopping the server closes
/// the listener but leaves sessions running; call
/// [`SessionManager::shutdown`] to drain them.
pub struct ControlServer {
    session_manager: SessionManager,
    registry: Arc<ChannelRegistry>,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    serve_thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn new(session_manager: SessionManager, registry: ChannelRegistry, config: ServerConfig) -> Self {
        Self {
            session_manager,
            registry: Arc::new(registry),
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            shutdown: None,
            serve_thread: None,
        }
    }

    /// Bind and start serving. Bind errors are returned here rather than
    /// from the serving thread.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(MosaicError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("control-http")
            .enable_all()
            .build()?;
        let app = router(ControlState::new(
            self.session_manager.clone(),
            self.registry.clone(),
            self.config.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        tracing::info!(addr = %local_addr, channels = self.registry.len(), "control server listening");

        let spawned = thread::Builder::new()
            .name("control-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            tracing::error!(error = %e, "control listener unusable");
                            return;
                        }
                    };
                    let mut signal = shutdown_rx.clone();
                    let mut deadline = shutdown_rx;
                    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                        let _ = signal.wait_for(|&stop| stop).await;
                    });
                    tokio::select! {
                        served = serve => {
                            if let Err(e) = served {
                                tracing::error!(error = %e, "control server failed");
                            }
                        }
                        _ = async move {
                            let _ = deadline.wait_for(|&stop| stop).await;
                            tokio::time::sleep(SHUTDOWN_GRACE).await;
                        } => {
                            tracing::warn!(grace = ?SHUTDOWN_GRACE, "dropping control connections still open");
                        }
                    }
                });
                runtime.shutdown_timeout(Duration::from_secs(1));
                running.store(false, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                self.shutdown = Some(shutdown_tx);
                self.serve_thread = Some(handle);
                self.local_addr = Some(local_addr);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop accepting connections. Open connections get a short grace
    /// period to finish, then the runtime is torn down.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.serve_thread.take()
            && handle.join().is_err()
        {
            tracing::error!("control server thread panicked");
        }
        self.running.store(false, Ordering::SeqCst);
        self.local_addr = None;
        tracing::info!("control server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address while running. Useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.serve_thread.is_some() {
            self.stop();
        }
    }
}
