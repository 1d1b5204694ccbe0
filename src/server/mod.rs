//! TCP RPC server: accept loop and per-connection sessions.

mod session;

pub use session::Session;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::registry::{Registry, Service};
use crate::types::{Result, ServerConfig};

/// RPC server: a service registry plus a TCP accept loop.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    listener: Option<TcpListener>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
}

impl Server {
    /// Server that will bind `addr` on `listen_and_serve`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_config(ServerConfig {
            listen_addr: addr.into(),
            ..ServerConfig::default()
        })
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            listener: None,
            registry: Arc::new(Registry::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Serve on an already-bound listener.
    pub fn with_listener(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener: Some(listener),
            ..Self::with_config(config)
        }
    }

    /// Register a service. See [`Registry::register`].
    pub fn register<T: Service>(&self, receiver: T) -> Result<()> {
        self.registry.register(receiver)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the configured address unless a listener is already present.
    pub async fn bind(&mut self) -> std::io::Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr();
        }
        let listener = TcpListener::bind(self.config.listen_addr.as_str()).await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Address the listener is bound to, if bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind if needed, then serve until shutdown or an accept error.
    pub async fn listen_and_serve(&mut self) -> std::io::Result<()> {
        self.bind().await?;
        self.serve().await
    }

    /// Run the accept loop over the bound listener until shutdown or an
    /// accept error. Each connection gets its own task.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "server is not bound")
        })?;
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "RPC server listening on {} (max_connections={}, services={:?})",
            listener.local_addr()?,
            self.config.max_connections,
            self.registry.service_names(),
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("RPC server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("RPC connection from {} (active={})",
                        peer,
                        self.config.max_connections - conn_semaphore.available_permits(),
                    );
                    let session = Session::new(stream, self.registry.clone())
                        .with_config(&self.config)
                        .with_cancel(self.cancel.child_token());
                    tokio::spawn(async move {
                        match session.serve().await {
                            Ok(()) => tracing::debug!("Connection from {} closed", peer),
                            Err(e) => tracing::warn!("Connection from {} error: {}", peer, e),
                        }
                        drop(permit);
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop the accept loop and every open session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token that fires on [`Server::shutdown`]. Useful when the server
    /// itself has moved into a task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
